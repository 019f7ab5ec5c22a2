//! Compaction error types.

/// Errors that can occur during compaction.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    /// The injected summarizer failed.
    #[error("Summarizer error: {0}")]
    Summarizer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = CompactionError::Summarizer("model unavailable".into());
        assert_eq!(err.to_string(), "Summarizer error: model unavailable");
    }
}
