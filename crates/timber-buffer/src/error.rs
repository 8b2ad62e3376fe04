//! Page-cache error types.

use thiserror::Error;

/// Result type for page-cache operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur during page-cache operations.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Every frame is pinned; nothing can be evicted.
    #[error("page cache exhausted: all frames are pinned")]
    CacheExhausted,

    /// The caller-supplied loader failed to fill the frame.
    #[error("page load failed: {source}")]
    Load {
        /// The loader's error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert!(BufferError::CacheExhausted.to_string().contains("pinned"));
    }
}
