//! Append-log configuration.

use crate::error::{AppLogError, AppResult};
use timber_common::constants::{DEFAULT_FILE_MODE, DEFAULT_FILE_SIZE};

/// Default size of the in-memory write buffer (64 KB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for an append log.
#[derive(Debug, Clone)]
pub struct AppendOptions {
    /// Rollover threshold: each backing file grows to at most this size.
    pub file_size: u64,
    /// Extension of the backing files (e.g. `t`, `hx`).
    pub file_ext: String,
    /// Permission bits for newly created files.
    pub file_mode: u32,
    /// Size of the in-memory write buffer.
    pub write_buffer_size: usize,
    /// Whether the log rejects writes.
    pub read_only: bool,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            file_size: DEFAULT_FILE_SIZE,
            file_ext: "dat".to_string(),
            file_mode: DEFAULT_FILE_MODE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_only: false,
        }
    }
}

impl AppendOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-file rollover size.
    #[must_use]
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Sets the file extension.
    #[must_use]
    pub fn with_file_ext(mut self, ext: impl Into<String>) -> Self {
        self.file_ext = ext.into();
        self
    }

    /// Sets the permission bits for new files.
    #[must_use]
    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Sets the write buffer size.
    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> AppResult<()> {
        if self.file_size < 4096 {
            return Err(AppLogError::config("file size must be at least 4 KB"));
        }
        if self.file_ext.is_empty() || !self.file_ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppLogError::config(
                "file extension must be non-empty and alphanumeric",
            ));
        }
        if self.write_buffer_size < 512 {
            return Err(AppLogError::config(
                "write buffer size must be at least 512 bytes",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppendOptions::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let opts = AppendOptions::new()
            .with_file_size(1 << 20)
            .with_file_ext("t")
            .with_write_buffer_size(4096)
            .with_read_only(true);

        assert_eq!(opts.file_size, 1 << 20);
        assert_eq!(opts.file_ext, "t");
        assert_eq!(opts.write_buffer_size, 4096);
        assert!(opts.read_only);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_file_size() {
        let opts = AppendOptions::new().with_file_size(128);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_extension() {
        assert!(AppendOptions::new().with_file_ext("").validate().is_err());
        assert!(AppendOptions::new()
            .with_file_ext("a.b")
            .validate()
            .is_err());
    }
}
