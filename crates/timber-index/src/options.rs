//! Tree configuration.

use std::io;
use std::path::Path;
use std::sync::Arc;

use timber_applog::{AppResult, AppendLog, AppendOptions, SegmentedLog};
use timber_buffer::PageCache;
use timber_common::constants::{
    DEFAULT_FILE_MODE, DEFAULT_FILE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use timber_common::TreeId;

use crate::error::{TreeError, TreeResult};
use crate::writebuf::WriteBuffer;

/// Default background-sync threshold (32 MB of unsynced log bytes).
pub const DEFAULT_SYNC_THLD: u64 = 32 * 1024 * 1024;

/// Default stale-page ratio beyond which compaction should run.
pub const DEFAULT_COMPACTION_THLD: f32 = 0.5;

/// Default bound on concurrently open read snapshots.
pub const DEFAULT_MAX_ACTIVE_SNAPSHOTS: usize = 100;

/// Produces the append log stored at `root/sub`.
pub type AppFactoryFn =
    Arc<dyn Fn(&Path, &str, &AppendOptions) -> AppResult<Arc<dyn AppendLog>> + Send + Sync>;

/// Lists a directory; recovery uses this to enumerate snapshot
/// directories.
pub type ReadDirFn = Arc<dyn Fn(&Path) -> io::Result<Vec<DirEntryInfo>> + Send + Sync>;

/// Removes `root/sub` after a failed snapshot recovery.
pub type AppRemoveFn = Arc<dyn Fn(&Path, &str) -> io::Result<()> + Send + Sync>;

/// One directory entry as seen by recovery.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// File or directory name.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Configuration for opening a tree.
///
/// The write buffer and the page cache are mandatory shared handles;
/// everything else has defaults.
pub struct Options {
    pub(crate) id: TreeId,
    pub(crate) write_buffer: Option<WriteBuffer>,
    pub(crate) page_buffer: Arc<PageCache>,
    pub(crate) file_size: u64,
    pub(crate) file_mode: u32,
    pub(crate) app_write_buffer_size: usize,
    pub(crate) sync_thld: u64,
    pub(crate) compaction_thld: f32,
    pub(crate) read_only: bool,
    pub(crate) max_active_snapshots: usize,
    pub(crate) app_factory: AppFactoryFn,
    pub(crate) read_dir: ReadDirFn,
    pub(crate) app_remove: AppRemoveFn,
}

impl Options {
    /// Creates options around the shared write buffer and page cache.
    #[must_use]
    pub fn new(write_buffer: WriteBuffer, page_buffer: Arc<PageCache>) -> Self {
        Self {
            id: TreeId::default(),
            write_buffer: Some(write_buffer),
            page_buffer,
            file_size: DEFAULT_FILE_SIZE,
            file_mode: DEFAULT_FILE_MODE,
            app_write_buffer_size: 64 * 1024,
            sync_thld: DEFAULT_SYNC_THLD,
            compaction_thld: DEFAULT_COMPACTION_THLD,
            read_only: false,
            max_active_snapshots: DEFAULT_MAX_ACTIVE_SNAPSHOTS,
            app_factory: default_app_factory(),
            read_dir: default_read_dir(),
            app_remove: default_app_remove(),
        }
    }

    /// Sets the tree id used to key the shared page cache.
    #[must_use]
    pub fn with_tree_id(mut self, id: TreeId) -> Self {
        self.id = id;
        self
    }

    /// Sets the log-file rollover size.
    #[must_use]
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Sets the permission bits for new log files.
    #[must_use]
    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Sets the append-log write buffer size.
    #[must_use]
    pub fn with_app_write_buffer_size(mut self, size: usize) -> Self {
        self.app_write_buffer_size = size;
        self
    }

    /// Sets the unsynced-bytes threshold that triggers background sync.
    #[must_use]
    pub fn with_sync_thld(mut self, bytes: u64) -> Self {
        self.sync_thld = bytes;
        self
    }

    /// Sets the stale-page ratio that marks the tree as compactable.
    #[must_use]
    pub fn with_compaction_thld(mut self, ratio: f32) -> Self {
        self.compaction_thld = ratio;
        self
    }

    /// Opens the tree in read-only mode.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Bounds the number of concurrently open read snapshots.
    #[must_use]
    pub fn with_max_active_snapshots(mut self, max: usize) -> Self {
        self.max_active_snapshots = max;
        self
    }

    /// Overrides how append logs are produced.
    #[must_use]
    pub fn with_app_factory(mut self, factory: AppFactoryFn) -> Self {
        self.app_factory = factory;
        self
    }

    /// Overrides directory enumeration for recovery.
    #[must_use]
    pub fn with_read_dir(mut self, read_dir: ReadDirFn) -> Self {
        self.read_dir = read_dir;
        self
    }

    /// Overrides removal of failed snapshot directories.
    #[must_use]
    pub fn with_app_remove(mut self, app_remove: AppRemoveFn) -> Self {
        self.app_remove = app_remove;
        self
    }

    /// Returns the page size shared by the write buffer and the cache.
    pub(crate) fn page_size(&self) -> usize {
        self.page_buffer.page_size()
    }

    pub(crate) fn validate(&self) -> TreeResult<()> {
        let Some(wb) = &self.write_buffer else {
            return Err(TreeError::illegal("options were already consumed"));
        };

        let page_size = self.page_buffer.page_size();
        if wb.page_size() != page_size {
            return Err(TreeError::illegal(
                "write buffer and page cache disagree on the page size",
            ));
        }
        if !page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
        {
            return Err(TreeError::illegal(format!(
                "page size {page_size} must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
            )));
        }
        if self.file_size < page_size as u64 {
            return Err(TreeError::illegal(
                "file size must hold at least one page",
            ));
        }
        if self.max_active_snapshots == 0 {
            return Err(TreeError::illegal(
                "max active snapshots must be positive",
            ));
        }
        if !(self.compaction_thld > 0.0 && self.compaction_thld <= 1.0) {
            return Err(TreeError::illegal(
                "compaction threshold must be within (0, 1]",
            ));
        }
        Ok(())
    }
}

fn default_app_factory() -> AppFactoryFn {
    Arc::new(|root: &Path, sub: &str, app_opts: &AppendOptions| {
        let log = SegmentedLog::open(root.join(sub), app_opts.clone())?;
        Ok(Arc::new(log) as Arc<dyn AppendLog>)
    })
}

fn default_read_dir() -> ReadDirFn {
    Arc::new(|path: &Path| {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(entries)
    })
}

fn default_app_remove() -> AppRemoveFn {
    Arc::new(|root: &Path, sub: &str| std::fs::remove_dir_all(root.join(sub)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writebuf::SharedWriteBuffer;

    fn handles(page_size: usize) -> (WriteBuffer, Arc<PageCache>) {
        let shared = SharedWriteBuffer::new(64 * page_size, page_size);
        let wb = WriteBuffer::new(shared, 8, 32).unwrap();
        let cache = Arc::new(PageCache::new(16, page_size));
        (wb, cache)
    }

    #[test]
    fn test_defaults_validate() {
        let (wb, cache) = handles(4096);
        assert!(Options::new(wb, cache).validate().is_ok());
    }

    #[test]
    fn test_page_size_mismatch_rejected() {
        let shared = SharedWriteBuffer::new(64 * 4096, 4096);
        let wb = WriteBuffer::new(shared, 8, 32).unwrap();
        let cache = Arc::new(PageCache::new(16, 8192));
        assert!(Options::new(wb, cache).validate().is_err());
    }

    #[test]
    fn test_small_file_size_rejected() {
        let (wb, cache) = handles(4096);
        let opts = Options::new(wb, cache).with_file_size(1024);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_zero_snapshots_rejected() {
        let (wb, cache) = handles(4096);
        let opts = Options::new(wb, cache).with_max_active_snapshots(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_compaction_threshold_bounds() {
        let (wb, cache) = handles(4096);
        let opts = Options::new(wb, cache).with_compaction_thld(0.0);
        assert!(opts.validate().is_err());

        let (wb, cache) = handles(4096);
        let opts = Options::new(wb, cache).with_compaction_thld(0.8);
        assert!(opts.validate().is_ok());
    }
}
