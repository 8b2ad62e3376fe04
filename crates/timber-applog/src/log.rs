//! Segmented append-log implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::config::AppendOptions;
use crate::error::{AppLogError, AppResult};

/// An append-only byte log.
///
/// Appends return the logical offset at which the data was placed.
/// Reads observe every appended byte, flushed or still buffered.
pub trait AppendLog: Send + Sync {
    /// Appends `data`, returning `(offset, written)`.
    fn append(&self, data: &[u8]) -> AppResult<(u64, usize)>;

    /// Writes buffered bytes through to the OS.
    fn flush(&self) -> AppResult<()>;

    /// Flushes and then syncs the backing files to storage.
    fn sync(&self) -> AppResult<()>;

    /// Fills `buf` exactly from logical offset `off`.
    ///
    /// Fails with [`AppLogError::ShortRead`] when the read would cross
    /// the logical end of the log.
    fn read_at(&self, buf: &mut [u8], off: u64) -> AppResult<()>;

    /// Returns the logical size of the log.
    fn size(&self) -> AppResult<u64>;

    /// Truncates the log to `off` bytes.
    ///
    /// Used by recovery to drop torn tails. In read-only mode only the
    /// logical size changes; otherwise the backing files are truncated.
    fn set_offset(&self, off: u64) -> AppResult<()>;

    /// Flushes, syncs and closes the log. Further use fails with
    /// [`AppLogError::AlreadyClosed`].
    fn close(&self) -> AppResult<()>;
}

struct Segment {
    path: PathBuf,
    file: File,
    /// Bytes of log data in this file.
    len: u64,
}

struct LogState {
    segments: Vec<Segment>,
    /// Logical bytes hardened to the files.
    flushed: u64,
    /// Bytes appended but not yet written to a file.
    buffer: Vec<u8>,
    closed: bool,
}

/// Multi-file append log.
///
/// Bytes live in numbered files of at most `file_size` bytes each; every
/// file except the last is full, so a logical offset maps to
/// `(offset / file_size, offset % file_size)`.
pub struct SegmentedLog {
    dir: PathBuf,
    opts: AppendOptions,
    state: Mutex<LogState>,
}

impl SegmentedLog {
    /// Opens (or creates) the log stored in `dir`.
    pub fn open(dir: impl AsRef<Path>, opts: AppendOptions) -> AppResult<Self> {
        opts.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut indexed: Vec<(usize, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = parse_segment_name(&name, &opts.file_ext) {
                indexed.push((index, entry.path()));
            }
        }
        indexed.sort_by_key(|(index, _)| *index);

        let mut segments = Vec::with_capacity(indexed.len());
        let mut flushed = 0u64;
        for (pos, (index, path)) in indexed.iter().enumerate() {
            if *index != pos {
                return Err(AppLogError::corrupted(format!(
                    "missing segment {:08}.{}",
                    pos, opts.file_ext
                )));
            }

            let file = open_segment_file(path, &opts, false)?;
            let len = file.metadata()?.len();

            if len > opts.file_size {
                return Err(AppLogError::corrupted(format!(
                    "segment {} is larger than the configured file size",
                    path.display()
                )));
            }
            if pos + 1 < indexed.len() && len != opts.file_size {
                return Err(AppLogError::corrupted(format!(
                    "non-final segment {} is not full",
                    path.display()
                )));
            }

            flushed += len;
            segments.push(Segment {
                path: path.clone(),
                file,
                len,
            });
        }

        Ok(Self {
            dir,
            opts,
            state: Mutex::new(LogState {
                segments,
                flushed,
                buffer: Vec::new(),
                closed: false,
            }),
        })
    }

    /// Returns the directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{:08}.{}", index, self.opts.file_ext))
    }

    /// Drains the write buffer into the segment files, rolling over as
    /// files fill up.
    fn flush_buffer(&self, st: &mut LogState) -> AppResult<()> {
        while !st.buffer.is_empty() {
            let needs_new = match st.segments.last() {
                None => true,
                Some(seg) => seg.len == self.opts.file_size,
            };
            if needs_new {
                let path = self.segment_path(st.segments.len());
                let file = open_segment_file(&path, &self.opts, true)?;
                st.segments.push(Segment { path, file, len: 0 });
            }

            let tail = st.segments.len() - 1;
            let seg = &mut st.segments[tail];
            let room = (self.opts.file_size - seg.len) as usize;
            let take = room.min(st.buffer.len());

            seg.file.seek(SeekFrom::Start(seg.len))?;
            seg.file.write_all(&st.buffer[..take])?;

            seg.len += take as u64;
            st.flushed += take as u64;
            st.buffer.drain(..take);
        }
        Ok(())
    }

    fn check_open(st: &LogState) -> AppResult<()> {
        if st.closed {
            return Err(AppLogError::AlreadyClosed);
        }
        Ok(())
    }
}

impl AppendLog for SegmentedLog {
    fn append(&self, data: &[u8]) -> AppResult<(u64, usize)> {
        let mut st = self.state.lock();
        Self::check_open(&st)?;
        if self.opts.read_only {
            return Err(AppLogError::ReadOnly);
        }

        let off = st.flushed + st.buffer.len() as u64;
        st.buffer.extend_from_slice(data);

        if st.buffer.len() >= self.opts.write_buffer_size {
            self.flush_buffer(&mut st)?;
        }
        Ok((off, data.len()))
    }

    fn flush(&self) -> AppResult<()> {
        let mut st = self.state.lock();
        Self::check_open(&st)?;
        self.flush_buffer(&mut st)
    }

    fn sync(&self) -> AppResult<()> {
        let mut st = self.state.lock();
        Self::check_open(&st)?;
        if self.opts.read_only {
            return Ok(());
        }
        self.flush_buffer(&mut st)?;
        for seg in &st.segments {
            seg.file.sync_data()?;
        }
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> AppResult<()> {
        let mut st = self.state.lock();
        Self::check_open(&st)?;

        let size = st.flushed + st.buffer.len() as u64;
        if off + buf.len() as u64 > size {
            return Err(AppLogError::ShortRead {
                requested: buf.len(),
                offset: off,
                size,
            });
        }

        let flushed = st.flushed;
        let mut pos = off;
        let mut filled = 0usize;
        while filled < buf.len() {
            let remaining = buf.len() - filled;
            if pos < flushed {
                let seg_index = (pos / self.opts.file_size) as usize;
                let in_off = pos % self.opts.file_size;
                let seg = &mut st.segments[seg_index];
                let take = ((seg.len - in_off) as usize).min(remaining);

                seg.file.seek(SeekFrom::Start(in_off))?;
                seg.file.read_exact(&mut buf[filled..filled + take])?;

                pos += take as u64;
                filled += take;
            } else {
                let buf_off = (pos - flushed) as usize;
                buf[filled..].copy_from_slice(&st.buffer[buf_off..buf_off + remaining]);
                pos += remaining as u64;
                filled += remaining;
            }
        }
        Ok(())
    }

    fn size(&self) -> AppResult<u64> {
        let st = self.state.lock();
        Self::check_open(&st)?;
        Ok(st.flushed + st.buffer.len() as u64)
    }

    fn set_offset(&self, off: u64) -> AppResult<()> {
        let mut st = self.state.lock();
        Self::check_open(&st)?;

        let size = st.flushed + st.buffer.len() as u64;
        if off > size {
            return Err(AppLogError::InvalidOffset { offset: off, size });
        }

        if off >= st.flushed {
            let new_len = (off - st.flushed) as usize;
            st.buffer.truncate(new_len);
            return Ok(());
        }
        st.buffer.clear();

        if self.opts.read_only {
            // Leave the files untouched; clamp the logical view.
            let file_size = self.opts.file_size;
            for (index, seg) in st.segments.iter_mut().enumerate() {
                let start = index as u64 * file_size;
                seg.len = off.saturating_sub(start).min(file_size);
            }
            st.flushed = off;
            return Ok(());
        }

        let keep = off.div_ceil(self.opts.file_size) as usize;
        for seg in st.segments.drain(keep..) {
            drop(seg.file);
            fs::remove_file(&seg.path)?;
        }
        if let Some(last) = st.segments.last_mut() {
            let new_len = off - (keep as u64 - 1) * self.opts.file_size;
            last.file.set_len(new_len)?;
            last.len = new_len;
        }
        st.flushed = off;
        Ok(())
    }

    fn close(&self) -> AppResult<()> {
        let mut st = self.state.lock();
        Self::check_open(&st)?;

        if !self.opts.read_only {
            self.flush_buffer(&mut st)?;
            for seg in &st.segments {
                seg.file.sync_data()?;
            }
        }
        st.closed = true;
        st.segments.clear();
        Ok(())
    }
}

fn parse_segment_name(name: &str, ext: &str) -> Option<usize> {
    let stem = name.strip_suffix(&format!(".{ext}"))?;
    if stem.len() != 8 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn open_segment_file(path: &Path, opts: &AppendOptions, create: bool) -> AppResult<File> {
    if create && opts.read_only {
        return Err(AppLogError::ReadOnly);
    }

    let mut open_opts = OpenOptions::new();
    open_opts.read(true).write(!opts.read_only).create(create);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if create {
            open_opts.mode(opts.file_mode);
        }
    }

    Ok(open_opts.open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_opts() -> AppendOptions {
        AppendOptions::new()
            .with_file_size(4096)
            .with_file_ext("t")
            .with_write_buffer_size(512)
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();

        let (off, n) = log.append(b"hello").unwrap();
        assert_eq!(off, 0);
        assert_eq!(n, 5);

        let (off, _) = log.append(b"world").unwrap();
        assert_eq!(off, 5);

        // Reads must see the write buffer.
        let mut buf = [0u8; 10];
        log.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"helloworld");
    }

    #[test]
    fn test_read_past_end_is_short_read() {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        log.append(b"abc").unwrap();

        let mut buf = [0u8; 8];
        let err = log.read_at(&mut buf, 0).unwrap_err();
        assert!(matches!(err, AppLogError::ShortRead { .. }));
    }

    #[test]
    fn test_rollover_across_files() {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();

        let chunk = vec![7u8; 3000];
        for _ in 0..3 {
            log.append(&chunk).unwrap();
        }
        log.flush().unwrap();
        assert_eq!(log.size().unwrap(), 9000);

        // 9000 bytes at 4096 per file -> 3 files.
        assert!(dir.path().join("00000000.t").exists());
        assert!(dir.path().join("00000001.t").exists());
        assert!(dir.path().join("00000002.t").exists());

        // A read spanning the file boundary stitches correctly.
        let mut buf = vec![0u8; 200];
        log.read_at(&mut buf, 4000).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        {
            let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
            log.append(b"persist me").unwrap();
            log.close().unwrap();
        }

        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        assert_eq!(log.size().unwrap(), 10);

        let mut buf = [0u8; 10];
        log.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn test_set_offset_truncates() {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();

        let chunk = vec![1u8; 5000];
        log.append(&chunk).unwrap();
        log.flush().unwrap();

        log.set_offset(100).unwrap();
        assert_eq!(log.size().unwrap(), 100);
        assert!(!dir.path().join("00000001.t").exists());

        // Appends continue at the truncated offset.
        let (off, _) = log.append(b"xy").unwrap();
        assert_eq!(off, 100);
    }

    #[test]
    fn test_set_offset_into_write_buffer() {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();

        log.append(b"0123456789").unwrap();
        log.set_offset(4).unwrap();
        assert_eq!(log.size().unwrap(), 4);

        let mut buf = [0u8; 4];
        log.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn test_set_offset_beyond_end_fails() {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        log.append(b"abc").unwrap();

        let err = log.set_offset(10).unwrap_err();
        assert!(matches!(err, AppLogError::InvalidOffset { .. }));
    }

    #[test]
    fn test_closed_log_rejects_use() {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        log.close().unwrap();

        assert!(matches!(
            log.append(b"x").unwrap_err(),
            AppLogError::AlreadyClosed
        ));
        assert!(matches!(log.size().unwrap_err(), AppLogError::AlreadyClosed));
        assert!(matches!(log.close().unwrap_err(), AppLogError::AlreadyClosed));
    }

    #[test]
    fn test_read_only_rejects_append() {
        let dir = tempdir().unwrap();
        {
            let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
            log.append(b"data").unwrap();
            log.close().unwrap();
        }

        let log = SegmentedLog::open(dir.path(), small_opts().with_read_only(true)).unwrap();
        assert!(matches!(
            log.append(b"x").unwrap_err(),
            AppLogError::ReadOnly
        ));

        // Logical truncation still works and reads are clamped.
        log.set_offset(2).unwrap();
        assert_eq!(log.size().unwrap(), 2);
        let mut buf = [0u8; 2];
        log.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"da");
    }
}
