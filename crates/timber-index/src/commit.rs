//! Commit entries: the self-describing batch trailer of the tree log.
//!
//! After each flush the tree log ends with a fixed 42-byte entry:
//!
//! ```text
//! checksum: u32 | ts: u64 | hlog_last_entry_off: u64 |
//! hlog_last_entry_checksum: u32 | total_pages: u64 | stale_pages: u32 |
//! indexed_entry_count: u32 | magic: u16
//! ```
//!
//! The checksum is CRC32-Castagnoli over everything after itself, magic
//! included. The root page of the batch is the page appended
//! immediately before the entry, so a valid commit entry at offset
//! `off` implies the root page ends at `off`.

use bytes::{Buf, BufMut};
use timber_applog::{AppLogError, AppendLog};

use crate::error::{TreeError, TreeResult};

/// Trailing magic marker of a commit entry.
pub(crate) const COMMIT_MAGIC: u16 = 0xB7E1;
/// Size of the magic marker.
pub(crate) const COMMIT_MAGIC_SIZE: usize = 2;
/// Full encoded size of a commit entry.
pub(crate) const COMMIT_ENTRY_SIZE: usize = 40 + COMMIT_MAGIC_SIZE;

const CHECKSUM_SIZE: usize = 4;

/// The fields persisted with every flush batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct CommitEntry {
    /// Root timestamp at flush time.
    pub ts: u64,
    /// Offset of the last archived history entry, 0 when none exists.
    pub hlog_last_entry_off: u64,
    /// CRC32-C of that history entry's encoded bytes.
    pub hlog_last_entry_checksum: u32,
    /// Cumulative number of pages appended to the tree log.
    pub total_pages: u64,
    /// Cumulative number of pages no longer reachable from the root.
    pub stale_pages: u32,
    /// Entries indexed by the external ledger at flush time.
    pub indexed_entry_count: u32,
}

/// Encodes a commit entry into `buf` (exactly `COMMIT_ENTRY_SIZE` bytes).
pub(crate) fn put_commit_entry(e: &CommitEntry, buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), COMMIT_ENTRY_SIZE);

    {
        let mut w = &mut buf[..];
        w.put_u32(0); // checksum patched below
        w.put_u64(e.ts);
        w.put_u64(e.hlog_last_entry_off);
        w.put_u32(e.hlog_last_entry_checksum);
        w.put_u64(e.total_pages);
        w.put_u32(e.stale_pages);
        w.put_u32(e.indexed_entry_count);
        w.put_u16(COMMIT_MAGIC);
    }

    let checksum = crc32c::crc32c(&buf[CHECKSUM_SIZE..]);
    buf[..CHECKSUM_SIZE].copy_from_slice(&checksum.to_be_bytes());
}

/// Decodes and verifies a commit entry.
pub(crate) fn read_commit_entry(buf: &[u8]) -> TreeResult<CommitEntry> {
    debug_assert_eq!(buf.len(), COMMIT_ENTRY_SIZE);

    let mut r = buf;
    let checksum = r.get_u32();
    let entry = CommitEntry {
        ts: r.get_u64(),
        hlog_last_entry_off: r.get_u64(),
        hlog_last_entry_checksum: r.get_u32(),
        total_pages: r.get_u64(),
        stale_pages: r.get_u32(),
        indexed_entry_count: r.get_u32(),
    };
    let magic = r.get_u16();

    if crc32c::crc32c(&buf[CHECKSUM_SIZE..]) != checksum {
        return Err(TreeError::CorruptedEntry(
            "commit entry checksum mismatch".to_string(),
        ));
    }
    if magic != COMMIT_MAGIC {
        return Err(TreeError::CorruptedEntry(
            "commit entry magic mismatch".to_string(),
        ));
    }
    Ok(entry)
}

/// Finds the rightmost occurrence of the magic marker in `buf`,
/// returning the index of its final byte. A lone low byte at index 0
/// counts: its high byte may sit in the preceding chunk.
fn find_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < COMMIT_MAGIC_SIZE {
        return None;
    }

    let hi = (COMMIT_MAGIC >> 8) as u8;
    let lo = (COMMIT_MAGIC & 0xFF) as u8;

    for i in (1..buf.len() - 1).rev() {
        if buf[i] == lo && buf[i - 1] == hi {
            return Some(i);
        }
    }
    if buf[0] == lo {
        return Some(0);
    }
    None
}

/// Scans the tree log backward for the latest valid commit entry.
///
/// Returns the entry and its offset (which is also the end offset, and
/// therefore the page id, of the committed root page). Fails with
/// [`TreeError::NoValidPageFound`] when the log holds no valid entry.
pub(crate) fn find_last_valid_commit(app: &dyn AppendLog) -> TreeResult<(CommitEntry, u64)> {
    let size = app.size()?;

    let mut buf = [0u8; COMMIT_ENTRY_SIZE];
    let mut off = size as i64 - COMMIT_ENTRY_SIZE as i64;
    while off >= 0 {
        if let Err(err) = app.read_at(&mut buf, off as u64) {
            return match err {
                AppLogError::ShortRead { .. } => Err(TreeError::NoValidPageFound),
                other => Err(other.into()),
            };
        }

        if let Ok(entry) = read_commit_entry(&buf) {
            return Ok((entry, off as u64));
        }

        // Realign the scan window so a magic marker found inside the
        // chunk lands at the window's end.
        match find_magic(&buf) {
            Some(i) => off -= (COMMIT_ENTRY_SIZE - i - 1) as i64,
            None => off -= COMMIT_ENTRY_SIZE as i64,
        }
    }
    Err(TreeError::NoValidPageFound)
}
