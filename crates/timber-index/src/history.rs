//! Value-history pages and the history-log reader.
//!
//! Every replaced leaf entry is archived as a history record:
//!
//! ```text
//! prev_offset: u64 | ts: u64 | value_len: u16 | value
//! ```
//!
//! Records accumulate in in-memory history pages chained through
//! `next`; a flush appends each page's raw payload (never a fixed-size
//! image) to the history log. `prev_offset` threads the versions of one
//! key backward through the log, ending at `OFFSET_NONE`.

use bytes::{Buf, BufMut};
use timber_applog::AppendLog;
use timber_common::constants::OFFSET_NONE;
use timber_common::PageId;

use crate::error::{TreeError, TreeResult};
use crate::page::PageError;

/// Fixed bytes of a history record before the value.
pub(crate) const HISTORY_ENTRY_HEADER: usize = 8 + 8 + 2;

/// Returns the encoded size of a history record.
#[inline]
pub(crate) fn history_entry_len(value_len: usize) -> usize {
    HISTORY_ENTRY_HEADER + value_len
}

/// An in-memory, append-only chunk of history records.
///
/// History pages exist only inside the write buffer; on flush their
/// payload is appended verbatim to the history log, so the `next` link
/// and fill level are never serialized.
pub(crate) struct HistoryPage {
    buf: Box<[u8]>,
    used: usize,
    next: PageId,
}

impl HistoryPage {
    pub(crate) fn new(buf: Box<[u8]>) -> Self {
        Self {
            buf,
            used: 0,
            next: PageId::NONE,
        }
    }

    /// Appends one record, returning its encoded length.
    pub(crate) fn append(&mut self, prev_offset: u64, ts: u64, value: &[u8]) -> Result<usize, PageError> {
        let len = history_entry_len(value.len());
        if self.used + len > self.buf.len() {
            return Err(PageError::Full);
        }

        let mut w = &mut self.buf[self.used..self.used + len];
        w.put_u64(prev_offset);
        w.put_u64(ts);
        w.put_u16(value.len() as u16);
        w.put_slice(value);

        self.used += len;
        Ok(len)
    }

    /// The encoded records accumulated so far.
    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    pub(crate) fn next(&self) -> PageId {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: PageId) {
        self.next = next;
    }

    /// Recycles the backing buffer.
    pub(crate) fn into_buf(self) -> Box<[u8]> {
        self.buf
    }
}

/// One decoded history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HistoryEntry {
    pub prev_offset: u64,
    pub ts: u64,
    pub value: Vec<u8>,
}

/// Reads history records back out of the history log.
pub(crate) struct HistoryReader<'a> {
    app: &'a dyn AppendLog,
    max_value_len: usize,
}

impl<'a> HistoryReader<'a> {
    pub(crate) fn new(app: &'a dyn AppendLog, max_value_len: usize) -> Self {
        Self { app, max_value_len }
    }

    /// Decodes the record at `off`.
    pub(crate) fn read_entry(&self, off: u64) -> TreeResult<HistoryEntry> {
        let mut header = [0u8; HISTORY_ENTRY_HEADER];
        self.app.read_at(&mut header, off)?;

        let mut r = &header[..];
        let prev_offset = r.get_u64();
        let ts = r.get_u64();
        let value_len = r.get_u16() as usize;
        if value_len > self.max_value_len {
            return Err(TreeError::CorruptedEntry(format!(
                "history value length {value_len} at offset {off} exceeds the maximum"
            )));
        }

        let mut value = vec![0u8; value_len];
        self.app
            .read_at(&mut value, off + HISTORY_ENTRY_HEADER as u64)?;

        Ok(HistoryEntry {
            prev_offset,
            ts,
            value,
        })
    }

    /// Returns the raw encoded bytes of the record at `off`.
    ///
    /// Recovery uses this to re-derive the length and checksum of the
    /// commit entry's history anchor.
    pub(crate) fn read_raw_entry(&self, off: u64) -> TreeResult<Vec<u8>> {
        let mut header = [0u8; HISTORY_ENTRY_HEADER];
        self.app.read_at(&mut header, off)?;

        let value_len = u16::from_be_bytes([header[16], header[17]]) as usize;
        if value_len > self.max_value_len {
            return Err(TreeError::CorruptedEntry(format!(
                "history value length {value_len} at offset {off} exceeds the maximum"
            )));
        }

        let mut raw = vec![0u8; history_entry_len(value_len)];
        self.app.read_at(&mut raw, off)?;
        Ok(raw)
    }

    /// Follows `hops` back-links starting at `off`, then decodes the
    /// record reached.
    pub(crate) fn revision_at(&self, mut off: u64, hops: usize) -> TreeResult<HistoryEntry> {
        for _ in 0..hops {
            if off == OFFSET_NONE {
                return Err(TreeError::KeyRevisionNotFound);
            }
            let mut link = [0u8; 8];
            self.app.read_at(&mut link, off)?;
            off = u64::from_be_bytes(link);
        }
        if off == OFFSET_NONE {
            return Err(TreeError::KeyRevisionNotFound);
        }
        self.read_entry(off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use timber_applog::{AppendOptions, SegmentedLog};

    fn history_log() -> (tempfile::TempDir, SegmentedLog) {
        let dir = tempdir().unwrap();
        let log = SegmentedLog::open(
            dir.path(),
            AppendOptions::new().with_file_size(4096).with_file_ext("hx"),
        )
        .unwrap();
        (dir, log)
    }

    #[test]
    fn test_page_append_and_data() {
        let mut page = HistoryPage::new(vec![0u8; 64].into_boxed_slice());

        let n = page.append(OFFSET_NONE, 7, b"abc").unwrap();
        assert_eq!(n, HISTORY_ENTRY_HEADER + 3);
        assert_eq!(page.data().len(), n);

        let mut r = page.data();
        assert_eq!(r.get_u64(), OFFSET_NONE);
        assert_eq!(r.get_u64(), 7);
        assert_eq!(r.get_u16(), 3);
    }

    #[test]
    fn test_page_full() {
        let mut page = HistoryPage::new(vec![0u8; 32].into_boxed_slice());
        page.append(OFFSET_NONE, 1, b"0123456789").unwrap();
        assert!(matches!(
            page.append(OFFSET_NONE, 2, b"0123456789"),
            Err(PageError::Full)
        ));
    }

    #[test]
    fn test_chain_walk_through_log() {
        let (_dir, log) = history_log();

        // Three versions of one key, each record linking to the prior.
        let mut page = HistoryPage::new(vec![0u8; 256].into_boxed_slice());
        let mut offsets = Vec::new();
        let mut prev = OFFSET_NONE;
        let mut at = 0u64;
        for (ts, value) in [(1u64, b"1"), (2, b"2"), (3, b"3")] {
            offsets.push(at);
            let n = page.append(prev, ts, value).unwrap();
            prev = at;
            at += n as u64;
        }
        log.append(page.data()).unwrap();

        let reader = HistoryReader::new(&log, 1024);

        // Newest archived version is at offsets[2].
        let newest = reader.read_entry(offsets[2]).unwrap();
        assert_eq!(newest.ts, 3);
        assert_eq!(newest.value, b"3");
        assert_eq!(newest.prev_offset, offsets[1]);

        // One hop back reaches ts=2, two hops ts=1.
        assert_eq!(reader.revision_at(offsets[2], 1).unwrap().ts, 2);
        let oldest = reader.revision_at(offsets[2], 2).unwrap();
        assert_eq!(oldest.ts, 1);
        assert_eq!(oldest.prev_offset, OFFSET_NONE);

        // Walking past the chain end reports a missing revision.
        assert!(matches!(
            reader.revision_at(offsets[2], 3),
            Err(TreeError::KeyRevisionNotFound)
        ));
    }

    #[test]
    fn test_raw_entry_matches_encoding() {
        let (_dir, log) = history_log();

        let mut page = HistoryPage::new(vec![0u8; 64].into_boxed_slice());
        page.append(OFFSET_NONE, 9, b"value").unwrap();
        log.append(page.data()).unwrap();

        let reader = HistoryReader::new(&log, 1024);
        let raw = reader.read_raw_entry(0).unwrap();
        assert_eq!(raw, page.data());
    }
}
