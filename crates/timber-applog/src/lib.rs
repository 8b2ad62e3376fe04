//! # timber-applog
//!
//! Append-only log files for timberdb.
//!
//! An append log is a logically contiguous sequence of bytes backed by
//! one or more fixed-size files (`00000000.<ext>`, `00000001.<ext>`, …).
//! The id of a byte is its absolute logical offset, regardless of which
//! file it landed in. Appends are buffered: [`AppendLog::flush`] hardens
//! buffered bytes to the OS, [`AppendLog::sync`] hardens them to storage,
//! and reads observe flushed bytes plus the write buffer.
//!
//! [`AppendLog::set_offset`] truncates the logical size, which recovery
//! uses to drop torn tails after a crash.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;
mod log;

pub use config::AppendOptions;
pub use error::{AppLogError, AppResult};
pub use log::{AppendLog, SegmentedLog};
