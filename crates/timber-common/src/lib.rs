//! # timber-common
//!
//! Common types and utilities for timberdb.
//!
//! This crate provides the foundational pieces shared by the storage
//! crates:
//!
//! - **Types**: core identifiers (`PageId` with its dual address space,
//!   `TreeId`)
//! - **Constants**: page-size bounds and format sentinels
//! - **Cancel**: a cancellation token honored by blocking APIs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod constants;
pub mod types;

pub use cancel::CancelToken;
pub use types::{PageId, TreeId};
