//! # Ferropack XZ
//!
//! A from-scratch streaming XZ decoder:
//!
//! - [`stream`]: the incremental push decoder ([`XzDecoder`]), concatenated
//!   streams, stream padding, and the buffered-input ceiling
//! - [`block`]: block headers and filter-chain validation
//! - [`lzma2`] / [`lzma`] / [`range`]: the LZMA2 layer
//! - [`filter`]: Delta and BCJ (x86, PowerPC, IA-64, ARM, ARM Thumb, SPARC,
//!   ARM64) decode filters
//! - [`index`] / [`check`]: index parsing and the four check types
//! - [`preflight`]: the read-only tail walk that bounds dictionary and index
//!   cost before any decompression starts
//!
//! Writing XZ is deliberately out of scope; this crate only decodes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod block;
pub mod check;
pub mod filter;
pub mod index;
pub mod lzma;
pub mod lzma2;
pub mod preflight;
pub mod range;
pub mod stream;

#[cfg(test)]
mod testutil;

pub use check::CheckType;
pub use preflight::{preflight, XzPreflight};
pub use stream::{decompress, decompress_with, StreamFlags, XzDecoder, XzOptions};
