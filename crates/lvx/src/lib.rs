#![forbid(unsafe_code)]
//! lvx public API facade.
//!
//! Re-exports `lvx-core` so downstream consumers depend on a single crate.

pub use lvx_core::*;
