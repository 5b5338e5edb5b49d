//! VenuePass Shared Types and Utilities
//!
//! This crate contains types and database helpers shared across the
//! VenuePass platform.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
