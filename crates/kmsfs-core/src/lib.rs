//! Core contracts for kmsfs: file stores, change tokens and key services.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod files;
pub mod kms;
pub mod memory;
pub mod watch;
