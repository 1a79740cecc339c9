//! Integration test crate for teegate.
//!
//! This crate exists solely to run integration tests that span the attestation
//! and gate crates. It has no public API - all functionality is in the test modules.

#![forbid(unsafe_code)]
