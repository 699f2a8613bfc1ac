//! CLI integration tests that converge real files in temporary directories.

mod apply_tests;
mod common;
