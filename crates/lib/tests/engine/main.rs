//! End-to-end convergence runs against the in-memory host.

mod common;
mod deploy_tests;
mod manifest_tests;
