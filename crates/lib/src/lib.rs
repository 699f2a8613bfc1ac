//! convoy-lib: declarative convergence engine for web application nodes.
//!
//! This crate provides the building blocks of a convergence run:
//! - `resource`: declared units of desired state and their per-kind schemas
//! - `hooks`: lifecycle phases and the handlers that converge each kind
//! - `execute`: the engine that orders, runs and reports a pass
//! - `deploy`: composite application deployments and their sub-resources
//! - `manifest`: JSON node manifests declared into a run
//! - `collab`: the collaborators every side effect goes through

pub mod collab;
pub mod config;
pub mod deploy;
pub mod error;
pub mod execute;
pub mod hooks;
pub mod manifest;
pub mod notify;
pub mod placeholder;
pub mod resource;
pub mod util;

pub use deploy::{DeploymentResult, RepositoryRef, SubResourceDecl, deploy, deploy_with};
pub use error::{ConvergeError, HandlerError};
pub use execute::{Cancellation, Engine, ExecuteConfig, RunReport, RunStatus};
