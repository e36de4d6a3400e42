//! Supervised execution of site-specific overlay network bootstrap scripts.
//!
//! During node initialization a user script sets up the overlay network and
//! reports the result as a JSON document. The supervisor runs that script
//! under a timeout, validates the document, retries with exponential backoff,
//! and makes sure a well-formed document exists at the output path however
//! the run ends. For autoscaler nodes it also writes the reported address
//! into the cluster agent's drop-in configuration.

pub mod adapter;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod retry;
pub mod script;
pub mod supervisor;
pub mod validate;

pub use config::{Config, ExecutionConfig, NodeFlavor};
pub use error::{AttemptFailure, SupervisorError};
pub use supervisor::{RunStatus, Supervisor, SupervisorReport};
pub use validate::{ResultDocument, Status};
