//! twinscale-core — shared vocabulary for the virtual sensor autoscaler.
//!
//! Holds the data model (samples, verdicts, sensor records, scaling
//! decisions), the `twinscale.toml` configuration surface, and the error
//! taxonomy every other crate reports through.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::ScalerConfig;
pub use duration::parse_duration;
pub use error::{
    CollaboratorError, ConfigError, RegistryError, ScalerError, TransitionInput, WindowError,
};
pub use types::*;
