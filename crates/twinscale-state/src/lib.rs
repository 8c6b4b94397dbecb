//! twinscale-state — durable record of scaling decisions.
//!
//! Backed by [redb](https://docs.rs/redb). Every decision the controller
//! applies is stored as JSON together with the verdict that produced it,
//! keyed `{sensor_id}:{decided_at}:{seq}` so a sensor's history is one
//! contiguous range.
//!
//! The `DecisionLog` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and implements the controller's `DecisionSink`.

pub mod error;
pub mod log;
pub mod tables;

pub use error::{StateError, StateResult};
pub use log::{DecisionEntry, DecisionLog};
