//! Server-side feature flag evaluation SDK.
//!
//! The client keeps an in-process replica of the remote flag configuration, kept current by a
//! streaming or polling data source, and answers every variation query from local memory.

mod broadcast;
mod client;
mod config;
mod data_source;
mod eval;
mod flag;
mod flag_value;
mod polling;
mod rule;
mod segment;
mod status;
mod store;
mod streaming;
mod test_common;
mod update_sink;
mod user;
mod variation;

pub use broadcast::*;
pub use client::*;
pub use config::*;
pub use data_source::*;
pub use eval::*;
pub use flag::*;
pub use flag_value::*;
pub use polling::*;
pub use rule::*;
pub use segment::*;
pub use status::*;
pub use store::*;
pub use streaming::*;
pub use update_sink::*;
pub use user::*;
pub use variation::*;
