//! Outbound relay connection to the cloud bridge.
//!
//! The relay lets the bridge reach this agent when it cannot open a direct
//! connection. Requests that arrive over it go through the same
//! [`OperationPort`](crate::app::operations::OperationPort) as local HTTP.

pub mod client;

pub use client::{spawn, RelaySettings, RelayStatus};
