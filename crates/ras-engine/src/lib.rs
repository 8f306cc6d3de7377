#![deny(clippy::await_holding_refcell_ref)]

//! Fault-management control loop of the cluster.
//!
//! The engine polls the event store for RAS events that still need work, associates each event
//! with the job that was running on its location when it happened and executes the control
//! operation attached to the event.

pub mod common;
pub mod control;
pub mod engine;
pub mod model;
pub mod store;
pub mod topology;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::RasError;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::common::{Map, Set, WrappedRcRefCell};
pub use crate::model::{JobId, Location, Timestamp};
