//! Process that runs the RAS engine against a cluster snapshot.

pub mod bootstrap;
pub mod common;
pub mod config;
pub mod snapshot;
pub mod transport;
