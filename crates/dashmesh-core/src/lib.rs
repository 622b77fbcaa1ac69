//! dashmesh-core
//!
//! Building blocks for a schedulerless compute mesh: nodes advertise
//! presence, claim tasks from a shared ledger, run them and earn points,
//! all coordinated through one shared realtime store.
//!
//! # Modules
//! - **domain**: records, ids and errors
//! - **ports**: StateStore, Executor, IdentityProvider, Clock, IdGenerator
//! - **impls**: in-memory store, docker executor, echo executor
//! - **app**: presence, membership, ledgers, execution loop, node wiring
//! - **config**: TOML node configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
mod test_support;
