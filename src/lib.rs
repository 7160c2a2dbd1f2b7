//! A transparent TCP relay with a three-thread CLIENT/SERVER/WORKER audit
//! pipeline. See `SPEC_FULL.md` for the full system description.

pub mod channel;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event;
pub mod queue;
pub mod server_engine;
pub mod supervisor;
pub mod worker;
