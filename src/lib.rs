//! Worker execution core of a sharded key-value proxy.
//!
//! Each worker thread owns an io_uring readiness dispatcher, a set of
//! connections, a timeout queue for forwarded requests, and an inbound
//! channel other workers hand envelopes over through.

pub mod backend;
pub mod cluster;
pub mod core;
pub mod error;
pub mod protocol;
pub mod util;
pub mod worker;

pub use cluster::{Counter, Datastore, LocalRouter, ProcessContext, Route, Router, Stats};
pub use error::{Error, Result};
pub use worker::{ProxyConfig, Worker, WorkerHandle, spawn_workers};
