//! # Runtime
//!
//! The outer event-delivery harness around the reconciler: a watch stream
//! over VirtualClusterInstances plus a per-key redelivery queue with
//! Fibonacci backoff for failed keys.

pub mod backoff;
pub mod watch_loop;

pub use watch_loop::run_watch_loop;
