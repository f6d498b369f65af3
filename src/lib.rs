//! # VCI Flux Secret Controller
//!
//! A Kubernetes controller that keeps FluxCD able to reach vcluster platform
//! virtual clusters. For every `VirtualClusterInstance` (VCI) that reaches the
//! `Ready` phase it:
//!
//! 1. **Mints a durable access token** - persisted in a token Secret in the
//!    controller namespace and bound to a platform `AccessKey` resource
//! 2. **Renders a kubeconfig** - a minimal single-cluster JSON document
//!    pointing at the platform proxy URL for the virtual cluster
//! 3. **Publishes kubeconfig Secrets** - one per Flux namespace, resolved from
//!    exact names and shell-glob patterns, updated only on content drift
//! 4. **Garbage-collects** - removes every derived Secret plus the AccessKey
//!    and token Secret once the owning VCI is deleted
//!
//! The VCI and AccessKey resources are externally-schema'd custom resources
//! and are accessed dynamically; the VCI itself is never written (no
//! finalizers - deletion is observed through the watch stream).
//!
//! See the [README.md](../README.md) for flags and deployment notes.

pub mod config;
pub mod controller;
pub mod crd;
pub mod runtime;
