//! # Reconciliation Core
//!
//! The per-VCI control loop and its collaborators: token/AccessKey
//! management, kubeconfig rendering, namespace pattern resolution, and the
//! multi-namespace secret synchronizer.

pub mod kubeconfig;
pub mod namespaces;
pub mod reconciler;
pub mod secrets;
pub mod token;

pub use reconciler::{ReconcileError, Reconciler};

/// Treat a 404 on delete as success; absence of a GC target is the goal.
pub(crate) fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}
