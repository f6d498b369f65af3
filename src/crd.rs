//! # Dynamic Resource Definitions
//!
//! The controller reconciles two externally-schema'd custom resources it does
//! not own: the vcluster platform `VirtualClusterInstance` (the reconciliation
//! subject, read-only) and the `AccessKey` credential binding. Both are
//! accessed as [`DynamicObject`]s via [`ApiResource`] descriptors, the same
//! way FluxCD GitRepository resources are usually reached from Rust.
//!
//! Nested fields of those objects are read through [`nested_str`], a typed
//! path lookup that returns `None` on any missing segment or type mismatch
//! instead of silently defaulting.

use kube::api::ApiResource;
use kube::core::{DynamicObject, GroupVersionKind};

/// Phase a VCI must report before credentials are provisioned.
pub const PHASE_READY: &str = "Ready";

/// `management.loft.sh/v1 VirtualClusterInstance` (namespaced).
pub fn virtual_cluster_instance() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "management.loft.sh",
        "v1",
        "VirtualClusterInstance",
    ))
}

/// `storage.loft.sh/v1 AccessKey` (cluster-scoped).
pub fn access_key() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("storage.loft.sh", "v1", "AccessKey"))
}

/// Look up a nested string field by path, e.g. `["status", "phase"]`.
///
/// Returns `None` when any intermediate segment is absent, when the leaf is
/// absent, or when the leaf is not a JSON string.
pub fn nested_str<'a>(obj: &'a DynamicObject, path: &[&str]) -> Option<&'a str> {
    let mut value = &obj.data;
    for segment in path {
        value = value.get(*segment)?;
    }
    value.as_str()
}

/// The VCI's reported `status.phase`, if any.
pub fn phase(vci: &DynamicObject) -> Option<&str> {
    nested_str(vci, &["status", "phase"])
}
