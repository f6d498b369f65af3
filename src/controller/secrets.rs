//! # Secret Synchronizer
//!
//! Idempotent upsert of one kubeconfig Secret per target Flux namespace, and
//! cascading garbage collection of everything derived from a VCI once it is
//! gone. Every published Secret carries identifying labels sufficient to
//! rediscover it from the VCI key alone, so GC works without consulting the
//! (already deleted) VCI object.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::core::DynamicObject;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use super::{ignore_not_found, token};
use crate::config::Options;
use crate::crd;

/// Value of the managed-by label on every object this controller writes.
pub const MANAGED_BY: &str = "vci-flux-secret-controller";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_FLUX_KUBECONFIG: &str = "fluxcd.io/kubeconfig";
pub const LABEL_VCI_NAME: &str = "vci.flux.loft.sh/name";
pub const LABEL_VCI_NAMESPACE: &str = "vci.flux.loft.sh/namespace";

/// Annotation holding the SHA-256 fingerprint of the stored kubeconfig.
pub const ANNOTATION_FINGERPRINT: &str = "vci.flux.loft.sh/kcfg-sha256";
/// Annotation on the token Secret referencing its VCI as `namespace/name`.
pub const ANNOTATION_VCI: &str = "vci.flux.loft.sh/vci";

/// Name of the kubeconfig Secret for a VCI: `{prefix}{vci}-kubeconfig`.
pub fn kubeconfig_secret_name(prefix: &str, vci_name: &str) -> String {
    format!("{prefix}{vci_name}-kubeconfig")
}

/// Create or update the kubeconfig Secret in one target namespace. Returns
/// whether an API write happened.
///
/// The no-write path requires both the stored bytes and the fingerprint
/// annotation to match exactly; comparing content byte-for-byte guards
/// against annotation/data skew. On update the identifying labels are merged
/// into whatever labels the Secret already carries.
pub async fn upsert_kubeconfig_secret(
    client: &Client,
    opts: &Options,
    vci: &DynamicObject,
    vci_namespace: &str,
    vci_name: &str,
    target_namespace: &str,
    kubeconfig: &[u8],
    fingerprint: &str,
) -> Result<bool, kube::Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), target_namespace);
    let name = kubeconfig_secret_name(&opts.secret_prefix, vci_name);

    let mut labels = identifying_labels(vci_namespace, vci_name);
    labels.extend(passthrough_labels(
        vci.metadata.labels.as_ref(),
        &opts.passthrough_label_prefixes,
    ));

    let Some(mut existing) = api.get_opt(&name).await? else {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(target_namespace.to_string()),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_FINGERPRINT.to_string(),
                    fingerprint.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                opts.secret_key.clone(),
                ByteString(kubeconfig.to_vec()),
            )])),
            ..Secret::default()
        };
        api.create(&PostParams::default(), &secret).await?;
        info!(vci = %vci_name, namespace = %target_namespace, secret = %name, "created kubeconfig secret");
        return Ok(true);
    };

    if !needs_update(&existing, &opts.secret_key, kubeconfig, fingerprint) {
        debug!(vci = %vci_name, namespace = %target_namespace, secret = %name, "kubeconfig secret up to date");
        return Ok(false);
    }

    existing.data = Some(BTreeMap::from([(
        opts.secret_key.clone(),
        ByteString(kubeconfig.to_vec()),
    )]));
    existing
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_FINGERPRINT.to_string(), fingerprint.to_string());
    existing
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels);
    api.replace(&name, &PostParams::default(), &existing).await?;
    info!(vci = %vci_name, namespace = %target_namespace, secret = %name, "updated kubeconfig secret");
    Ok(true)
}

/// Delete everything derived from a VCI: all labeled kubeconfig Secrets in
/// any namespace, the AccessKey, and the token Secret.
///
/// Each sub-step is best-effort: with the owner gone there is nothing to
/// retry against, so failures are logged and the remaining steps still run.
/// Repeated calls are no-ops.
pub async fn garbage_collect(client: &Client, opts: &Options, vci_namespace: &str, vci_name: &str) {
    if let Err(err) = delete_kubeconfig_secrets(client, vci_namespace, vci_name).await {
        warn!(vci = %vci_name, error = %err, "failed to delete kubeconfig secrets during GC");
    }
    let access_key_ar = crd::access_key();
    if let Err(err) = token::delete_access_key(client, &access_key_ar, vci_name).await {
        warn!(vci = %vci_name, error = %err, "failed to delete AccessKey during GC");
    }
    if let Err(err) = token::delete_token_secret(client, opts, vci_name).await {
        warn!(vci = %vci_name, error = %err, "failed to delete token secret during GC");
    }
    info!(vci = %vci_name, vci_namespace = %vci_namespace, "garbage collected derived state");
}

async fn delete_kubeconfig_secrets(
    client: &Client,
    vci_namespace: &str,
    vci_name: &str,
) -> Result<(), kube::Error> {
    let all_secrets: Api<Secret> = Api::all(client.clone());
    let selector = gc_label_selector(vci_namespace, vci_name);
    let list = all_secrets
        .list(&ListParams::default().labels(&selector))
        .await?;

    for secret in list.items {
        let (Some(name), Some(namespace)) = (
            secret.metadata.name.as_deref(),
            secret.metadata.namespace.as_deref(),
        ) else {
            continue;
        };
        let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
        // The namespace itself may be terminating; absence either way is fine.
        if let Err(err) = ignore_not_found(api.delete(name, &DeleteParams::default()).await) {
            warn!(secret = %name, namespace = %namespace, error = %err, "failed to delete kubeconfig secret");
        } else {
            debug!(secret = %name, namespace = %namespace, "deleted kubeconfig secret");
        }
    }
    Ok(())
}

/// Labels stamped on every kubeconfig Secret; the GC selector below must be
/// able to rediscover the Secret from the VCI key alone.
fn identifying_labels(vci_namespace: &str, vci_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_FLUX_KUBECONFIG.to_string(), "true".to_string()),
        (LABEL_VCI_NAME.to_string(), vci_name.to_string()),
        (LABEL_VCI_NAMESPACE.to_string(), vci_namespace.to_string()),
    ])
}

fn gc_label_selector(vci_namespace: &str, vci_name: &str) -> String {
    format!(
        "{LABEL_MANAGED_BY}={MANAGED_BY},{LABEL_VCI_NAME}={vci_name},{LABEL_VCI_NAMESPACE}={vci_namespace}"
    )
}

/// Copy VCI labels whose keys start with a configured passthrough prefix.
fn passthrough_labels(
    vci_labels: Option<&BTreeMap<String, String>>,
    prefixes: &[String],
) -> BTreeMap<String, String> {
    let Some(vci_labels) = vci_labels else {
        return BTreeMap::new();
    };
    vci_labels
        .iter()
        .filter(|(key, _)| {
            prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && key.starts_with(prefix.as_str()))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Whether the stored Secret drifted from the desired content or fingerprint.
fn needs_update(existing: &Secret, key: &str, kubeconfig: &[u8], fingerprint: &str) -> bool {
    let content_matches = existing
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .is_some_and(|stored| stored.0 == kubeconfig);
    let fingerprint_matches = existing
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_FINGERPRINT))
        .is_some_and(|stored| stored == fingerprint);
    !(content_matches && fingerprint_matches)
}
