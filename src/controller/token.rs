//! # Token / AccessKey Manager
//!
//! Ensures a durable bearer token exists for a VCI and that the platform
//! `AccessKey` resource binding that token to the virtual cluster stays in
//! sync. The token Secret in the controller namespace is the single source of
//! truth: once minted, the same token is reused verbatim on every reconcile
//! and flows into both the AccessKey and every published kubeconfig. There is
//! no automatic rotation - deleting the token Secret is the only way to force
//! a re-mint.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{ApiResource, DeleteParams, ObjectMeta, PostParams};
use kube::core::DynamicObject;
use kube::{Api, Client};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::kubeconfig::{self, ServerVars};
use super::reconciler::ReconcileError;
use super::secrets::{ANNOTATION_VCI, LABEL_MANAGED_BY, MANAGED_BY};
use super::ignore_not_found;
use crate::config::Options;

/// Secret.data key holding the raw bearer token.
pub const TOKEN_KEY: &str = "token";

/// Entropy of a freshly minted token, before base64 encoding.
const TOKEN_ENTROPY_BYTES: usize = 48;

/// Name of the token Secret for a VCI: `{prefix}{vci}-ak`.
pub fn token_secret_name(prefix: &str, vci_name: &str) -> String {
    format!("{prefix}{vci_name}-ak")
}

/// Name of the AccessKey resource for a VCI.
pub fn access_key_name(vci_name: &str) -> String {
    format!("loft-vcluster-{vci_name}")
}

/// Derive the platform project from the VCI namespace.
///
/// Platform convention names project namespaces `p-<project>`; anything else
/// maps to the "default" project. Namespaces that merely happen to start with
/// `p-` are indistinguishable from project namespaces here.
pub fn project_from_namespace(namespace: &str) -> &str {
    namespace
        .strip_prefix("p-")
        .filter(|project| !project.is_empty())
        .unwrap_or("default")
}

/// Mint a new bearer token: 48 bytes of OS entropy, URL-safe unpadded base64.
pub fn mint_token() -> Result<String, rand::Error> {
    let mut raw = Zeroizing::new([0u8; TOKEN_ENTROPY_BYTES]);
    OsRng.try_fill_bytes(&mut raw[..])?;
    Ok(URL_SAFE_NO_PAD.encode(&raw[..]))
}

/// Ensure a bearer token exists for the VCI and that the AccessKey reflects
/// the current token and scope. Returns the token to embed into kubeconfigs.
///
/// Reuses the token from an existing token Secret; otherwise mints one,
/// upserts the AccessKey, then persists the token Secret (repairing rather
/// than failing on a create race). Partial state is never treated as success:
/// any step error propagates and the next redelivery retries the whole
/// sequence.
pub async fn ensure_token(
    client: &Client,
    opts: &Options,
    access_key_ar: &ApiResource,
    vci_namespace: &str,
    vci_name: &str,
) -> Result<String, ReconcileError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &opts.controller_namespace);
    let token_name = token_secret_name(&opts.secret_prefix, vci_name);

    // Reuse an existing token verbatim; token identity persists across
    // reconciles and AccessKey recreation.
    if let Some(existing) = secrets.get_opt(&token_name).await? {
        if let Some(token) = stored_token(&existing) {
            debug!(vci = %vci_name, secret = %token_name, "reusing existing access token");
            return Ok(token);
        }
    }

    let token = mint_token()?;

    upsert_access_key(client, opts, access_key_ar, vci_namespace, vci_name, &token).await?;

    let desired = token_secret(opts, &token_name, vci_namespace, vci_name, &token);
    match secrets.create(&PostParams::default(), &desired).await {
        Ok(_) => {}
        // Lost a create race: overwrite the token field and VCI reference
        // instead of failing, so both writers converge on one token.
        Err(kube::Error::Api(err)) if err.code == 409 => {
            if let Some(mut existing) = secrets.get_opt(&token_name).await? {
                existing
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(TOKEN_KEY.to_string(), ByteString(token.clone().into_bytes()));
                existing
                    .metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(
                        ANNOTATION_VCI.to_string(),
                        format!("{vci_namespace}/{vci_name}"),
                    );
                secrets
                    .replace(&token_name, &PostParams::default(), &existing)
                    .await?;
            }
        }
        Err(err) => return Err(err.into()),
    }

    info!(vci = %vci_name, secret = %token_name, "minted access token");
    Ok(token)
}

/// Delete the AccessKey for a VCI; absence is success.
pub async fn delete_access_key(
    client: &Client,
    access_key_ar: &ApiResource,
    vci_name: &str,
) -> Result<(), kube::Error> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), access_key_ar);
    ignore_not_found(
        api.delete(&access_key_name(vci_name), &DeleteParams::default())
            .await,
    )
}

/// Delete the token Secret for a VCI; absence is success.
pub async fn delete_token_secret(
    client: &Client,
    opts: &Options,
    vci_name: &str,
) -> Result<(), kube::Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &opts.controller_namespace);
    ignore_not_found(
        api.delete(
            &token_secret_name(&opts.secret_prefix, vci_name),
            &DeleteParams::default(),
        )
        .await,
    )
}

/// Extract a non-empty, valid-UTF-8 token from a token Secret. Corrupted
/// content reads as absent, which forces a repair re-mint.
fn stored_token(secret: &Secret) -> Option<String> {
    let data = secret.data.as_ref()?;
    let bytes = data.get(TOKEN_KEY)?;
    String::from_utf8(bytes.0.clone())
        .ok()
        .filter(|token| !token.is_empty())
}

async fn upsert_access_key(
    client: &Client,
    opts: &Options,
    access_key_ar: &ApiResource,
    vci_namespace: &str,
    vci_name: &str,
    token: &str,
) -> Result<(), ReconcileError> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), access_key_ar);
    let name = access_key_name(vci_name);
    let project = project_from_namespace(vci_namespace);

    let display_name = kubeconfig::render_display_name(
        &opts.access_key_display_name_template,
        &ServerVars {
            domain: &opts.domain,
            project,
            namespace: vci_namespace,
            name: vci_name,
        },
    )?;
    let spec = access_key_spec(opts, vci_namespace, vci_name, project, token, &display_name);

    match api.get_opt(&name).await? {
        None => {
            let mut access_key = DynamicObject::new(&name, access_key_ar);
            access_key.metadata.labels = Some(access_key_labels(vci_namespace, vci_name));
            access_key.data = json!({ "spec": spec });
            api.create(&PostParams::default(), &access_key).await?;
            debug!(vci = %vci_name, access_key = %name, "created AccessKey");
        }
        Some(mut access_key) => {
            // Overwrite the spec but merge labels; unrelated pre-existing
            // labels must survive.
            match access_key.data {
                Value::Object(ref mut fields) => {
                    fields.insert("spec".to_string(), spec);
                }
                _ => access_key.data = json!({ "spec": spec }),
            }
            access_key
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(access_key_labels(vci_namespace, vci_name));
            api.replace(&name, &PostParams::default(), &access_key)
                .await?;
            debug!(vci = %vci_name, access_key = %name, "updated AccessKey");
        }
    }
    Ok(())
}

fn access_key_labels(vci_namespace: &str, vci_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("loft.sh/vcluster".to_string(), "true".to_string()),
        (
            "loft.sh/vcluster-instance-name".to_string(),
            vci_name.to_string(),
        ),
        (
            "loft.sh/vcluster-instance-namespace".to_string(),
            vci_namespace.to_string(),
        ),
    ])
}

fn access_key_spec(
    opts: &Options,
    vci_namespace: &str,
    vci_name: &str,
    project: &str,
    token: &str,
    display_name: &str,
) -> Value {
    let mut spec = json!({
        "key": token,
        "type": opts.access_key_type,
        "displayName": display_name,
        "scope": {
            "roles": [{ "role": "vcluster" }],
            "virtualClusters": [{ "project": project, "virtualCluster": vci_name }],
        },
        "groups": [
            format!("loft:vcluster:{vci_namespace}:{vci_name}"),
            "loft:system:vclusters",
        ],
    });
    if opts.access_key_type == "User" && !opts.access_key_team.is_empty() {
        spec["team"] = json!(opts.access_key_team);
    }
    spec
}

fn token_secret(
    opts: &Options,
    token_name: &str,
    vci_namespace: &str,
    vci_name: &str,
    token: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(token_name.to_string()),
            namespace: Some(opts.controller_namespace.clone()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                MANAGED_BY.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_VCI.to_string(),
                format!("{vci_namespace}/{vci_name}"),
            )])),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            TOKEN_KEY.to_string(),
            ByteString(token.as_bytes().to_vec()),
        )])),
        ..Secret::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn options() -> Options {
        Options::try_parse_from(["vci-flux-secret-controller"]).unwrap()
    }

    mod naming {
        use super::*;

        #[test]
        fn test_token_secret_name() {
            assert_eq!(token_secret_name("vci-", "dev"), "vci-dev-ak");
        }

        #[test]
        fn test_access_key_name() {
            assert_eq!(access_key_name("dev"), "loft-vcluster-dev");
        }

        #[test]
        fn test_project_from_namespace() {
            assert_eq!(project_from_namespace("p-demo"), "demo");
            assert_eq!(project_from_namespace("team-a"), "default");
            assert_eq!(project_from_namespace("default"), "default");
            // Bare "p-" has no project suffix.
            assert_eq!(project_from_namespace("p-"), "default");
        }
    }

    mod minting {
        use super::*;

        #[test]
        fn test_mint_token_is_url_safe_unpadded() {
            let token = mint_token().unwrap();
            // 48 bytes of entropy encode to 64 base64 characters, no padding.
            assert_eq!(token.len(), 64);
            assert!(token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }

        #[test]
        fn test_mint_token_is_random() {
            assert_ne!(mint_token().unwrap(), mint_token().unwrap());
        }
    }

    mod stored {
        use super::*;

        fn secret_with_token(bytes: &[u8]) -> Secret {
            Secret {
                data: Some(BTreeMap::from([(
                    TOKEN_KEY.to_string(),
                    ByteString(bytes.to_vec()),
                )])),
                ..Secret::default()
            }
        }

        #[test]
        fn test_stored_token_reused_verbatim() {
            let secret = secret_with_token(b"existing-token");
            assert_eq!(stored_token(&secret), Some("existing-token".to_string()));
        }

        #[test]
        fn test_empty_or_missing_token_forces_remint() {
            assert_eq!(stored_token(&secret_with_token(b"")), None);
            assert_eq!(stored_token(&Secret::default()), None);
        }

        #[test]
        fn test_corrupt_token_reads_as_absent() {
            assert_eq!(stored_token(&secret_with_token(&[0xff, 0xfe])), None);
        }
    }

    mod access_key {
        use super::*;

        #[test]
        fn test_spec_shape() {
            let spec = access_key_spec(&options(), "p-demo", "dev", "demo", "tok", "flux-dev");
            assert_eq!(spec["key"], "tok");
            assert_eq!(spec["type"], "User");
            assert_eq!(spec["team"], "loft-admins");
            assert_eq!(spec["displayName"], "flux-dev");
            assert_eq!(spec["scope"]["roles"][0]["role"], "vcluster");
            assert_eq!(spec["scope"]["virtualClusters"][0]["project"], "demo");
            assert_eq!(spec["scope"]["virtualClusters"][0]["virtualCluster"], "dev");
            assert_eq!(spec["groups"][0], "loft:vcluster:p-demo:dev");
            assert_eq!(spec["groups"][1], "loft:system:vclusters");
        }

        #[test]
        fn test_team_omitted_for_non_user_type() {
            let mut opts = options();
            opts.access_key_type = "Other".to_string();
            let spec = access_key_spec(&opts, "p-demo", "dev", "demo", "tok", "flux-dev");
            assert_eq!(spec["type"], "Other");
            assert!(spec.get("team").is_none());
        }

        #[test]
        fn test_identifying_labels() {
            let labels = access_key_labels("team-a", "dev");
            assert_eq!(labels["loft.sh/vcluster"], "true");
            assert_eq!(labels["loft.sh/vcluster-instance-name"], "dev");
            assert_eq!(labels["loft.sh/vcluster-instance-namespace"], "team-a");
        }
    }

    mod token_secret_shape {
        use super::*;

        #[test]
        fn test_token_secret_carries_reference_annotation() {
            let secret = token_secret(&options(), "vci-dev-ak", "team-a", "dev", "tok");
            assert_eq!(secret.metadata.name.as_deref(), Some("vci-dev-ak"));
            assert_eq!(
                secret.metadata.namespace.as_deref(),
                Some("vci-flux-secret-controller")
            );
            assert_eq!(
                secret.metadata.annotations.unwrap()[ANNOTATION_VCI],
                "team-a/dev"
            );
            assert_eq!(
                secret.data.unwrap()[TOKEN_KEY],
                ByteString(b"tok".to_vec())
            );
        }
    }
}
