//! # Kubeconfig Builder
//!
//! Pure, side-effect-free rendering of the kubeconfig document published into
//! Flux namespaces. Two steps:
//!
//! 1. [`render_server_url`] - substitutes `{domain, project, namespace, name}`
//!    into the configured URL template (strict: an undefined variable or a
//!    syntax error is a hard error, never a blank URL)
//! 2. [`build_kubeconfig`] - serializes a minimal single-cluster /
//!    single-context / single-user JSON document and fingerprints the exact
//!    bytes with SHA-256
//!
//! JSON kubeconfigs are accepted by client-go and therefore by Flux. The CA
//! is embedded base64-encoded when present and the field is omitted entirely
//! when absent; there is no implicit insecure-skip-verify fallback.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use minijinja::{context, Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Variables available to the server URL template.
#[derive(Debug, Clone)]
pub struct ServerVars<'a> {
    pub domain: &'a str,
    pub project: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
    pub users: Vec<NamedUser>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub server: String,
    #[serde(
        rename = "certificate-authority-data",
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_authority_data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct User {
    pub token: String,
}

/// Render the virtual cluster API server URL from its template.
///
/// Undefined variables are rejected rather than rendered empty, so a typo in
/// the template surfaces as a reconcile error instead of a broken kubeconfig.
pub fn render_server_url(template: &str, vars: &ServerVars<'_>) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(
        template,
        context! {
            domain => vars.domain,
            project => vars.project,
            namespace => vars.namespace,
            name => vars.name,
        },
    )
}

/// Render an AccessKey display name from its template.
pub fn render_display_name(
    template: &str,
    vars: &ServerVars<'_>,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(
        template,
        context! {
            name => vars.name,
            project => vars.project,
            namespace => vars.namespace,
        },
    )
}

/// Build the serialized kubeconfig plus its lowercase-hex SHA-256 fingerprint.
///
/// The fingerprint is computed over the exact serialized bytes and is what the
/// secret synchronizer stores alongside the content for change detection.
pub fn build_kubeconfig(
    server: &str,
    name: &str,
    token: &str,
    ca_pem: Option<&[u8]>,
) -> Result<(Vec<u8>, String), serde_json::Error> {
    let config = Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: name.to_string(),
            cluster: Cluster {
                server: server.to_string(),
                certificate_authority_data: ca_pem
                    .filter(|pem| !pem.is_empty())
                    .map(|pem| BASE64_STANDARD.encode(pem)),
            },
        }],
        contexts: vec![NamedContext {
            name: name.to_string(),
            context: Context {
                cluster: name.to_string(),
                user: name.to_string(),
            },
        }],
        current_context: name.to_string(),
        users: vec![NamedUser {
            name: name.to_string(),
            user: User {
                token: token.to_string(),
            },
        }],
    };

    let bytes = serde_json::to_vec(&config)?;
    let fingerprint = fingerprint(&bytes);
    Ok((bytes, fingerprint))
}

/// Lowercase-hex SHA-256 of the given bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn vars<'a>() -> ServerVars<'a> {
        ServerVars {
            domain: "platform.example.com",
            project: "demo",
            namespace: "p-demo",
            name: "app1",
        }
    }

    mod server_url {
        use super::*;

        #[test]
        fn test_render_substitutes_all_variables() {
            let url = render_server_url(
                "https://{{ domain }}/kubernetes/project/{{ project }}/virtualcluster/{{ name }}",
                &vars(),
            )
            .unwrap();
            assert_eq!(
                url,
                "https://platform.example.com/kubernetes/project/demo/virtualcluster/app1"
            );
        }

        #[test]
        fn test_render_undefined_variable_is_error() {
            let err = render_server_url("https://{{ domain }}/{{ cluster_id }}", &vars());
            assert!(err.is_err());
        }

        #[test]
        fn test_render_syntax_error_is_error() {
            let err = render_server_url("https://{{ domain", &vars());
            assert!(err.is_err());
        }

        #[test]
        fn test_render_display_name() {
            let name = render_display_name("flux-{{ name }}", &vars()).unwrap();
            assert_eq!(name, "flux-app1");
        }
    }

    mod document {
        use super::*;

        #[test]
        fn test_round_trip_without_ca() {
            let (bytes, _) = build_kubeconfig("https://x/y", "dev", "abc", None).unwrap();
            let doc: Value = serde_json::from_slice(&bytes).unwrap();

            assert_eq!(doc["apiVersion"], "v1");
            assert_eq!(doc["kind"], "Config");
            assert_eq!(doc["current-context"], "dev");
            assert_eq!(doc["clusters"][0]["name"], "dev");
            assert_eq!(doc["clusters"][0]["cluster"]["server"], "https://x/y");
            assert_eq!(doc["contexts"][0]["context"]["cluster"], "dev");
            assert_eq!(doc["contexts"][0]["context"]["user"], "dev");
            assert_eq!(doc["users"][0]["user"]["token"], "abc");

            // No TLS fields at all when no CA was supplied.
            assert!(doc["clusters"][0]["cluster"]
                .get("certificate-authority-data")
                .is_none());
            assert!(doc["clusters"][0]["cluster"]
                .get("insecure-skip-tls-verify")
                .is_none());
        }

        #[test]
        fn test_ca_embedded_as_base64() {
            let pem = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
            let (bytes, _) = build_kubeconfig("https://x/y", "dev", "abc", Some(pem)).unwrap();
            let doc: Value = serde_json::from_slice(&bytes).unwrap();

            let encoded = doc["clusters"][0]["cluster"]["certificate-authority-data"]
                .as_str()
                .unwrap();
            assert_eq!(BASE64_STANDARD.decode(encoded).unwrap(), pem);
        }

        #[test]
        fn test_empty_ca_treated_as_absent() {
            let (bytes, _) = build_kubeconfig("https://x/y", "dev", "abc", Some(b"")).unwrap();
            let doc: Value = serde_json::from_slice(&bytes).unwrap();
            assert!(doc["clusters"][0]["cluster"]
                .get("certificate-authority-data")
                .is_none());
        }

        #[test]
        fn test_build_is_deterministic() {
            let first = build_kubeconfig("https://x/y", "dev", "abc", None).unwrap();
            let second = build_kubeconfig("https://x/y", "dev", "abc", None).unwrap();
            assert_eq!(first.0, second.0);
            assert_eq!(first.1, second.1);
        }
    }

    mod digest {
        use super::*;

        #[test]
        fn test_fingerprint_is_sha256_hex() {
            // SHA-256 of the empty input, well-known vector.
            assert_eq!(
                fingerprint(b""),
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            );
            assert_eq!(fingerprint(b"abc").len(), 64);
            assert!(fingerprint(b"abc").chars().all(|c| c.is_ascii_hexdigit()
                && !c.is_ascii_uppercase()));
        }

        #[test]
        fn test_fingerprint_changes_with_one_byte() {
            let a = fingerprint(b"kubeconfig-a");
            let b = fingerprint(b"kubeconfig-b");
            assert_ne!(a, b);
        }

        #[test]
        fn test_fingerprint_matches_built_bytes() {
            let (bytes, sum) = build_kubeconfig("https://x/y", "dev", "abc", None).unwrap();
            assert_eq!(sum, fingerprint(&bytes));
        }
    }
}
