//! # Controller Configuration
//!
//! All caller-tunable behavior lives on a single immutable [`Options`] struct,
//! parsed once at startup and shared by reference into every component. There
//! is no ambient global configuration lookup anywhere in the core.

use clap::Parser;

/// Command-line options for the controller.
///
/// Defaults match a stock vcluster platform installation; everything can be
/// overridden per deployment.
#[derive(Debug, Clone, Parser)]
#[command(name = "vci-flux-secret-controller", version, about)]
pub struct Options {
    /// Label selector deciding which VirtualClusterInstances are in scope.
    /// An unparseable selector fails open (all VCIs accepted).
    #[arg(long = "selector", default_value = "vcluster.com/import-fluxcd=true")]
    pub label_selector: String,

    /// Secret.data key under which the kubeconfig is stored
    /// (Flux expects "value" or "value.yaml").
    #[arg(long = "secret-key", default_value = "value")]
    pub secret_key: String,

    /// Prefix for created kubeconfig and token secret names.
    #[arg(long = "secret-name-prefix", default_value = "vci-")]
    pub secret_prefix: String,

    /// Template for the virtual cluster API server URL.
    /// Variables: domain, project, namespace, name.
    #[arg(
        long = "server-template",
        default_value = "https://{{ domain }}/kubernetes/project/{{ project }}/virtualcluster/{{ name }}"
    )]
    pub server_template: String,

    /// Base platform domain substituted into --server-template.
    #[arg(long = "platform-domain", default_value = "beta.us.demo.dev")]
    pub domain: String,

    /// Namespace of the Secret holding a custom CA PEM (optional).
    #[arg(long = "ca-secret-namespace", default_value = "")]
    pub ca_secret_namespace: String,

    /// Name of the Secret holding a custom CA PEM (optional).
    #[arg(long = "ca-secret-name", default_value = "")]
    pub ca_secret_name: String,

    /// Secret.data key holding the PEM-encoded CA.
    #[arg(long = "ca-secret-key", default_value = "ca.pem")]
    pub ca_secret_key: String,

    /// Flux namespace patterns; exact names or shell globs
    /// (e.g. "flux-*,gitops-system").
    #[arg(
        long = "flux-namespaces",
        default_value = "flux-system",
        value_delimiter = ','
    )]
    pub namespace_patterns: Vec<String>,

    /// Namespace the controller runs in; token secrets are stored here.
    #[arg(long = "controller-namespace", default_value = "vci-flux-secret-controller")]
    pub controller_namespace: String,

    /// Label key prefixes copied from the VCI onto each kubeconfig Secret.
    #[arg(
        long = "passthrough-label-prefixes",
        default_value = "flux-app/",
        value_delimiter = ','
    )]
    pub passthrough_label_prefixes: Vec<String>,

    /// AccessKey spec.type (User|Other).
    #[arg(long = "accesskey-type", default_value = "User")]
    pub access_key_type: String,

    /// AccessKey team, populated when --accesskey-type=User.
    #[arg(long = "accesskey-team", default_value = "loft-admins")]
    pub access_key_team: String,

    /// Template for the AccessKey displayName.
    /// Variables: name, project, namespace.
    #[arg(
        long = "accesskey-display-name-template",
        default_value = "flux-{{ name }}"
    )]
    pub access_key_display_name_template: String,
}

impl Options {
    /// Whether a custom CA secret has been configured.
    pub fn ca_secret_configured(&self) -> bool {
        !self.ca_secret_namespace.is_empty() && !self.ca_secret_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(
            std::iter::once("vci-flux-secret-controller").chain(args.iter().copied()),
        )
        .expect("options should parse")
    }

    #[test]
    fn test_defaults() {
        let opts = parse(&[]);
        assert_eq!(opts.secret_key, "value");
        assert_eq!(opts.secret_prefix, "vci-");
        assert_eq!(opts.namespace_patterns, vec!["flux-system".to_string()]);
        assert!(!opts.ca_secret_configured());
    }

    #[test]
    fn test_namespace_patterns_comma_separated() {
        let opts = parse(&["--flux-namespaces", "flux-*,gitops-system"]);
        assert_eq!(
            opts.namespace_patterns,
            vec!["flux-*".to_string(), "gitops-system".to_string()]
        );
    }

    #[test]
    fn test_ca_secret_requires_namespace_and_name() {
        let opts = parse(&["--ca-secret-name", "platform-ca"]);
        assert!(!opts.ca_secret_configured());

        let opts = parse(&[
            "--ca-secret-name",
            "platform-ca",
            "--ca-secret-namespace",
            "cert-manager",
        ]);
        assert!(opts.ca_secret_configured());
    }
}
