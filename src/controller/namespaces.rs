//! # Namespace Pattern Resolver
//!
//! Turns the configured Flux namespace patterns (exact names or shell globs)
//! into the concrete set of namespaces to publish kubeconfig Secrets into.
//!
//! Exact patterns pass through verbatim without any API traffic - a
//! deployment that only configures literal names needs no permission to list
//! namespaces. Globs are matched against a point-in-time namespace listing.
//! Malformed glob patterns are ignored with a warning rather than blocking
//! reconciliation.

use std::collections::BTreeSet;

use glob::Pattern;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::warn;

/// Pattern applied when none are configured.
pub const DEFAULT_PATTERN: &str = "flux-system";

/// Characters that mark a pattern as a glob rather than an exact name.
const GLOB_METACHARACTERS: &[char] = &['*', '?', '[', ']'];

/// Parsed, de-duplicated namespace patterns split into exact names and globs.
#[derive(Debug, Clone)]
pub struct NamespacePatterns {
    exact: BTreeSet<String>,
    globs: Vec<Pattern>,
}

impl NamespacePatterns {
    /// Parse raw pattern strings: trim whitespace, drop empties, de-duplicate,
    /// and classify each as exact or glob. An empty input falls back to
    /// [`DEFAULT_PATTERN`].
    pub fn parse(patterns: &[String]) -> Self {
        let mut cleaned: Vec<&str> = patterns
            .iter()
            .map(|raw| raw.trim())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        if cleaned.is_empty() {
            cleaned.push(DEFAULT_PATTERN);
        }

        let mut seen = BTreeSet::new();
        let mut exact = BTreeSet::new();
        let mut globs = Vec::new();
        for pattern in cleaned {
            if !seen.insert(pattern) {
                continue;
            }
            if pattern.contains(GLOB_METACHARACTERS) {
                match Pattern::new(pattern) {
                    Ok(glob) => globs.push(glob),
                    // A malformed glob matches nothing; it must never block
                    // reconciliation of the remaining patterns.
                    Err(err) => warn!(pattern, error = %err, "ignoring malformed namespace glob"),
                }
            } else {
                exact.insert(pattern.to_string());
            }
        }

        Self { exact, globs }
    }

    /// Whether resolving requires a namespace listing (any glob present).
    pub fn needs_namespace_listing(&self) -> bool {
        !self.globs.is_empty()
    }

    /// The exact (non-glob) pattern names. These pass through to the result
    /// unconditionally, whether or not such a namespace currently exists.
    pub fn exact_names(&self) -> BTreeSet<String> {
        self.exact.clone()
    }

    /// Match glob patterns against existing namespace names and union in the
    /// exact names. Pure; the caller supplies the point-in-time listing.
    pub fn resolve<'a, I>(&self, existing: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out: BTreeSet<String> = existing
            .into_iter()
            .filter(|name| self.globs.iter().any(|glob| glob.matches(name)))
            .map(str::to_string)
            .collect();
        out.extend(self.exact.iter().cloned());
        out
    }
}

/// Resolve the target namespace set, listing namespaces only when a glob
/// pattern is configured.
pub async fn resolve_target_namespaces(
    client: Client,
    patterns: &NamespacePatterns,
) -> Result<BTreeSet<String>, kube::Error> {
    if !patterns.needs_namespace_listing() {
        return Ok(patterns.exact_names());
    }

    let namespaces: Api<Namespace> = Api::all(client);
    let list = namespaces.list(&ListParams::default()).await?;
    let names = list
        .items
        .iter()
        .filter_map(|ns| ns.metadata.name.as_deref());
    Ok(patterns.resolve(names))
}
