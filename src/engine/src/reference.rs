//! Image reference utilities.
//!
//! Splits references like `registry.io:5000/ns/app:1.2.0` into repository
//! and tag, normalizes short `--since` tags against the main reference, and
//! derives bundle filenames.

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Split an image reference into `(repository, tag)`.
///
/// The split happens on the rightmost `:` after the last `/`, so a
/// registry host port is never mistaken for a tag. A reference without a
/// tag gets `latest`.
pub fn parse_reference(reference: &str) -> (String, String) {
    let split_at = match reference.rfind('/') {
        Some(slash) => reference[slash + 1..].rfind(':').map(|c| slash + 1 + c),
        None => reference.rfind(':'),
    };

    match split_at {
        Some(colon) => (
            reference[..colon].to_string(),
            reference[colon + 1..].to_string(),
        ),
        None => (reference.to_string(), DEFAULT_TAG.to_string()),
    }
}

/// Normalize a `--since` reference against the main reference.
///
/// A bare tag such as `3.19` inherits the main reference's repository,
/// producing `alpine:3.19`. Anything containing `/` or `:` is already a
/// full reference and is returned verbatim.
pub fn normalize_since_ref(main_ref: &str, since_ref: &str) -> String {
    if since_ref.contains('/') || since_ref.contains(':') {
        return since_ref.to_string();
    }

    let (repo, _) = parse_reference(main_ref);
    format!("{}:{}", repo, since_ref)
}

/// Replace filesystem-hostile characters in a repository name.
pub fn sanitize_repo(repo: &str) -> String {
    repo.replace('/', "_").replace(':', "_")
}

/// Build the bundle filename for an export.
///
/// Format: `{sanitizedRepo}-{tag}__since-{baseTag|none}.tar.gz`.
pub fn bundle_filename(repo: &str, tag: &str, since_ref: Option<&str>) -> String {
    let since_tag = match since_ref {
        Some(s) if !s.is_empty() => parse_reference(s).1,
        _ => "none".to_string(),
    };

    format!("{}-{}__since-{}.tar.gz", sanitize_repo(repo), tag, since_tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_simple() {
        assert_eq!(
            parse_reference("alpine"),
            ("alpine".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn test_parse_reference_with_tag() {
        assert_eq!(
            parse_reference("alpine:3.20"),
            ("alpine".to_string(), "3.20".to_string())
        );
    }

    #[test]
    fn test_parse_reference_namespaced() {
        assert_eq!(
            parse_reference("myorg/app:1.0.0"),
            ("myorg/app".to_string(), "1.0.0".to_string())
        );
    }

    #[test]
    fn test_parse_reference_registry_port_no_tag() {
        // The port colon is before the last slash and must not become a tag.
        assert_eq!(
            parse_reference("registry.io:5000/app"),
            ("registry.io:5000/app".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn test_parse_reference_registry_port_with_tag() {
        assert_eq!(
            parse_reference("registry.io:5000/app:v2"),
            ("registry.io:5000/app".to_string(), "v2".to_string())
        );
    }

    #[test]
    fn test_normalize_since_bare_tag() {
        assert_eq!(normalize_since_ref("alpine:3.20", "3.19"), "alpine:3.19");
    }

    #[test]
    fn test_normalize_since_bare_tag_namespaced() {
        assert_eq!(
            normalize_since_ref("myorg/app:1.2.9", "1.2.8"),
            "myorg/app:1.2.8"
        );
    }

    #[test]
    fn test_normalize_since_full_reference() {
        assert_eq!(
            normalize_since_ref("alpine:3.20", "debian:12"),
            "debian:12"
        );
    }

    #[test]
    fn test_normalize_since_with_repo() {
        assert_eq!(
            normalize_since_ref("alpine:3.20", "myorg/base"),
            "myorg/base"
        );
    }

    #[test]
    fn test_sanitize_repo() {
        assert_eq!(sanitize_repo("registry.io:5000/ns/app"), "registry.io_5000_ns_app");
        assert_eq!(sanitize_repo("alpine"), "alpine");
    }

    #[test]
    fn test_bundle_filename_full_export() {
        assert_eq!(
            bundle_filename("alpine", "3.20", None),
            "alpine-3.20__since-none.tar.gz"
        );
    }

    #[test]
    fn test_bundle_filename_incremental() {
        assert_eq!(
            bundle_filename("myorg/app", "1.2.9", Some("myorg/app:1.2.8")),
            "myorg_app-1.2.9__since-1.2.8.tar.gz"
        );
    }
}
