//! Ambient registry credential lookup.
//!
//! Reads the Docker credential store at `~/.docker/config.json` (the
//! `auths` map, with either a base64 `auth` blob or plain username/password
//! fields). `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` override everything.
//! Credential helper binaries (`credsStore`) are not consulted.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;

/// One entry in the Docker config `auths` map.
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// The subset of `~/.docker/config.json` we care about.
#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Resolves per-registry credentials from the ambient credential store.
pub struct CredentialStore {
    config: DockerConfig,
}

impl CredentialStore {
    /// Load the ambient store. Missing or unparseable config files are
    /// treated as empty; lookups then fall back to anonymous.
    pub fn load() -> Self {
        let config = Self::config_path()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default();
        Self { config }
    }

    /// Construct from explicit JSON content (used by tests).
    #[cfg(test)]
    fn from_json(data: &str) -> Self {
        Self {
            config: serde_json::from_str(data).unwrap_or_default(),
        }
    }

    /// Resolve authentication for a registry host.
    ///
    /// `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` win when both are set;
    /// otherwise the Docker config entry for the registry (or its Docker
    /// Hub aliases) is used; otherwise anonymous.
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        if let (Ok(user), Ok(pass)) = (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            return RegistryAuth::Basic(user, pass);
        }

        let wanted = normalize_registry(registry);
        for (key, entry) in &self.config.auths {
            if normalize_registry(key) != wanted {
                continue;
            }
            if let Some(auth) = self.decode_entry(entry) {
                return auth;
            }
        }

        RegistryAuth::Anonymous
    }

    fn decode_entry(&self, entry: &AuthEntry) -> Option<RegistryAuth> {
        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Some(RegistryAuth::Basic(user.clone(), pass.clone()));
        }

        let encoded = entry.auth.as_deref()?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some(RegistryAuth::Basic(user.to_string(), pass.to_string()))
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|h| h.join(".docker").join("config.json"))
    }
}

/// Collapse Docker Hub aliases onto one name and strip URL decoration.
fn normalize_registry(registry: &str) -> String {
    let r = registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let r = r.split('/').next().unwrap_or(r).to_lowercase();
    match r.as_str() {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "index.docker.io".to_string(),
        _ => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_from_base64_entry() {
        // "user:pass" base64-encoded
        let store = CredentialStore::from_json(
            r#"{"auths":{"ghcr.io":{"auth":"dXNlcjpwYXNz"}}}"#,
        );
        match store.auth_for("ghcr.io") {
            RegistryAuth::Basic(u, p) => {
                assert_eq!(u, "user");
                assert_eq!(p, "pass");
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[test]
    fn test_auth_from_plain_fields() {
        let store = CredentialStore::from_json(
            r#"{"auths":{"quay.io":{"username":"u1","password":"p1"}}}"#,
        );
        assert!(matches!(
            store.auth_for("quay.io"),
            RegistryAuth::Basic(u, p) if u == "u1" && p == "p1"
        ));
    }

    #[test]
    fn test_unknown_registry_is_anonymous() {
        let store = CredentialStore::from_json(r#"{"auths":{}}"#);
        assert!(matches!(store.auth_for("ghcr.io"), RegistryAuth::Anonymous));
    }

    #[test]
    fn test_docker_hub_aliases() {
        let store = CredentialStore::from_json(
            r#"{"auths":{"https://index.docker.io/v1/":{"auth":"dXNlcjpwYXNz"}}}"#,
        );
        assert!(matches!(
            store.auth_for("docker.io"),
            RegistryAuth::Basic(_, _)
        ));
        assert!(matches!(
            store.auth_for("registry-1.docker.io"),
            RegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_malformed_auth_falls_back_to_anonymous() {
        let store = CredentialStore::from_json(
            r#"{"auths":{"ghcr.io":{"auth":"!!! not base64 !!!"}}}"#,
        );
        assert!(matches!(store.auth_for("ghcr.io"), RegistryAuth::Anonymous));
    }

    #[test]
    fn test_normalize_registry() {
        assert_eq!(normalize_registry("docker.io"), "index.docker.io");
        assert_eq!(normalize_registry("https://index.docker.io/v1/"), "index.docker.io");
        assert_eq!(normalize_registry("GHCR.IO"), "ghcr.io");
    }
}
