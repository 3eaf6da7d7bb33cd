//! Server configuration, loaded in layers: defaults, environment, JSON file, CLI flags.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::identity::BackendAccount;

pub const DEFAULT_SERVICE_URL: &str = "http://:8080";
pub const DEFAULT_BACKEND_PORT: u16 = 1247;
pub const DEFAULT_AUTH_SCHEME: &str = "native";
pub const DEFAULT_SHARED_DIR_NAME: &str = "shared";
pub const DEFAULT_SESSION_POOL_TTL_SECS: u64 = 10 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub username: String,
    pub password: String,
    pub auth_scheme: String,
    /// Let the service account act for bearer-authenticated users that carry no password.
    pub proxy_auth: bool,
    pub shared_dir_name: String,
    pub default_resource: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_BACKEND_PORT,
            zone: String::new(),
            username: String::new(),
            password: String::new(),
            auth_scheme: DEFAULT_AUTH_SCHEME.to_string(),
            proxy_auth: false,
            shared_dir_name: DEFAULT_SHARED_DIR_NAME.to_string(),
            default_resource: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OAuth2Config {
    /// URL of the authorization server's `.well-known/openid-configuration` document.
    pub discovery_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub remote: bool,
    pub service_url: String,
    /// Externally visible base URL when the server sits behind a proxy.
    pub public_service_url: Option<String>,
    pub debug: bool,
    pub log_path: Option<String>,
    pub backend: BackendConfig,
    pub oauth2: Option<OAuth2Config>,
    pub session_pool_ttl_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            remote: false,
            service_url: DEFAULT_SERVICE_URL.to_string(),
            public_service_url: None,
            debug: false,
            log_path: None,
            backend: BackendConfig::default(),
            oauth2: None,
            session_pool_ttl_secs: DEFAULT_SESSION_POOL_TTL_SECS,
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Overlay `overlay` onto `base`, recursing into objects so unspecified keys keep their value.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(existing) if existing.is_object() && v.is_object() => merge_json(existing, v),
                    _ => { b.insert(k, v); }
                }
            }
        }
        (b, o) => *b = o,
    }
}

impl GateConfig {
    /// Apply `IRODS_MCP_SVR_*` and `IRODS_*` variables from the process environment.
    pub fn from_env(existing: GateConfig) -> Result<GateConfig> {
        Self::from_env_with(existing, |k| std::env::var(k).ok())
    }

    pub fn from_env_with<F>(existing: GateConfig, lookup: F) -> Result<GateConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = existing;
        let bool_var = |name: &str| -> Result<Option<bool>> {
            match lookup(name) {
                Some(v) => parse_bool(&v).map(Some).ok_or_else(|| anyhow!("invalid boolean for {}: {:?}", name, v)),
                None => Ok(None),
            }
        };

        if let Some(v) = bool_var("IRODS_MCP_SVR_REMOTE")? { cfg.remote = v; }
        if let Some(v) = lookup("IRODS_MCP_SVR_SERVICE_URL") { cfg.service_url = v; }
        if let Some(v) = lookup("IRODS_MCP_SVR_PUBLIC_SERVICE_URL") { cfg.public_service_url = Some(v); }
        if let Some(v) = bool_var("IRODS_MCP_SVR_DEBUG")? { cfg.debug = v; }
        if let Some(v) = lookup("IRODS_MCP_SVR_LOG_PATH") { cfg.log_path = Some(v); }
        if let Some(v) = lookup("IRODS_MCP_SVR_SESSION_POOL_TTL_SECS") {
            cfg.session_pool_ttl_secs = v.trim().parse()
                .with_context(|| format!("invalid IRODS_MCP_SVR_SESSION_POOL_TTL_SECS: {:?}", v))?;
        }

        if let Some(v) = lookup("IRODS_HOST") { cfg.backend.host = v; }
        if let Some(v) = lookup("IRODS_PORT") {
            cfg.backend.port = v.trim().parse().with_context(|| format!("invalid IRODS_PORT: {:?}", v))?;
        }
        if let Some(v) = lookup("IRODS_ZONE_NAME") { cfg.backend.zone = v; }
        if let Some(v) = lookup("IRODS_USER_NAME") { cfg.backend.username = v; }
        if let Some(v) = lookup("IRODS_USER_PASSWORD") { cfg.backend.password = v; }
        if let Some(v) = lookup("IRODS_AUTHENTICATION_SCHEME") { cfg.backend.auth_scheme = v; }
        if let Some(v) = bool_var("IRODS_PROXY_AUTH")? { cfg.backend.proxy_auth = v; }
        if let Some(v) = lookup("IRODS_SHARED_DIR_NAME") { cfg.backend.shared_dir_name = v; }
        if let Some(v) = lookup("IRODS_DEFAULT_RESOURCE") { cfg.backend.default_resource = v; }

        let discovery = lookup("IRODS_MCP_SVR_OIDC_DISCOVERY_URL");
        let client_id = lookup("IRODS_MCP_SVR_OAUTH2_CLIENT_ID");
        let client_secret = lookup("IRODS_MCP_SVR_OAUTH2_CLIENT_SECRET");
        if discovery.is_some() || client_id.is_some() || client_secret.is_some() {
            let oauth2 = cfg.oauth2.get_or_insert_with(OAuth2Config::default);
            if let Some(v) = discovery { oauth2.discovery_url = v; }
            if let Some(v) = client_id { oauth2.client_id = v; }
            if let Some(v) = client_secret { oauth2.client_secret = v; }
        }

        Ok(cfg)
    }

    /// Overlay a JSON config file on top of `existing`; keys absent from the file keep their value.
    pub fn from_json_file(existing: GateConfig, path: impl AsRef<Path>) -> Result<GateConfig> {
        let path = path.as_ref();
        if path.is_dir() {
            bail!("config path {:?} is a directory", path);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let overlay: Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        let mut base = serde_json::to_value(&existing)?;
        merge_json(&mut base, overlay);
        serde_json::from_value(base)
            .with_context(|| format!("failed to unmarshal config file {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote
            && !self.service_url.starts_with("http://")
            && !self.service_url.starts_with("https://")
        {
            bail!("service URL must start with http:// or https://");
        }
        if let Some(o) = &self.oauth2 {
            if o.discovery_url.trim().is_empty() {
                bail!("oauth2 is configured without a discovery URL");
            }
            if o.client_id.trim().is_empty() || o.client_secret.trim().is_empty() {
                bail!("oauth2 client id and secret must be set");
            }
        }
        if self.session_pool_ttl_secs == 0 {
            bail!("session pool TTL must be positive");
        }
        Ok(())
    }

    pub fn oauth2_enabled(&self) -> bool {
        self.oauth2.as_ref().map(|o| !o.discovery_url.is_empty()).unwrap_or(false)
    }

    pub fn session_pool_ttl(&self) -> Duration {
        Duration::from_secs(self.session_pool_ttl_secs)
    }

    /// Service URL with a scheme; a bare `host:port` is treated as `http://`.
    pub fn service_base(&self) -> String {
        let url = if self.service_url.trim().is_empty() { DEFAULT_SERVICE_URL } else { self.service_url.trim() };
        if url.contains("://") { url.to_string() } else { format!("http://{}", url) }
    }

    fn split_base(&self) -> (String, String, String) {
        let base = self.service_base();
        let (scheme, rest) = base.split_once("://").unwrap_or(("http", base.as_str()));
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        (scheme.to_string(), authority.to_string(), path.trim_end_matches('/').to_string())
    }

    /// Socket address to bind; an empty host listens on all interfaces.
    pub fn listen_addr(&self) -> Result<String> {
        let (scheme, authority, _) = self.split_base();
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.contains(']') => {
                let port: u16 = p.parse().with_context(|| format!("invalid port in service URL: {:?}", p))?;
                (h.to_string(), port)
            }
            _ => (authority.clone(), if scheme == "https" { 443 } else { 80 }),
        };
        let host = if host.is_empty() { "0.0.0.0".to_string() } else { host };
        Ok(format!("{}:{}", host, port))
    }

    /// Path component of the service URL without a trailing slash (`""` at the root).
    pub fn path_prefix(&self) -> String {
        self.split_base().2
    }

    pub fn public_service_url(&self) -> String {
        if let Some(p) = self.public_service_url.as_deref().filter(|p| !p.trim().is_empty()) {
            return p.trim().trim_end_matches('/').to_string();
        }
        let (scheme, authority, path) = self.split_base();
        let authority = if authority.starts_with(':') || authority.is_empty() {
            format!("localhost{}", authority)
        } else {
            authority
        };
        format!("{}://{}{}", scheme, authority, path)
    }

    /// Identifier of the protected resource advertised to OAuth2 clients.
    pub fn mcp_url(&self) -> String {
        format!("{}/mcp", self.public_service_url())
    }

    /// The server's own backend account; local-channel callers run as this account.
    pub fn default_account(&self) -> BackendAccount {
        let b = &self.backend;
        BackendAccount {
            host: b.host.clone(),
            port: b.port,
            client_zone: b.zone.clone(),
            proxy_zone: b.zone.clone(),
            client_user: b.username.clone(),
            proxy_user: b.username.clone(),
            password: b.password.clone(),
            auth_scheme: b.auth_scheme.clone(),
            default_resource: b.default_resource.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let c = GateConfig::default();
        assert!(!c.remote);
        assert_eq!(c.backend.port, 1247);
        assert_eq!(c.backend.shared_dir_name, "shared");
        assert_eq!(c.session_pool_ttl(), Duration::from_secs(600));
        assert_eq!(c.listen_addr().unwrap(), "0.0.0.0:8080");
        assert_eq!(c.path_prefix(), "");
        assert_eq!(c.mcp_url(), "http://localhost:8080/mcp");
    }

    #[test]
    fn env_layer_overrides_defaults() {
        let c = GateConfig::from_env_with(GateConfig::default(), env(&[
            ("IRODS_MCP_SVR_REMOTE", "true"),
            ("IRODS_MCP_SVR_SERVICE_URL", "https://mcp.example.org:9443/data"),
            ("IRODS_HOST", "irods.example.org"),
            ("IRODS_ZONE_NAME", "iplant"),
            ("IRODS_PROXY_AUTH", "yes"),
            ("IRODS_MCP_SVR_OIDC_DISCOVERY_URL", "https://kc/.well-known/openid-configuration"),
            ("IRODS_MCP_SVR_OAUTH2_CLIENT_ID", "mcp"),
            ("IRODS_MCP_SVR_OAUTH2_CLIENT_SECRET", "s3cret"),
        ])).unwrap();
        assert!(c.remote);
        assert!(c.backend.proxy_auth);
        assert_eq!(c.backend.zone, "iplant");
        assert!(c.oauth2_enabled());
        assert_eq!(c.listen_addr().unwrap(), "mcp.example.org:9443");
        assert_eq!(c.path_prefix(), "/data");
        assert_eq!(c.mcp_url(), "https://mcp.example.org:9443/data/mcp");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn env_rejects_bad_bool() {
        let r = GateConfig::from_env_with(GateConfig::default(), env(&[("IRODS_PROXY_AUTH", "maybe")]));
        assert!(r.is_err());
    }

    #[test]
    fn json_file_overlays_only_given_keys() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"debug": true, "backend": {{"zone": "tempZone"}}}}"#).unwrap();
        let mut base = GateConfig::default();
        base.backend.host = "keep.me".into();
        let c = GateConfig::from_json_file(base, f.path()).unwrap();
        assert!(c.debug);
        assert_eq!(c.backend.zone, "tempZone");
        assert_eq!(c.backend.host, "keep.me");
        assert_eq!(c.backend.port, 1247);
    }

    #[test]
    fn validate_rejects_bad_remote_url_and_partial_oauth2() {
        let mut c = GateConfig::default();
        c.remote = true;
        c.service_url = "mcp.example.org:8080".into();
        assert!(c.validate().is_err());

        let mut c = GateConfig::default();
        c.oauth2 = Some(OAuth2Config { discovery_url: "http://kc/x".into(), ..Default::default() });
        assert!(c.validate().is_err());
    }

    #[test]
    fn public_url_override_wins() {
        let mut c = GateConfig::default();
        c.public_service_url = Some("https://public.example.org/".into());
        assert_eq!(c.mcp_url(), "https://public.example.org/mcp");
    }
}
