//! OAuth2 resource-server gate for the networked transport.
//!
//! Bearer tokens are checked by introspection against the authorization server found through
//! its OIDC discovery document, then mapped to a backend username via userinfo. The
//! username is handed downstream in the forwarded-user header.

use anyhow::{anyhow, bail, Context, Result};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::OAuth2Config;
use crate::error::{AppError, GateError};
use crate::identity::FORWARDED_USER_HEADER;

pub const RESOURCE_NAME: &str = "iRODS MCP server";
pub const SCOPES_SUPPORTED: &[&str] = &["openid", "mcp:api", "mcp:read", "mcp:write"];

const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
const AUTH_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";
const OIDC_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";

#[derive(Debug, Default, Deserialize)]
struct DiscoveryDocument {
    #[serde(default)]
    issuer: String,
    #[serde(default)]
    introspection_endpoint: String,
    #[serde(default)]
    token_introspection_endpoint: String,
    #[serde(default)]
    userinfo_endpoint: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UserInfo {
    pub sub: String,
    pub preferred_username: String,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetadata {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub resource_name: String,
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub bearer_methods_supported: Vec<String>,
}

/// The subset of RFC 8414 metadata re-served to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub jwks_uri: String,
    pub grant_types_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub response_modes_supported: Vec<String>,
    pub registration_endpoint: String,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub token_endpoint_auth_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub request_parameter_supported: bool,
    pub request_uri_parameter_supported: bool,
    pub code_challenge_methods_supported: Vec<String>,
    pub tls_client_certificate_bound_access_tokens: bool,
    pub introspection_endpoint: String,
    pub token_introspection_endpoint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub revocation_endpoint: String,
}

/// `(scheme://authority, path)` of an absolute URL.
fn split_origin(url: &str) -> (String, String) {
    let Some((scheme, rest)) = url.split_once("://") else {
        return (String::new(), url.to_string());
    };
    match rest.find('/') {
        Some(i) => (format!("{}://{}", scheme, &rest[..i]), rest[i..].to_string()),
        None => (format!("{}://{}", scheme, rest), String::new()),
    }
}

pub struct OAuth2Gateway {
    mcp_url: String,
    issuer: String,
    discovery_url: String,
    introspection_endpoint: String,
    userinfo_endpoint: String,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for OAuth2Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Gateway")
            .field("mcp_url", &self.mcp_url)
            .field("issuer", &self.issuer)
            .field("introspection_endpoint", &self.introspection_endpoint)
            .field("userinfo_endpoint", &self.userinfo_endpoint)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl OAuth2Gateway {
    /// Fetch the discovery document once. Fails when it lacks the introspection or userinfo endpoint.
    pub async fn discover(mcp_url: impl Into<String>, cfg: &OAuth2Config) -> Result<Self> {
        let http = reqwest::Client::new();
        let resp = http
            .get(&cfg.discovery_url)
            .send()
            .await
            .with_context(|| format!("failed to fetch OIDC discovery document {}", cfg.discovery_url))?;
        if !resp.status().is_success() {
            bail!("OIDC discovery document {} returned {}", cfg.discovery_url, resp.status());
        }
        let doc: DiscoveryDocument = resp.json().await.context("failed to decode OIDC discovery document")?;

        let introspection_endpoint = if doc.introspection_endpoint.is_empty() {
            doc.token_introspection_endpoint
        } else {
            doc.introspection_endpoint
        };
        if introspection_endpoint.is_empty() {
            bail!("the OIDC discovery document does not contain the token introspection endpoint");
        }
        if doc.userinfo_endpoint.is_empty() {
            bail!("the OIDC discovery document does not contain the userinfo endpoint");
        }

        let gw = Self {
            mcp_url: mcp_url.into(),
            issuer: doc.issuer,
            discovery_url: cfg.discovery_url.clone(),
            introspection_endpoint,
            userinfo_endpoint: doc.userinfo_endpoint,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            http,
        };
        tracing::info!(issuer = %gw.issuer, introspection = %gw.introspection_endpoint, userinfo = %gw.userinfo_endpoint, "oauth2: discovered authorization server");
        Ok(gw)
    }

    pub fn mcp_url(&self) -> &str {
        &self.mcp_url
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Where clients find the protected-resource metadata for this server's MCP endpoint.
    pub fn resource_metadata_url(&self) -> String {
        let (origin, path) = split_origin(&self.mcp_url);
        format!("{}{}{}", origin, PROTECTED_RESOURCE_PATH, path)
    }

    /// 401 with a `WWW-Authenticate` challenge pointing at the resource metadata.
    pub fn challenge(&self) -> Response {
        let value = format!(r#"Bearer resource_metadata="{}""#, self.resource_metadata_url());
        let mut resp = StatusCode::UNAUTHORIZED.into_response();
        if let Ok(v) = HeaderValue::from_str(&value) {
            resp.headers_mut().insert(header::WWW_AUTHENTICATE, v);
        }
        resp
    }

    pub async fn introspect(&self, token: &str) -> Result<(), GateError> {
        let resp = self
            .http
            .post(&self.introspection_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| GateError::IntrospectionFailed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(code = status.as_u16(), %body, "oauth2: token introspection rejected");
            return Err(GateError::IntrospectionFailed(format!("introspection endpoint returned {}", status)));
        }
        let claims: Value = resp.json().await.map_err(|e| GateError::IntrospectionFailed(e.to_string()))?;
        match claims.get("active") {
            Some(Value::Bool(true)) => Ok(()),
            Some(Value::Bool(false)) => Err(GateError::TokenInactive),
            Some(other) => Err(GateError::IntrospectionFailed(format!("invalid value for active flag: {}", other))),
            None => Err(GateError::IntrospectionFailed(
                "the token introspection response did not contain the active flag".into(),
            )),
        }
    }

    pub async fn userinfo(&self, token: &str) -> Result<UserInfo, GateError> {
        let resp = self
            .http
            .post(&self.userinfo_endpoint)
            .form(&[("access_token", token)])
            .send()
            .await
            .map_err(|e| GateError::UserinfoFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GateError::UserinfoFailed(format!("userinfo endpoint returned {}", resp.status())));
        }
        let info: UserInfo = resp.json().await.map_err(|e| GateError::UserinfoFailed(e.to_string()))?;
        if info.preferred_username.is_empty() {
            return Err(GateError::UserinfoFailed("userinfo carries no preferred_username".into()));
        }
        Ok(info)
    }

    /// Validate the request's bearer token and return the backend username it maps to.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<String, GateError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|t| !t.is_empty())
            .ok_or(GateError::BearerTokenMissing)?;
        tracing::debug!(token, "oauth2: bearer token in auth header");

        self.introspect(token).await?;
        let info = self.userinfo(token).await?;
        tracing::info!(username = %info.preferred_username, sub = %info.sub, "oauth2: user is authenticated");
        Ok(info.preferred_username)
    }

    pub fn resource_metadata(&self) -> ResourceMetadata {
        ResourceMetadata {
            resource_name: RESOURCE_NAME.to_string(),
            resource: self.mcp_url.clone(),
            authorization_servers: vec![self.issuer.clone()],
            scopes_supported: SCOPES_SUPPORTED.iter().map(|s| s.to_string()).collect(),
            bearer_methods_supported: vec!["header".to_string()],
        }
    }

    /// Fetch the upstream RFC 8414 document, found at the discovery URL's origin.
    pub async fn auth_server_metadata(&self) -> Result<(StatusCode, AuthorizationMetadata)> {
        let (origin, _) = split_origin(&self.discovery_url);
        if origin.is_empty() {
            return Err(anyhow!("invalid OIDC discovery URL {:?}", self.discovery_url));
        }
        let resp = self
            .http
            .get(format!("{}{}", origin, AUTH_SERVER_PATH))
            .send()
            .await
            .context("failed to get authorization server metadata")?;
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let meta: AuthorizationMetadata = resp.json().await.context("failed to parse authorization server metadata")?;
        Ok((status, meta))
    }

    pub async fn oidc_configuration(&self) -> Result<(StatusCode, String)> {
        let resp = self
            .http
            .get(&self.discovery_url)
            .send()
            .await
            .context("failed to get OIDC discovery document")?;
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = resp.text().await.context("failed to read OIDC discovery document")?;
        Ok((status, body))
    }
}

/// Middleware guarding the MCP endpoint. Any token failure becomes the same bare challenge.
pub async fn require_oauth(State(gw): State<Arc<OAuth2Gateway>>, mut req: Request, next: Next) -> Response {
    tracing::debug!(uri = %req.uri(), method = %req.method(), "oauth2: checking request");
    let user = match gw.authenticate(req.headers()).await {
        Ok(user) => user,
        Err(e) => {
            tracing::error!(code = e.code(), error = %e, "oauth2: rejecting request");
            return gw.challenge();
        }
    };
    match HeaderValue::from_str(&user) {
        Ok(v) => {
            req.headers_mut().insert(FORWARDED_USER_HEADER, v);
            next.run(req).await
        }
        Err(_) => {
            tracing::error!(username = %user, "oauth2: username is not a valid header value");
            gw.challenge()
        }
    }
}

fn with_cors(mut resp: Response) -> Response {
    let h = resp.headers_mut();
    h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    h.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS"));
    h.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    resp
}

/// `Some(response)` for preflight and disallowed methods.
fn preflight(method: &Method) -> Option<Response> {
    if method == Method::OPTIONS {
        return Some(with_cors(StatusCode::OK.into_response()));
    }
    if method != Method::GET {
        return Some(with_cors((StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response()));
    }
    None
}

fn app_error_response(err: AppError) -> Response {
    tracing::error!(code = err.code_str(), error = %err.message(), "oauth2: metadata request failed");
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    with_cors((status, err.message().to_string()).into_response())
}

async fn resource_metadata_handler(State(gw): State<Arc<OAuth2Gateway>>, method: Method) -> Response {
    if let Some(r) = preflight(&method) {
        return r;
    }
    with_cors((StatusCode::OK, Json(gw.resource_metadata())).into_response())
}

async fn auth_server_metadata_handler(State(gw): State<Arc<OAuth2Gateway>>, method: Method) -> Response {
    if let Some(r) = preflight(&method) {
        return r;
    }
    match gw.auth_server_metadata().await {
        Ok((status, meta)) => with_cors((status, Json(meta)).into_response()),
        Err(e) => app_error_response(AppError::from(e)),
    }
}

async fn oidc_configuration_handler(State(gw): State<Arc<OAuth2Gateway>>, method: Method) -> Response {
    if let Some(r) = preflight(&method) {
        return r;
    }
    match gw.oidc_configuration().await {
        Ok((status, body)) => with_cors((status, [(header::CONTENT_TYPE, "application/json")], body).into_response()),
        Err(e) => app_error_response(AppError::from(e)),
    }
}

/// The six metadata routes, bare and with the `/mcp` suffix, under `prefix`.
pub fn well_known_routes<S>(prefix: &str, gw: Arc<OAuth2Gateway>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let mut router = Router::new();
    for (path, suffix_mcp) in [
        (PROTECTED_RESOURCE_PATH, false),
        (PROTECTED_RESOURCE_PATH, true),
        (AUTH_SERVER_PATH, false),
        (AUTH_SERVER_PATH, true),
        (OIDC_CONFIGURATION_PATH, false),
        (OIDC_CONFIGURATION_PATH, true),
    ] {
        let full = if suffix_mcp { format!("{}{}/mcp", prefix, path) } else { format!("{}{}", prefix, path) };
        router = match path {
            PROTECTED_RESOURCE_PATH => router.route(&full, any(resource_metadata_handler)),
            AUTH_SERVER_PATH => router.route(&full, any(auth_server_metadata_handler)),
            _ => router.route(&full, any(oidc_configuration_handler)),
        };
    }
    router.with_state(gw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_split() {
        assert_eq!(split_origin("https://h:8443/a/mcp"), ("https://h:8443".to_string(), "/a/mcp".to_string()));
        assert_eq!(split_origin("http://h"), ("http://h".to_string(), String::new()));
        assert_eq!(split_origin("nope"), (String::new(), "nope".to_string()));
    }

    #[test]
    fn auth_metadata_omits_empty_optional_fields() {
        let v = serde_json::to_value(AuthorizationMetadata { issuer: "i".into(), ..Default::default() }).unwrap();
        assert!(v.get("jwks_uri").is_none());
        assert!(v.get("revocation_endpoint").is_none());
        assert_eq!(v["issuer"], "i");
        assert!(v["grant_types_supported"].is_array());
    }

    #[test]
    fn preflight_rules() {
        assert_eq!(preflight(&Method::OPTIONS).unwrap().status(), StatusCode::OK);
        let r = preflight(&Method::POST).unwrap();
        assert_eq!(r.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(r.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(preflight(&Method::GET).is_none());
    }
}
