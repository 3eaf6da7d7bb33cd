use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::Engine;
use thiserror::Error;

pub const ANONYMOUS_USER: &str = "anonymous";
/// Set by the OAuth2 gate once a bearer token has been introspected.
pub const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Local,
    Networked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    Basic,
    Bearer,
}

/// Who the caller is, as far as the transport can tell. Built once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub mode: TransportMode,
    /// Original `Authorization` header value, networked mode only.
    pub raw_authorization: String,
    pub scheme: AuthScheme,
    pub username: String,
    pub password: String,
}

/// Reasons a networked request carries no usable identity. All of them collapse to anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialParseError {
    #[error("no authorization header")]
    Missing,
    #[error("unsupported authorization scheme")]
    UnsupportedScheme,
    #[error("authorization header is not valid UTF-8")]
    NotUtf8,
    #[error("basic credentials decode to invalid UTF-8")]
    MalformedBasic,
    #[error("credentials carry an empty username")]
    EmptyUsername,
}

impl Identity {
    /// Local-channel identity. Account resolution maps it to the server's own account.
    pub fn local() -> Self {
        Self {
            mode: TransportMode::Local,
            raw_authorization: String::new(),
            scheme: AuthScheme::None,
            username: ANONYMOUS_USER.to_string(),
            password: String::new(),
        }
    }

    pub fn anonymous(raw_authorization: impl Into<String>) -> Self {
        Self {
            mode: TransportMode::Networked,
            raw_authorization: raw_authorization.into(),
            scheme: AuthScheme::None,
            username: ANONYMOUS_USER.to_string(),
            password: String::new(),
        }
    }

    pub fn is_local(&self) -> bool { self.mode == TransportMode::Local }
    pub fn is_networked(&self) -> bool { self.mode == TransportMode::Networked }
    pub fn is_anonymous(&self) -> bool { self.username == ANONYMOUS_USER }
    pub fn is_basic(&self) -> bool { self.scheme == AuthScheme::Basic }
    pub fn is_bearer(&self) -> bool { self.scheme == AuthScheme::Bearer }
}

/// Split a Basic credential, decoding it first when it carries no `:` in the clear.
///
/// A value without any `:` is all username with an empty password, which account
/// resolution then refuses.
fn split_basic(token: &str) -> Result<(String, String), CredentialParseError> {
    let text = if token.contains(':') {
        token.to_string()
    } else {
        match base64::engine::general_purpose::STANDARD.decode(token.trim()) {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| CredentialParseError::MalformedBasic)?,
            Err(_) => token.to_string(),
        }
    };
    Ok(match text.split_once(':') {
        Some((u, p)) => (u.to_string(), p.to_string()),
        None => (text, String::new()),
    })
}

/// Parse a networked request's `Authorization` value.
///
/// `forwarded_user` is the identity the OAuth2 gate injected, consulted only for Bearer.
pub fn parse_authorization(
    authorization: Option<&str>,
    forwarded_user: Option<&str>,
) -> Result<Identity, CredentialParseError> {
    let raw = authorization.ok_or(CredentialParseError::Missing)?;
    if raw.is_empty() {
        return Err(CredentialParseError::Missing);
    }

    let (scheme, username, password) = if let Some(token) = raw.strip_prefix("Basic ") {
        let (u, p) = split_basic(token)?;
        (AuthScheme::Basic, u, p)
    } else if raw.starts_with("Bearer ") {
        (AuthScheme::Bearer, forwarded_user.unwrap_or_default().to_string(), String::new())
    } else {
        return Err(CredentialParseError::UnsupportedScheme);
    };

    if username.is_empty() {
        return Err(CredentialParseError::EmptyUsername);
    }

    Ok(Identity {
        mode: TransportMode::Networked,
        raw_authorization: raw.to_string(),
        scheme,
        username,
        password,
    })
}

/// Extract the caller identity from request headers. Never fails: any parse failure is anonymous.
///
/// The forwarded-user header is consumed for Bearer requests so a retried handler cannot
/// read it a second time.
pub fn extract_networked(headers: &mut HeaderMap) -> Identity {
    let raw = headers.get(AUTHORIZATION).map(|v| v.to_str().map(str::to_string));
    let raw = match raw {
        None => None,
        Some(Ok(s)) => Some(s),
        Some(Err(_)) => {
            tracing::debug!(reason = %CredentialParseError::NotUtf8, "auth: falling back to anonymous");
            return Identity::anonymous("");
        }
    };

    let forwarded = if raw.as_deref().map(|r| r.starts_with("Bearer ")).unwrap_or(false) {
        headers
            .remove(FORWARDED_USER_HEADER)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    } else {
        None
    };

    match parse_authorization(raw.as_deref(), forwarded.as_deref()) {
        Ok(identity) => {
            tracing::info!(user = %identity.username, "auth");
            identity
        }
        Err(reason) => {
            tracing::debug!(%reason, "auth: falling back to anonymous");
            Identity::anonymous(raw.unwrap_or_default())
        }
    }
}
