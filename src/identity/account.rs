use serde::{Deserialize, Serialize};

use super::credentials::{Identity, ANONYMOUS_USER};
use crate::error::GateError;

const KNOWN_AUTH_SCHEMES: &[&str] = &["native", "pam", "pam_password", "pam_for_users"];

/// Everything needed to open a backend session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAccount {
    pub host: String,
    pub port: u16,
    pub client_zone: String,
    pub proxy_zone: String,
    pub client_user: String,
    pub proxy_user: String,
    pub password: String,
    pub auth_scheme: String,
    pub default_resource: String,
}

impl BackendAccount {
    pub fn is_anonymous(&self) -> bool {
        self.client_user == ANONYMOUS_USER
    }

    /// True when the session authenticates as one user on behalf of another.
    pub fn is_proxy(&self) -> bool {
        self.proxy_user != self.client_user
    }

    pub fn home_dir(&self) -> String {
        crate::paths::home_path(self)
    }

    /// Fill missing user/zone halves from their counterpart, default the auth scheme and validate.
    pub fn normalize(mut self) -> Result<Self, GateError> {
        if self.proxy_user.is_empty() {
            self.proxy_user = self.client_user.clone();
        }
        if self.client_user.is_empty() {
            self.client_user = self.proxy_user.clone();
        }
        if self.proxy_zone.is_empty() {
            self.proxy_zone = self.client_zone.clone();
        }
        if self.client_zone.is_empty() {
            self.client_zone = self.proxy_zone.clone();
        }
        self.auth_scheme = self.auth_scheme.trim().to_lowercase();
        if self.auth_scheme.is_empty() {
            self.auth_scheme = "native".to_string();
        }

        if self.host.is_empty() {
            return Err(GateError::InvalidAccountConfig("host is empty".into()));
        }
        if self.port == 0 {
            return Err(GateError::InvalidAccountConfig("port is zero".into()));
        }
        if self.client_zone.is_empty() {
            return Err(GateError::InvalidAccountConfig("zone is empty".into()));
        }
        if self.client_user.is_empty() {
            return Err(GateError::InvalidAccountConfig("user is empty".into()));
        }
        if !KNOWN_AUTH_SCHEMES.contains(&self.auth_scheme.as_str()) {
            return Err(GateError::InvalidAccountConfig(format!("unknown auth scheme {:?}", self.auth_scheme)));
        }
        Ok(self)
    }
}

/// Maps a caller identity onto backend credentials under the server's proxy-auth policy.
#[derive(Debug, Clone)]
pub struct AccountResolver {
    template: BackendAccount,
    proxy_auth: bool,
}

impl AccountResolver {
    pub fn new(template: BackendAccount, proxy_auth: bool) -> Self {
        Self { template, proxy_auth }
    }

    pub fn proxy_auth(&self) -> bool {
        self.proxy_auth
    }

    pub fn default_account(&self) -> &BackendAccount {
        &self.template
    }

    pub fn resolve(&self, identity: &Identity) -> Result<BackendAccount, GateError> {
        let mut account = self.template.clone();

        if identity.is_local() {
            return Ok(account);
        }

        if identity.is_anonymous() {
            account.proxy_user = String::new();
            account.client_user = ANONYMOUS_USER.to_string();
            account.password = String::new();
        } else if !identity.username.is_empty() && !identity.password.is_empty() {
            account.proxy_user = String::new();
            account.client_user = identity.username.clone();
            account.password = identity.password.clone();
        } else if !identity.username.is_empty() {
            if !self.proxy_auth {
                return Err(GateError::AuthRequired);
            }
            if identity.is_basic() {
                return Err(GateError::ProxyAuthUnsupportedScheme);
            }
            // service account stays as proxy user and authenticates for the caller
            account.client_user = identity.username.clone();
        } else {
            return Err(GateError::InvalidCredentials);
        }

        account.normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::credentials::{parse_authorization, AuthScheme, TransportMode};

    fn service() -> BackendAccount {
        BackendAccount {
            host: "irods.example.org".into(),
            port: 1247,
            client_zone: "z".into(),
            proxy_zone: "z".into(),
            client_user: "svc".into(),
            proxy_user: "svc".into(),
            password: "svcpw".into(),
            auth_scheme: "native".into(),
            default_resource: String::new(),
        }
    }

    fn bearer(user: &str) -> Identity {
        Identity {
            mode: TransportMode::Networked,
            raw_authorization: "Bearer tok".into(),
            scheme: AuthScheme::Bearer,
            username: user.into(),
            password: String::new(),
        }
    }

    #[test]
    fn local_returns_template_unchanged() {
        let r = AccountResolver::new(service(), false);
        assert_eq!(r.resolve(&Identity::local()).unwrap(), service());
    }

    #[test]
    fn anonymous_is_anonymous_regardless_of_proxy_policy() {
        for proxy in [false, true] {
            let r = AccountResolver::new(service(), proxy);
            let a = r.resolve(&Identity::anonymous("")).unwrap();
            assert!(a.is_anonymous());
            assert_eq!(a.proxy_user, ANONYMOUS_USER);
            assert!(a.password.is_empty());
        }
    }

    #[test]
    fn direct_credentials() {
        let r = AccountResolver::new(service(), false);
        let id = parse_authorization(Some("Basic alice:secret"), None).unwrap();
        let a = r.resolve(&id).unwrap();
        assert_eq!(a.client_user, "alice");
        assert_eq!(a.proxy_user, "alice");
        assert_eq!(a.password, "secret");
        assert!(!a.is_proxy());
    }

    #[test]
    fn username_only_needs_proxy_auth() {
        let off = AccountResolver::new(service(), false);
        assert!(matches!(off.resolve(&bearer("bob")), Err(GateError::AuthRequired)));

        let on = AccountResolver::new(service(), true);
        let a = on.resolve(&bearer("bob")).unwrap();
        assert_eq!(a.client_user, "bob");
        assert_eq!(a.proxy_user, "svc");
        assert_eq!(a.password, "svcpw");
        assert!(a.is_proxy());
    }

    #[test]
    fn basic_without_password_rejected_for_proxy() {
        let on = AccountResolver::new(service(), true);
        let id = parse_authorization(Some("Basic bob:"), None).unwrap();
        assert!(matches!(on.resolve(&id), Err(GateError::ProxyAuthUnsupportedScheme)));
    }

    #[test]
    fn basic_without_colon_never_falls_back_to_anonymous() {
        for raw in ["Basic bob", "Basic Ym9i"] {
            let id = parse_authorization(Some(raw), None).unwrap();
            let off = AccountResolver::new(service(), false);
            assert!(matches!(off.resolve(&id), Err(GateError::AuthRequired)), "{raw:?}");
            let on = AccountResolver::new(service(), true);
            assert!(matches!(on.resolve(&id), Err(GateError::ProxyAuthUnsupportedScheme)), "{raw:?}");
        }
    }

    #[test]
    fn empty_username_is_invalid() {
        let r = AccountResolver::new(service(), true);
        let mut id = bearer("");
        id.password = "x".into();
        assert!(matches!(r.resolve(&id), Err(GateError::InvalidCredentials)));
    }

    #[test]
    fn normalize_failures_surface() {
        let mut t = service();
        t.host = String::new();
        let r = AccountResolver::new(t, false);
        assert!(matches!(r.resolve(&Identity::anonymous("")), Err(GateError::InvalidAccountConfig(_))));

        let mut t = service();
        t.auth_scheme = "kerberos".into();
        assert!(t.normalize().is_err());
    }

    #[test]
    fn normalize_cross_fills() {
        let mut t = service();
        t.proxy_user = String::new();
        t.proxy_zone = String::new();
        t.auth_scheme = " NATIVE ".into();
        let a = t.normalize().unwrap();
        assert_eq!(a.proxy_user, "svc");
        assert_eq!(a.proxy_zone, "z");
        assert_eq!(a.auth_scheme, "native");
    }
}
