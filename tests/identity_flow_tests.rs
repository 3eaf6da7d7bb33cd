//! Identity pipeline tests: credentials to backend account to pooled session to path rules.
//! These run against the in-memory backend and cover positive and negative paths.

use anyhow::Result;
use axum::http::{HeaderMap, HeaderValue};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use irods_mcp_gate::backend::{BackendConnector, MemoryConnector};
use irods_mcp_gate::catalog;
use irods_mcp_gate::config::GateConfig;
use irods_mcp_gate::dispatch::Gate;
use irods_mcp_gate::error::GateError;
use irods_mcp_gate::identity::{extract_networked, parse_authorization, AccountResolver, Identity, SessionPool};

fn config(proxy_auth: bool) -> GateConfig {
    let mut cfg = GateConfig::default();
    cfg.backend.host = "irods.example.org".into();
    cfg.backend.zone = "z".into();
    cfg.backend.username = "svc".into();
    cfg.backend.password = "svcpw".into();
    cfg.backend.proxy_auth = proxy_auth;
    cfg
}

fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut h = HeaderMap::new();
    for (k, v) in pairs {
        if let Ok(v) = HeaderValue::from_str(v) {
            h.insert(*k, v);
        }
    }
    h
}

#[test]
fn anonymous_reaches_shared_but_not_other_homes() {
    let cfg = config(false);
    let resolver = AccountResolver::new(cfg.default_account(), false);
    let account = match resolver.resolve(&extract_networked(&mut HeaderMap::new())) {
        Ok(a) => a,
        Err(e) => panic!("anonymous should resolve: {}", e),
    };
    assert!(account.is_anonymous());
    assert!(account.password.is_empty());

    let read = catalog::find("irods_read_file").map(|op| catalog::rules_for(op, &account, "shared"));
    let Some(rules) = read else { panic!("irods_read_file missing from catalog") };
    assert!(rules.check("/z/home/shared/x").is_ok());

    let err = rules.check("/z/home/alice/secret");
    match err {
        Err(GateError::AccessDenied { operation, path }) => {
            assert_eq!(operation, "irods_read_file");
            assert_eq!(path, "/z/home/alice/secret");
        }
        other => panic!("expected AccessDenied, got {:?}", other.map(|_| ())),
    }
    assert!(rules.check("/z/home/alice/secret").err().map(|e| e.to_string()).unwrap_or_default().contains("/z/home/alice/secret"));
}

#[test]
fn encoded_and_plain_basic_resolve_to_the_same_account() -> Result<()> {
    let resolver = AccountResolver::new(config(false).default_account(), false);
    let plain = extract_networked(&mut headers(&[("authorization", "Basic alice:pw")]));
    // "alice:pw"
    let encoded = extract_networked(&mut headers(&[("authorization", "Basic YWxpY2U6cHc=")]));
    let a = resolver.resolve(&plain)?;
    let b = resolver.resolve(&encoded)?;
    assert_eq!(a, b);
    assert_eq!(a.client_user, "alice");
    assert!(a.proxy_user.is_empty() || a.proxy_user == "alice");
    Ok(())
}

#[test]
fn proxy_flow_needs_proxy_mode_and_bearer() -> Result<()> {
    let bearer_bob = parse_authorization(Some("Bearer t"), Some("bob"))?;

    let direct = AccountResolver::new(config(false).default_account(), false);
    assert!(matches!(direct.resolve(&bearer_bob), Err(GateError::AuthRequired)));

    let proxy = AccountResolver::new(config(true).default_account(), true);
    let account = proxy.resolve(&bearer_bob)?;
    assert_eq!(account.client_user, "bob");
    assert_eq!(account.proxy_user, "svc");
    assert_eq!(account.password, "svcpw");
    assert!(account.is_proxy());

    let basic_no_password = parse_authorization(Some("Basic bob:"), None)?;
    assert!(matches!(proxy.resolve(&basic_no_password), Err(GateError::ProxyAuthUnsupportedScheme)));
    Ok(())
}

#[test]
fn pooled_sessions_are_reused_until_idle() -> Result<()> {
    let mem = MemoryConnector::new();
    let connector: Arc<dyn BackendConnector> = Arc::new(mem.clone());
    let pool = SessionPool::new(connector, Duration::from_millis(40));
    let resolver = AccountResolver::new(config(false).default_account(), false);
    let alice = resolver.resolve(&parse_authorization(Some("Basic alice:pw"), None)?)?;

    let first = pool.get(&alice)?;
    let second = pool.get(&alice)?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(mem.opened(), 1);

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(pool.sweep(), 1);
    assert_eq!(mem.released(), 1);
    assert!(pool.is_empty());

    let third = pool.get(&alice)?;
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(mem.opened(), 2);
    Ok(())
}

#[test]
fn wrong_password_never_borrows_a_pooled_session() -> Result<()> {
    let mem = MemoryConnector::new();
    let pool = SessionPool::new(Arc::new(mem.clone()), Duration::from_secs(60));
    let resolver = AccountResolver::new(config(false).default_account(), false);
    let good = resolver.resolve(&parse_authorization(Some("Basic alice:pw"), None)?)?;
    let bad = resolver.resolve(&parse_authorization(Some("Basic alice:guess"), None)?)?;

    let pooled = pool.get(&good)?;
    let other = pool.get(&bad)?;
    assert!(!Arc::ptr_eq(&pooled, &other));
    assert_eq!(other.account().password, "guess");
    assert_eq!(mem.opened(), 2);
    assert_eq!(mem.released(), 0);

    // a rejected open leaves the legitimate session pooled and usable
    mem.set_unavailable(true);
    assert!(matches!(pool.get(&bad), Err(GateError::BackendSessionUnavailable { .. })));
    mem.set_unavailable(false);
    assert!(Arc::ptr_eq(&pooled, &pool.get(&good)?));
    assert_eq!(mem.released(), 0);
    Ok(())
}

#[test]
fn gate_applies_rules_per_argument() {
    let mem = MemoryConnector::new()
        .with_file("/z/home/shared/a.txt", "a")
        .with_directory("/z/home/alice");
    let gate = Gate::new(config(false), Arc::new(mem));
    let alice = match parse_authorization(Some("Basic alice:pw"), None) {
        Ok(i) => i,
        Err(e) => panic!("{}", e),
    };

    // destination outside every allowed prefix
    let r = gate.call_tool(
        &alice,
        "irods_copy_file",
        &json!({"source_path": "/z/home/shared/a.txt", "destination_path": "/z/home/bob/a.txt"}),
    );
    assert!(r.is_error);
    assert!(r.text().contains("/z/home/bob/a.txt"), "{}", r.text());

    let dirs = gate.allowed_directories(&Identity::anonymous(""));
    assert!(dirs.directories.iter().all(|d| d.path.starts_with("/z/home/shared")));
}
