//! Tool dispatch: the one place a storage operation passes through identity resolution,
//! the session pool and the access rules before it reaches the backend.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::Arc;

use crate::backend::{BackendConnector, SharedSession};
use crate::catalog::{self, AllowedDirectories, OperationSpec};
use crate::config::GateConfig;
use crate::error::GateError;
use crate::identity::{AccessRules, AccountResolver, BackendAccount, Identity, SessionPool};

pub const LIST_ALLOWED_DIRECTORIES: &str = "irods_list_allowed_directories";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Outcome of one tool call. Failures are payloads, never transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn json(value: &Value) -> Self {
        Self { content: vec![ToolContent { kind: "text".into(), text: value.to_string() }], is_error: false }
    }

    pub fn error(err: impl Display) -> Self {
        Self { content: vec![ToolContent { kind: "text".into(), text: err.to_string() }], is_error: true }
    }

    pub fn text(&self) -> String {
        self.content.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n")
    }
}

/// Server-wide context threaded into every handler: config, account resolver and session pool.
pub struct Gate {
    config: GateConfig,
    resolver: AccountResolver,
    pool: SessionPool,
}

impl Gate {
    pub fn new(config: GateConfig, connector: Arc<dyn BackendConnector>) -> Self {
        let resolver = AccountResolver::new(config.default_account(), config.backend.proxy_auth);
        let pool = SessionPool::new(connector, config.session_pool_ttl());
        Self { config, resolver, pool }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    fn shared_dir_name(&self) -> &str {
        &self.config.backend.shared_dir_name
    }

    pub fn resolve_account(&self, identity: &Identity) -> Result<BackendAccount, GateError> {
        self.resolver.resolve(identity)
    }

    pub fn session_for(&self, identity: &Identity) -> Result<SharedSession, GateError> {
        let account = self.resolve_account(identity)?;
        self.pool.get(&account)
    }

    /// Rules for `operation` scoped to the caller. An unresolvable caller gets an empty (deny-all) set.
    pub fn access_rules(&self, identity: &Identity, operation: &str) -> AccessRules {
        let Some(op) = catalog::find(operation) else {
            return AccessRules::new(operation, Vec::new());
        };
        match self.resolve_account(identity) {
            Ok(account) => catalog::rules_for(op, &account, self.shared_dir_name()),
            Err(_) => AccessRules::new(op.name, Vec::new()),
        }
    }

    pub fn allowed_directories(&self, identity: &Identity) -> AllowedDirectories {
        let account = self.resolve_account(identity).ok();
        catalog::allowed_directories(account.as_ref(), self.shared_dir_name())
    }

    pub fn call_tool(&self, identity: &Identity, name: &str, args: &Value) -> ToolResult {
        match self.try_call(identity, name, args) {
            Ok(v) => ToolResult::json(&v),
            Err(e) => {
                tracing::warn!(tool = name, user = %identity.username, code = e.code(), error = %e, "tool call failed");
                ToolResult::error(e)
            }
        }
    }

    fn try_call(&self, identity: &Identity, name: &str, args: &Value) -> Result<Value, GateError> {
        let op = catalog::find(name)
            .ok_or_else(|| GateError::InvalidArgument(format!("unknown tool {:?}", name)))?;

        if op.name == LIST_ALLOWED_DIRECTORIES {
            return serde_json::to_value(self.allowed_directories(identity))
                .map_err(|e| operation_failed(op, e));
        }

        let account = self.resolve_account(identity)?;
        if op.named_only && account.is_anonymous() {
            return Err(GateError::AnonymousNotAllowed { operation: op.name.to_string() });
        }
        let session = self.pool.get(&account)?;
        let rules = catalog::rules_for(op, session.account(), self.shared_dir_name());

        let resolved = catalog::resolve_path_args(op, session.account(), self.shared_dir_name(), args)?;
        for rp in &resolved {
            rules.check(&rp.check)?;
        }
        let paths: Vec<String> = resolved.into_iter().map(|rp| rp.resolved).collect();

        tracing::debug!(tool = op.name, user = %account.client_user, ?paths, "tool call");
        let mut out = session.call(op.name, &paths, args).map_err(|e| operation_failed(op, e))?;
        if op.filter_results {
            filter_entries(&mut out, &rules);
        }
        Ok(out)
    }
}

fn operation_failed(op: &OperationSpec, e: impl Display) -> GateError {
    GateError::OperationFailed { operation: op.name.to_string(), reason: e.to_string() }
}

/// Drop result entries whose `path` the caller may not see.
fn filter_entries(out: &mut Value, rules: &AccessRules) {
    let keep = |e: &Value| e.get("path").and_then(|p| p.as_str()).map(|p| rules.allows(p)).unwrap_or(false);
    match out {
        Value::Array(items) => items.retain(|e| keep(e)),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get_mut("entries") {
                items.retain(|e| keep(e));
            }
        }
        _ => {}
    }
}

/// Input shape for one tool call on either transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
    /// Echoed back on the local channel so callers can match replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub tool: String,
    #[serde(default = "empty_args")]
    pub arguments: Value,
}

fn empty_args() -> Value {
    json!({})
}
