//! Backend boundary: the session/connector traits the gate drives, plus an in-memory backend
//! for development and tests. The storage wire protocol lives behind `BackendConnector`.

use anyhow::{anyhow, bail, Result};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::identity::BackendAccount;
use crate::paths::{clean_path, get_dir, resource_uri};

/// A live connection to the storage system.
pub trait BackendSession: Send + Sync {
    fn account(&self) -> &BackendAccount;

    /// Run one storage operation. `paths` are already resolved and authorized.
    fn call(&self, operation: &str, paths: &[String], args: &Value) -> Result<Value>;

    /// Close sockets and free handles. Called once by the pool when the session is evicted.
    fn release(&self) -> Result<()>;
}

pub type SharedSession = Arc<dyn BackendSession>;

/// Opens backend sessions. Expected to block on network round trips.
pub trait BackendConnector: Send + Sync {
    fn open(&self, account: &BackendAccount) -> Result<SharedSession>;
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Dir,
    File(String),
}

#[derive(Debug, Default)]
struct Namespace {
    nodes: RwLock<BTreeMap<String, Node>>,
    opened: AtomicUsize,
    released: AtomicUsize,
    unavailable: AtomicBool,
}

/// In-memory namespace shared by every session it opens. Not a wire-protocol implementation.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    ns: Arc<Namespace>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory and any missing parents.
    pub fn with_directory(self, path: &str) -> Self {
        mkdir_all(&mut self.ns.nodes.write(), &clean_path(path));
        self
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        let path = clean_path(path);
        {
            let mut nodes = self.ns.nodes.write();
            mkdir_all(&mut nodes, &get_dir(&path));
            nodes.insert(path, Node::File(content.to_string()));
        }
        self
    }

    pub fn opened(&self) -> usize {
        self.ns.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.ns.released.load(Ordering::SeqCst)
    }

    /// Make subsequent `open` calls fail, as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.ns.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

fn mkdir_all(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut cur = String::new();
    nodes.insert("/".to_string(), Node::Dir);
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        cur.push('/');
        cur.push_str(seg);
        nodes.entry(cur.clone()).or_insert(Node::Dir);
    }
}

impl BackendConnector for MemoryConnector {
    fn open(&self, account: &BackendAccount) -> Result<SharedSession> {
        if self.ns.unavailable.load(Ordering::SeqCst) {
            bail!("connection to {}:{} refused", account.host, account.port);
        }
        self.ns.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(user = %account.client_user, "memory backend: session opened");
        Ok(Arc::new(MemorySession {
            account: account.clone(),
            ns: self.ns.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

pub struct MemorySession {
    account: BackendAccount,
    ns: Arc<Namespace>,
    released: AtomicBool,
}

impl MemorySession {
    fn first_path<'a>(&self, operation: &str, paths: &'a [String]) -> Result<&'a str> {
        paths.first().map(|s| s.as_str()).ok_or_else(|| anyhow!("{} requires a path", operation))
    }

    fn list(&self, dir: &str) -> Result<Value> {
        let nodes = self.ns.nodes.read();
        match nodes.get(dir) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => bail!("{:?} is not a directory", dir),
            None => bail!("directory {:?} does not exist", dir),
        }
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let entries: Vec<Value> = nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, n)| entry_json(k, n))
            .collect();
        Ok(json!({
            "directory": dir,
            "directory_resource_uri": resource_uri(dir),
            "directory_entries": entries,
        }))
    }
}

fn entry_json(path: &str, node: &Node) -> Value {
    let name = path.rsplit('/').next().unwrap_or_default();
    match node {
        Node::Dir => json!({"name": name, "path": path, "type": "directory", "resource_uri": resource_uri(path)}),
        Node::File(c) => json!({"name": name, "path": path, "type": "file", "size": c.len(), "resource_uri": resource_uri(path)}),
    }
}

impl BackendSession for MemorySession {
    fn account(&self) -> &BackendAccount {
        &self.account
    }

    fn call(&self, operation: &str, paths: &[String], args: &Value) -> Result<Value> {
        if self.released.load(Ordering::SeqCst) {
            bail!("session for {:?} has been released", self.account.client_user);
        }
        let op = operation.strip_prefix("irods_").unwrap_or(operation);
        match op {
            "list_directory" | "list_directory_details" => self.list(self.first_path(operation, paths)?),
            "get_file_info" => {
                let path = self.first_path(operation, paths)?;
                let nodes = self.ns.nodes.read();
                let node = nodes.get(path).ok_or_else(|| anyhow!("{:?} does not exist", path))?;
                Ok(entry_json(path, node))
            }
            "read_file" => {
                let path = self.first_path(operation, paths)?;
                match self.ns.nodes.read().get(path) {
                    Some(Node::File(c)) => Ok(json!({"path": path, "content": c})),
                    Some(Node::Dir) => bail!("{:?} is a directory", path),
                    None => bail!("file {:?} does not exist", path),
                }
            }
            "write_file" => {
                let path = self.first_path(operation, paths)?;
                let content = args.get("content").and_then(|v| v.as_str()).unwrap_or_default();
                let mut nodes = self.ns.nodes.write();
                if !matches!(nodes.get(&get_dir(path)), Some(Node::Dir)) {
                    bail!("parent directory of {:?} does not exist", path);
                }
                if matches!(nodes.get(path), Some(Node::Dir)) {
                    bail!("{:?} is a directory", path);
                }
                nodes.insert(path.to_string(), Node::File(content.to_string()));
                Ok(json!({"path": path, "size": content.len()}))
            }
            "make_directory" => {
                let path = self.first_path(operation, paths)?;
                let mut nodes = self.ns.nodes.write();
                if matches!(nodes.get(path), Some(Node::File(_))) {
                    bail!("{:?} exists and is a file", path);
                }
                mkdir_all(&mut nodes, path);
                Ok(json!({"path": path, "resource_uri": resource_uri(path)}))
            }
            _ => bail!("operation {:?} is not supported by the in-memory backend", operation),
        }
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            bail!("session for {:?} already released", self.account.client_user);
        }
        self.ns.released.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(user = %self.account.client_user, "memory backend: session released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(user: &str) -> BackendAccount {
        BackendAccount {
            host: "mem".into(),
            port: 1247,
            client_zone: "z".into(),
            proxy_zone: "z".into(),
            client_user: user.into(),
            proxy_user: user.into(),
            password: "pw".into(),
            auth_scheme: "native".into(),
            default_resource: String::new(),
        }
    }

    #[test]
    fn list_only_direct_children() {
        let c = MemoryConnector::new()
            .with_file("/z/home/shared/a.txt", "hello")
            .with_file("/z/home/shared/sub/b.txt", "x")
            .with_directory("/z/home/shared2");
        let s = c.open(&account("alice")).unwrap();
        let out = s.call("irods_list_directory", &["/z/home/shared".into()], &Value::Null).unwrap();
        let names: Vec<&str> = out["directory_entries"].as_array().unwrap().iter()
            .map(|e| e["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
    }

    #[test]
    fn write_then_read() {
        let c = MemoryConnector::new().with_directory("/z/home/alice");
        let s = c.open(&account("alice")).unwrap();
        s.call("irods_write_file", &["/z/home/alice/n.txt".into()], &json!({"content": "hi"})).unwrap();
        let out = s.call("irods_read_file", &["/z/home/alice/n.txt".into()], &Value::Null).unwrap();
        assert_eq!(out["content"], "hi");
        assert!(s.call("irods_write_file", &["/z/home/nobody/n.txt".into()], &json!({})).is_err());
    }

    #[test]
    fn release_is_counted_once() {
        let c = MemoryConnector::new();
        let s = c.open(&account("alice")).unwrap();
        assert_eq!(c.opened(), 1);
        s.release().unwrap();
        assert!(s.release().is_err());
        assert_eq!(c.released(), 1);
        assert!(s.call("irods_list_directory", &["/".into()], &Value::Null).is_err());
    }

    #[test]
    fn unavailable_backend_refuses() {
        let c = MemoryConnector::new();
        c.set_unavailable(true);
        assert!(c.open(&account("alice")).is_err());
        assert_eq!(c.opened(), 0);
    }
}
