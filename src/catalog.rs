//! Storage operations known to the gate, the access scope each one needs, and where its
//! path arguments live.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::GateError;
use crate::identity::{AccessRules, BackendAccount};
use crate::paths::{get_dir, home_path, resolve_backend_path, resource_uri, shared_path};

pub const OPERATION_PREFIX: &str = "irods_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessScope {
    /// Shared dir itself and its subtree, plus the caller's home.
    Browse,
    /// Shared subtree, plus the caller's home.
    Contents,
    /// No path argument, nothing to check.
    Unscoped,
}

/// Where an operation takes a path from its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathArg {
    Plain(&'static str),
    /// `target` when `target_type == "path"`; resources and users are not paths.
    AvuTarget,
    /// A wildcard search path; access is checked on the directory above the first wildcard.
    SearchPattern(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct OperationSpec {
    pub name: &'static str,
    pub scope: AccessScope,
    pub path_args: &'static [PathArg],
    /// Result entries carry paths that must be filtered through the caller's rules.
    pub filter_results: bool,
    /// Refused for the anonymous account before any backend session is opened.
    pub named_only: bool,
}

const fn op(name: &'static str, scope: AccessScope, path_args: &'static [PathArg]) -> OperationSpec {
    OperationSpec { name, scope, path_args, filter_results: false, named_only: false }
}

const fn named_only(name: &'static str) -> OperationSpec {
    OperationSpec { name, scope: Unscoped, path_args: &[], filter_results: false, named_only: true }
}

use AccessScope::*;
use PathArg::*;

pub const OPERATIONS: &[OperationSpec] = &[
    op("irods_list_allowed_directories", Unscoped, &[]),
    op("irods_list_directory", Browse, &[Plain("path")]),
    op("irods_list_directory_details", Browse, &[Plain("path")]),
    op("irods_directory_tree", Contents, &[Plain("path")]),
    op("irods_search_files", Contents, &[SearchPattern("path")]),
    OperationSpec {
        name: "irods_search_files_by_avu",
        scope: Browse,
        path_args: &[],
        filter_results: true,
        named_only: false,
    },
    op("irods_get_file_info", Contents, &[Plain("path")]),
    op("irods_read_file", Contents, &[Plain("path")]),
    op("irods_write_file", Contents, &[Plain("path")]),
    named_only("irods_list_tickets"),
    named_only("irods_get_ticket_info"),
    op("irods_move_file", Contents, &[Plain("old_path"), Plain("new_path")]),
    op("irods_copy_file", Contents, &[Plain("source_path"), Plain("destination_path")]),
    op("irods_make_directory", Contents, &[Plain("path")]),
    op("irods_delete_file", Contents, &[Plain("path")]),
    op("irods_upload_file", Contents, &[Plain("irods_path")]),
    op("irods_download_file", Contents, &[Plain("irods_path")]),
    op("irods_list_avus", Contents, &[AvuTarget]),
    op("irods_add_avu", Contents, &[AvuTarget]),
    op("irods_delete_avu", Contents, &[AvuTarget]),
    op("irods_modify_access", Contents, &[Plain("path")]),
    op("irods_modify_access_inheritance", Contents, &[Plain("path")]),
];

pub fn find(name: &str) -> Option<&'static OperationSpec> {
    OPERATIONS.iter().find(|o| o.name == name)
}

/// Path patterns an account may touch under `scope`.
pub fn accessible_paths(scope: AccessScope, account: &BackendAccount, shared_dir_name: &str) -> Vec<String> {
    let shared = shared_path(&account.client_zone, shared_dir_name);
    let mut paths = match scope {
        Unscoped => return Vec::new(),
        Browse => vec![shared.clone(), format!("{}/*", shared)],
        Contents => vec![format!("{}/*", shared)],
    };
    if !account.is_anonymous() {
        let home = home_path(account);
        paths.push(home.clone());
        paths.push(format!("{}/*", home));
    }
    paths
}

pub fn rules_for(op: &OperationSpec, account: &BackendAccount, shared_dir_name: &str) -> AccessRules {
    AccessRules::new(op.name, accessible_paths(op.scope, account, shared_dir_name))
}

/// A path argument after resolution. `check` is what the access rules are applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub arg: &'static str,
    pub resolved: String,
    pub check: String,
}

fn string_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, GateError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| GateError::InvalidArgument(format!("failed to get {} from arguments", key)))
}

/// Resolve every path argument of `op` against the caller's account.
pub fn resolve_path_args(
    op: &OperationSpec,
    account: &BackendAccount,
    shared_dir_name: &str,
    args: &Value,
) -> Result<Vec<ResolvedPath>, GateError> {
    let mut out = Vec::with_capacity(op.path_args.len());
    for pa in op.path_args {
        match *pa {
            Plain(key) => {
                let resolved = resolve_backend_path(account, shared_dir_name, string_arg(args, key)?);
                out.push(ResolvedPath { arg: key, check: resolved.clone(), resolved });
            }
            AvuTarget => {
                let target_type = string_arg(args, "target_type")?;
                if target_type == "path" {
                    let resolved = resolve_backend_path(account, shared_dir_name, string_arg(args, "target")?);
                    out.push(ResolvedPath { arg: "target", check: resolved.clone(), resolved });
                }
            }
            SearchPattern(key) => {
                let resolved = resolve_backend_path(account, shared_dir_name, string_arg(args, key)?);
                let idx = resolved.find(['?', '*']).ok_or_else(|| {
                    GateError::InvalidArgument(format!("no wildcard is in the path {:?}", resolved))
                })?;
                let check = get_dir(&resolved[..idx]);
                out.push(ResolvedPath { arg: key, resolved, check });
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedDirectory {
    pub path: String,
    pub resource_uri: String,
    #[serde(rename = "apis_allowed", skip_serializing_if = "Vec::is_empty")]
    pub apis: Vec<String>,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedDirectories {
    pub directories: Vec<AllowedDirectory>,
}

/// Group every operation's accessible patterns by pattern. `None` (an unresolvable caller)
/// yields an empty listing.
pub fn allowed_directories(account: Option<&BackendAccount>, shared_dir_name: &str) -> AllowedDirectories {
    let mut by_path: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(account) = account {
        for op in OPERATIONS {
            for p in accessible_paths(op.scope, account, shared_dir_name) {
                by_path.entry(p).or_default().push(op.name.to_string());
            }
        }
    }
    AllowedDirectories {
        directories: by_path
            .into_iter()
            .map(|(path, apis)| AllowedDirectory { resource_uri: resource_uri(&path), path, apis, allowed: true })
            .collect(),
    }
}
