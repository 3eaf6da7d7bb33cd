//! Backend path helpers: lexical cleaning, home/shared directories and caller input resolution.

use crate::identity::BackendAccount;

pub const RESOURCE_URI_SCHEME: &str = "irods";

/// Lexically normalise a slash-separated path.
///
/// Collapses repeated separators, drops `.` elements and resolves `..` against the preceding
/// element. A rooted path never climbs above `/`; an empty result is `.` (or `/` when rooted).
pub fn clean_path(p: &str) -> String {
    if p.is_empty() {
        return ".".to_string();
    }
    let rooted = p.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => { parts.pop(); }
                _ => {
                    if !rooted {
                        parts.push("..");
                    }
                }
            },
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join two path fragments and clean the result; an empty `tail` yields the cleaned `base`.
pub fn join(base: &str, tail: &str) -> String {
    if tail.is_empty() {
        return clean_path(base);
    }
    if base.is_empty() {
        return clean_path(tail);
    }
    clean_path(&format!("{}/{}", base, tail))
}

pub fn home_path(account: &BackendAccount) -> String {
    format!("/{}/home/{}", account.client_zone, account.client_user)
}

pub fn shared_path(zone: &str, shared_dir_name: &str) -> String {
    format!("/{}/home/{}", zone, shared_dir_name)
}

/// Turn caller input into an absolute backend path.
///
/// Accepts an optional `i:` prefix, `/<zone>/~` and `~` home-relative forms, absolute paths,
/// and paths relative to the home directory. Anonymous accounts resolve against the shared dir.
pub fn resolve_backend_path(account: &BackendAccount, shared_dir_name: &str, input: &str) -> String {
    let home = if account.is_anonymous() {
        shared_path(&account.client_zone, shared_dir_name)
    } else {
        home_path(account)
    };

    let input = input.strip_prefix("i:").unwrap_or(input);

    let zone_home = format!("/{}/~", account.client_zone);
    if let Some(rest) = input.strip_prefix(zone_home.as_str()) {
        return join(&home, rest);
    }
    if input.starts_with('/') {
        return clean_path(input);
    }
    if let Some(rest) = input.strip_prefix('~') {
        return join(&home, rest);
    }
    join(&home, input)
}

/// Parent of `p`, `/` when `p` has no separator.
pub fn get_dir(p: &str) -> String {
    match p.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => p[..i].to_string(),
        None => "/".to_string(),
    }
}

pub fn resource_uri(path: &str) -> String {
    format!("{}://{}", RESOURCE_URI_SCHEME, path)
}
