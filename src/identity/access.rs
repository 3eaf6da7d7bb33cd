use regex::Regex;

use crate::error::GateError;
use crate::paths::clean_path;

/// Translate a single-level glob (`*`, `?`, `[...]`, `\` escapes) into an anchored regex.
/// Wildcards never cross `/`. Returns `None` for a malformed pattern.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => out.push_str(&regex::escape(&chars.next()?.to_string())),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                let mut empty = true;
                loop {
                    match chars.next()? {
                        ']' if !empty => break,
                        ']' => return None,
                        '\\' => out.push_str(&regex::escape(&chars.next()?.to_string())),
                        '-' if !empty && chars.peek().map(|n| *n != ']').unwrap_or(false) => out.push('-'),
                        other => out.push_str(&regex::escape(&other.to_string())),
                    }
                    empty = false;
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

fn has_glob_syntax(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '\\'])
}

/// Allow-list check of a backend path against accessible path patterns.
///
/// A `<dir>/*` pattern covers `<dir>` itself and everything below it, never a sibling that
/// merely shares the prefix. Any other pattern is an exact path or a single-level glob.
/// The first matching pattern grants access; no match denies.
pub fn is_access_allowed<S: AsRef<str>>(path: &str, patterns: &[S]) -> bool {
    let path = clean_path(path);
    patterns.iter().any(|p| {
        let p = p.as_ref();
        match p.strip_suffix("/*") {
            Some(base) => path == base || path.starts_with(&format!("{}/", base)),
            None if !has_glob_syntax(p) => p == path,
            None => glob_to_regex(p).map(|rx| rx.is_match(&path)).unwrap_or(false),
        }
    })
}

/// Accessible patterns for one operation, already scoped to a resolved account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRules {
    pub operation: String,
    pub patterns: Vec<String>,
}

impl AccessRules {
    pub fn new(operation: impl Into<String>, patterns: Vec<String>) -> Self {
        Self { operation: operation.into(), patterns }
    }

    pub fn allows(&self, path: &str) -> bool {
        is_access_allowed(path, &self.patterns)
    }

    pub fn check(&self, path: &str) -> Result<(), GateError> {
        if self.allows(path) {
            Ok(())
        } else {
            tracing::info!(operation = %self.operation, path, "access denied");
            Err(GateError::AccessDenied { operation: self.operation.clone(), path: path.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_covers_subtree_and_bare_dir() {
        let p = ["/z/home/shared/*"];
        assert!(is_access_allowed("/z/home/shared/x", &p));
        assert!(is_access_allowed("/z/home/shared/a/b/c", &p));
        assert!(is_access_allowed("/z/home/shared", &p));
        assert!(is_access_allowed("/z/home/shared/", &p));
    }

    #[test]
    fn wildcard_does_not_leak_to_siblings() {
        let p = ["/z/home/shared/*"];
        assert!(!is_access_allowed("/z/home/shared2/x", &p));
        assert!(!is_access_allowed("/z/home/shared2", &p));
        assert!(!is_access_allowed("/z/home", &p));
    }

    #[test]
    fn path_is_cleaned_before_matching() {
        let p = ["/z/home/shared/*"];
        assert!(!is_access_allowed("/z/home/shared/../bob/secret", &p));
        assert!(is_access_allowed("/z/home//shared/./x", &p));
    }

    #[test]
    fn exact_and_glob_patterns() {
        assert!(is_access_allowed("/z/home/alice", &["/z/home/alice"]));
        assert!(!is_access_allowed("/z/home/alice/x", &["/z/home/alice"]));
        assert!(is_access_allowed("/z/home/alice/a.txt", &["/z/home/alice/?.txt"]));
        assert!(is_access_allowed("/z/home/alice/run1.log", &["/z/home/alice/run*.log"]));
        assert!(!is_access_allowed("/z/home/alice/sub/run1.log", &["/z/home/alice/run*.log"]));
        assert!(is_access_allowed("/z/home/alice/b", &["/z/home/alice/[a-c]"]));
        assert!(!is_access_allowed("/z/home/alice/b", &["/z/home/alice/[^a-c]"]));
        assert!(is_access_allowed("/z/a.b", &["/z/a.b"]));
        assert!(!is_access_allowed("/z/axb", &["/z/a.b"]));
    }

    #[test]
    fn literal_patterns_compare_without_a_regex() {
        assert!(!has_glob_syntax("/z/home/alice/a.b+(c)"));
        assert!(has_glob_syntax("/z/home/alice/a*"));
        assert!(has_glob_syntax("/z/home/alice/[ab]"));
        assert!(is_access_allowed("/z/home/alice/a.b+(c)", &["/z/home/alice/a.b+(c)"]));
        assert!(!is_access_allowed("/z/home/alice/aab+(c)", &["/z/home/alice/a.b+(c)"]));
    }

    #[test]
    fn malformed_glob_never_matches() {
        assert!(!is_access_allowed("/z/x", &["/z/[x"]));
        assert!(!is_access_allowed("/z/x", &["/z/x\\"]));
        assert!(!is_access_allowed("/z/x", &["/z/[]"]));
    }

    #[test]
    fn empty_pattern_list_denies() {
        let none: [&str; 0] = [];
        assert!(!is_access_allowed("/", &none));
    }

    #[test]
    fn rules_report_denied_path() {
        let rules = AccessRules::new("irods_read_file", vec!["/z/home/shared/*".to_string()]);
        assert!(rules.check("/z/home/shared/x").is_ok());
        let err = rules.check("/z/home/bob/x").unwrap_err();
        assert_eq!(err.to_string(), r#""irods_read_file" request is not permitted for path "/z/home/bob/x""#);
    }
}
