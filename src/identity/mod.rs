//! Caller identity and backend access: credential extraction, account resolution,
//! the pooled backend sessions and the path allow-list matcher.
//! Everything callers need is re-exported here.

mod access;
mod account;
mod credentials;
mod pool;

pub use access::{is_access_allowed, AccessRules};
pub use account::{AccountResolver, BackendAccount};
pub use credentials::{
    extract_networked, parse_authorization, AuthScheme, CredentialParseError, Identity, TransportMode,
    ANONYMOUS_USER, FORWARDED_USER_HEADER,
};
pub use pool::{release_evicted, Evicted, SessionPool};
