//! Throttle key derivation and storage key namespacing.

use std::fmt;
use std::net::IpAddr;

/// Separator between the parts of a composite key.
pub const KEY_SEPARATOR: char = ':';

/// Prefix that keeps lockout records apart from attempt counters.
const LOCKOUT_PREFIX: &str = "lockout|";

/// Prefix of keys derived from a network address. Reserved: identities that
/// start with it are rejected, so a submitted field can never land in an
/// address bucket.
pub const ADDR_PREFIX: &str = "addr:";

/// A non-empty identifier a rule is scoped to, e.g. `email:ip` or a user id.
///
/// The type cannot hold a blank value, so unkeyed requests can never be
/// grouped together under an empty key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey(String);

impl ThrottleKey {
    /// Build a key from a raw identifier. Returns `None` if it is blank or
    /// uses the reserved [`ADDR_PREFIX`].
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() || trimmed.starts_with(ADDR_PREFIX) {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Join sub-identifiers with [`KEY_SEPARATOR`].
    ///
    /// Returns `None` when any part is blank: a partial identity is not the
    /// caller the rule was written for.
    pub fn composite<I, S>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for part in parts {
            let part = part.as_ref().trim();
            if part.is_empty() {
                return None;
            }
            if !joined.is_empty() {
                joined.push(KEY_SEPARATOR);
            }
            joined.push_str(part);
        }
        Self::new(joined)
    }

    /// Key a caller by network address, e.g. `addr:203.0.113.5`.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self(format!("{}{}", ADDR_PREFIX, addr))
    }

    /// Use `derived` if present, otherwise fall back to the network address.
    pub fn or_addr(derived: Option<String>, addr: IpAddr) -> Self {
        derived
            .and_then(Self::new)
            .unwrap_or_else(|| Self::from_addr(addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key of the attempt counter: `"{action}:{key}"`.
pub fn counter_key(action: &str, key: &ThrottleKey) -> String {
    format!("{}{}{}", action, KEY_SEPARATOR, key)
}

/// Store key of the lockout record for the same pair.
pub fn lockout_key(action: &str, key: &ThrottleKey) -> String {
    format!("{}{}", LOCKOUT_PREFIX, counter_key(action, key))
}
