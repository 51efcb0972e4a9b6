use std::fmt;

use sha2::{Digest, Sha256};

const TENANT_HASH_LEN: usize = 12;
const NAME_HASH_LEN: usize = 8;
const MAX_NAME_LEN: usize = 40;

/// Tenant-scoped key naming every external resource of a bot: its
/// container, workspace directory and secret store.
///
/// Never persisted; always recomputed from `(tenant, hostname)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct IsolationKey(String);

impl IsolationKey {
    /// Wraps a key read back from an external resource (label, directory).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn container_name(&self) -> String {
        format!("berth-{}", self.0)
    }
}

impl fmt::Display for IsolationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IsolationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn hex_prefix(input: &[u8], len: usize) -> String {
    let digest = Sha256::digest(input);
    let mut out = hex::encode(digest);
    out.truncate(len);
    out
}

fn sanitize_hostname(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    let mut out: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Derives the isolation key for a bot.
///
/// Format: `<sha256(tenant)[..12]>-<hostname>`. When the hostname has to be
/// rewritten to be a valid resource name (case, illegal characters, length),
/// a short hash of the original is appended so two distinct hostnames in the
/// same tenant never collapse onto one key.
pub fn derive_isolation_key(tenant_id: &str, hostname: &str) -> IsolationKey {
    let tenant = hex_prefix(tenant_id.as_bytes(), TENANT_HASH_LEN);
    let name = sanitize_hostname(hostname);

    if name.is_empty() {
        let h = hex_prefix(hostname.as_bytes(), NAME_HASH_LEN);
        return IsolationKey(format!("{tenant}-{h}"));
    }
    if name != hostname {
        let h = hex_prefix(hostname.as_bytes(), NAME_HASH_LEN);
        return IsolationKey(format!("{tenant}-{name}-{h}"));
    }
    IsolationKey(format!("{tenant}-{name}"))
}
