//! Key-namespace configuration shared by the limiter and the lock.

use crate::error::InvalidArgument;

/// Default namespace for rate-limit state.
pub const DEFAULT_RATE_LIMIT_PREFIX: &str = "ratelimit";
/// Default namespace for lock keys.
pub const DEFAULT_LOCK_PREFIX: &str = "lock";

/// Validated key prefixes.
///
/// Both namespaces live in the same store; distinct prefixes keep a rate-limit
/// key from ever colliding with a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawCoordinationConfig"))]
pub struct CoordinationConfig {
    rate_limit_prefix: String,
    lock_prefix: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            rate_limit_prefix: DEFAULT_RATE_LIMIT_PREFIX.to_string(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
        }
    }
}

impl CoordinationConfig {
    /// Create a config with validation.
    ///
    /// Prefixes are trimmed and trailing `:` separators stripped. Errors if a
    /// prefix ends up empty, contains control characters, or both prefixes are
    /// equal.
    pub fn new(
        rate_limit_prefix: impl Into<String>,
        lock_prefix: impl Into<String>,
    ) -> Result<Self, InvalidArgument> {
        let rate_limit_prefix = normalize_prefix("rate_limit_prefix", rate_limit_prefix.into())?;
        let lock_prefix = normalize_prefix("lock_prefix", lock_prefix.into())?;
        if rate_limit_prefix == lock_prefix {
            return Err(InvalidArgument::new(
                "lock_prefix",
                format!("must differ from rate_limit_prefix (both {:?})", lock_prefix),
            ));
        }
        Ok(Self { rate_limit_prefix, lock_prefix })
    }

    pub fn rate_limit_prefix(&self) -> &str {
        &self.rate_limit_prefix
    }

    pub fn lock_prefix(&self) -> &str {
        &self.lock_prefix
    }

    /// `<rate_limit_prefix>:<key>`
    pub fn rate_limit_key(&self, key: &str) -> String {
        format!("{}:{}", self.rate_limit_prefix, key)
    }

    /// `<lock_prefix>:<key>`
    pub fn lock_key(&self, key: &str) -> String {
        format!("{}:{}", self.lock_prefix, key)
    }
}

fn normalize_prefix(name: &'static str, raw: String) -> Result<String, InvalidArgument> {
    let p = raw.trim().trim_end_matches(':').to_string();
    if p.is_empty() {
        return Err(InvalidArgument::new(name, "prefix cannot be empty"));
    }
    if p.chars().any(|c| c.is_control()) {
        return Err(InvalidArgument::new(name, "prefix cannot contain control characters"));
    }
    Ok(p)
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawCoordinationConfig {
    #[serde(default = "default_rate_limit_prefix")]
    rate_limit_prefix: String,
    #[serde(default = "default_lock_prefix")]
    lock_prefix: String,
}

#[cfg(feature = "serde")]
fn default_rate_limit_prefix() -> String {
    DEFAULT_RATE_LIMIT_PREFIX.to_string()
}

#[cfg(feature = "serde")]
fn default_lock_prefix() -> String {
    DEFAULT_LOCK_PREFIX.to_string()
}

#[cfg(feature = "serde")]
impl TryFrom<RawCoordinationConfig> for CoordinationConfig {
    type Error = InvalidArgument;

    fn try_from(raw: RawCoordinationConfig) -> Result<Self, Self::Error> {
        CoordinationConfig::new(raw.rate_limit_prefix, raw.lock_prefix)
    }
}
