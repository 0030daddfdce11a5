//! Function result cache and deterministic call identities
//!
//! Each intercepted call is identified by a Blake3 hash computed either from
//! the callee name plus the canonical preserves encoding of its arguments, or
//! from the callee name plus its call-site position. Identities are stable
//! across replays of the same program, which is what lets a resumed program
//! skip every call that already produced a result.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::value::{CallArgs, Value};

/// Deterministic identity of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey(String);

impl CallKey {
    /// Wrap an existing key string (e.g. one read back from a CLI flag).
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How call identities are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKeying {
    /// Name plus canonical argument encoding. Requires arguments to be
    /// identical across replays.
    #[default]
    Content,
    /// Name plus call-site index plus how many times that site already ran
    /// in the current pass. Tolerates non-deterministic arguments.
    Position,
}

impl CacheKeying {
    /// Derive the identity of a call under this keying scheme.
    pub fn key(&self, name: &str, args: &CallArgs, site: usize, occurrence: usize) -> CallKey {
        match self {
            CacheKeying::Content => key_for(name, args),
            CacheKeying::Position => key_for_site(name, site, occurrence),
        }
    }
}

/// Identity of a call from its name and arguments.
pub fn key_for(name: &str, args: &CallArgs) -> CallKey {
    let mut hasher = Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    if !args.is_empty() {
        hasher.update(&canonical_encoding(args));
    }
    CallKey(format!("call_{}", hasher.finalize().to_hex()))
}

/// Identity of a call from its name and position in the program.
pub fn key_for_site(name: &str, site: usize, occurrence: usize) -> CallKey {
    let mut hasher = Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(b"@");
    hasher.update(&(site as u64).to_le_bytes());
    hasher.update(b"#");
    hasher.update(&(occurrence as u64).to_le_bytes());
    CallKey(format!("call_{}", hasher.finalize().to_hex()))
}

/// Canonical byte encoding of call arguments.
///
/// Maps are ordered, so equal arguments always produce equal bytes.
fn canonical_encoding(args: &CallArgs) -> Vec<u8> {
    use preserves::PackedWriter;

    let mut buf = Vec::new();
    let mut writer = PackedWriter::new(&mut buf);
    match preserves::serde::to_writer(&mut writer, args) {
        Ok(()) => buf,
        Err(err) => {
            tracing::warn!(error = %err, "packed encoding failed, keying call by its debug form");
            fallback_encoding(args)
        }
    }
}

/// Encoding used when the packed writer rejects a value.
///
/// `Debug` output of ordered maps and lists is deterministic and cannot fail,
/// so distinct arguments still get distinct identities.
fn fallback_encoding(args: &CallArgs) -> Vec<u8> {
    let mut buf = b"debug:".to_vec();
    buf.extend_from_slice(format!("{:?}", args).as_bytes());
    buf
}

/// A cached call result together with the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Callee name.
    pub name: String,
    /// Arguments the call was made with.
    pub args: CallArgs,
    /// Observed result.
    pub value: Value,
}

/// Mapping from call identity to previously observed result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionCache {
    entries: BTreeMap<CallKey, CacheEntry>,
}

impl FunctionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for an identity, if any. Never triggers the call.
    pub fn get(&self, key: &CallKey) -> Option<&Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Full cache entry for an identity.
    pub fn entry(&self, key: &CallKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Record the result of a call.
    pub fn put(&mut self, key: CallKey, name: impl Into<String>, args: CallArgs, value: Value) {
        self.entries.insert(
            key,
            CacheEntry {
                name: name.into(),
                args,
                value,
            },
        );
    }

    /// Whether an identity has a cached result.
    pub fn contains(&self, key: &CallKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over cached entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&CallKey, &CacheEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_keys_are_deterministic() {
        let args = CallArgs::positional([Value::Integer(1), Value::Integer(2)]);
        assert_eq!(key_for("lookup", &args), key_for("lookup", &args.clone()));
        assert_ne!(key_for("lookup", &args), key_for("fetch", &args));
        assert_ne!(
            key_for("lookup", &args),
            key_for("lookup", &CallArgs::positional([Value::Integer(2), Value::Integer(1)]))
        );
        assert!(key_for("now", &CallArgs::new()).as_str().starts_with("call_"));
    }

    #[test]
    fn keyword_order_does_not_change_identity() {
        let a = CallArgs::new().with_keyword("a", 1).with_keyword("b", 2);
        let b = CallArgs::new().with_keyword("b", 2).with_keyword("a", 1);
        assert_eq!(key_for("f", &a), key_for("f", &b));
    }

    #[test]
    fn fallback_encoding_keeps_arguments_apart() {
        let one = CallArgs::positional([Value::Float(1.5)]);
        let other = CallArgs::positional([Value::Float(2.5)]);
        let nested = CallArgs::new().with_keyword("m", Value::Map(BTreeMap::new()));

        assert_eq!(fallback_encoding(&one), fallback_encoding(&one.clone()));
        assert_ne!(fallback_encoding(&one), fallback_encoding(&other));
        assert_ne!(fallback_encoding(&one), fallback_encoding(&nested));
        assert!(!fallback_encoding(&CallArgs::new()).is_empty());
        assert!(!canonical_encoding(&one).is_empty());
    }

    #[test]
    fn position_keys_distinguish_occurrences() {
        let keying = CacheKeying::Position;
        let args = CallArgs::positional([Value::from("same")]);
        let first = keying.key("ask_user", &args, 0, 0);
        let second = keying.key("ask_user", &args, 0, 1);
        let other_site = keying.key("ask_user", &args, 1, 0);
        assert_ne!(first, second);
        assert_ne!(first, other_site);
        assert_eq!(first, key_for_site("ask_user", 0, 0));
    }

    #[test]
    fn lookups_are_idempotent() {
        let mut cache = FunctionCache::new();
        let key = key_for("echo", &CallArgs::positional([Value::from("hi")]));
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), "echo", CallArgs::positional([Value::from("hi")]), Value::from("hi"));
        assert_eq!(cache.get(&key), Some(&Value::from("hi")));
        assert_eq!(cache.get(&key), Some(&Value::from("hi")));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entry(&key).map(|entry| entry.name.as_str()), Some("echo"));
    }
}
