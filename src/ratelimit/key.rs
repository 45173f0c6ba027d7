//! Store key composition for partitions.

/// Default prefix for partition keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "slidegate";

/// Prefixes caller-supplied partition keys so limiter data never collides
/// with unrelated keys in the same store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// Create a namespace with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The prefix shared by every key in this namespace.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store key for a partition: `{prefix}:{partition_key}`.
    ///
    /// An empty prefix leaves the partition key untouched.
    pub fn store_key(&self, partition_key: &str) -> String {
        if self.prefix.is_empty() {
            return partition_key.to_string();
        }
        format!("{}:{}", self.prefix, partition_key)
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl std::fmt::Display for KeyNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix)
    }
}
