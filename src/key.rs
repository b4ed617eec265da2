//! Cache key and hash-field types, and the collision-free composite token
//! used to name dedup entries and lock keys for hash-field loads.

use std::fmt;
use std::sync::Arc;

use crate::error::LoadError;

/// A validated, non-empty cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Build a `CacheKey`, rejecting an empty string.
    pub fn new(key: impl Into<Arc<str>>) -> Result<Self, LoadError> {
        let key = key.into();
        if key.is_empty() {
            return Err(LoadError::EmptyKey);
        }
        Ok(Self(key))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated `(key, field)` pair addressing one field of a hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashField {
    key: CacheKey,
    field: Arc<str>,
}

impl HashField {
    /// Build a `HashField`, rejecting an empty key or field.
    pub fn new(key: impl Into<Arc<str>>, field: impl Into<Arc<str>>) -> Result<Self, LoadError> {
        let key = CacheKey::new(key)?;
        let field = field.into();
        if field.is_empty() {
            return Err(LoadError::EmptyKey);
        }
        Ok(Self { key, field })
    }

    /// The hash's key.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The field name within the hash.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The collision-free composite token `"<len(key)>:<key>:<field>"`.
    ///
    /// The length prefix on `key` is load-bearing: without it, the two
    /// splits `("user", "profile:name")` and `("user:profile", "name")`
    /// would produce the same naive `key + ":" + field` concatenation.
    /// Prefixing with `key`'s byte length disambiguates every split.
    pub fn composite_token(&self) -> String {
        format!("{}:{}:{}", self.key.as_str().len(), self.key, self.field)
    }
}

impl fmt::Display for HashField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.composite_token())
    }
}

/// Any lookup addressable by a single dedup/lock token: either a flat key
/// or a hash field.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A flat key lookup.
    Key(CacheKey),
    /// A hash-field lookup.
    Hash(HashField),
}

impl Lookup {
    /// The token used to key the dedup group and the distributed lock name.
    pub fn token(&self) -> String {
        match self {
            Lookup::Key(k) => k.as_str().to_string(),
            Lookup::Hash(h) => h.composite_token(),
        }
    }
}
