//! Structured query keys and their canonical form.
//!
//! A [`QueryKey`] is an ordered list of [`KeySegment`]s, mirroring the
//! array-style keys used by TanStack Query:
//!
//! | Resource              | Key                                  |
//! |-----------------------|--------------------------------------|
//! | `/posts`              | `["posts"]`                          |
//! | `/posts/1`            | `["posts", 1]`                       |
//! | `/posts?authorId=1`   | `["posts", {"authorId": 1}]`         |
//! | `/posts/2/comments`   | `["posts", 2, "comments"]`           |
//!
//! Keys are compared structurally, never by reference. Object segments are
//! stored with sorted field names, so `{"a": 1, "b": 2}` and `{"b": 2, "a": 1}`
//! produce the same [`CanonicalKey`].
//!
//! # Example
//!
//! ```
//! use tears_query::{KeySegment, query_key};
//!
//! let list = query_key!["posts"];
//! let post = query_key!["posts", 1];
//! let filtered = query_key!["posts", KeySegment::object([("authorId", 1)])];
//!
//! assert!(list.is_prefix_of(&post));
//! assert!(list.is_prefix_of(&filtered));
//! assert!(!post.is_prefix_of(&list));
//! ```

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use serde::Serialize;
use serde_json::Value;

use crate::error::InvalidKeyError;

/// One segment of a [`QueryKey`].
///
/// Equality agrees with the canonical form: `Int` and `UInt` holding the same
/// number are equal, and so are `0.0` and `-0.0`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`.
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<KeySegment>),
    Object(BTreeMap<String, KeySegment>),
}

impl KeySegment {
    /// Builds an object segment, typically used for filters.
    pub fn object<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<KeySegment>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Object(
            fields
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    fn is_finite(&self) -> bool {
        match self {
            Self::Float(value) => value.is_finite(),
            Self::List(items) => items.iter().all(Self::is_finite),
            Self::Object(fields) => fields.values().all(Self::is_finite),
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::UInt(_) | Self::Str(_) => true,
        }
    }

    fn write_canonical(&self, out: &mut String) {
        // Writing into a String cannot fail.
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(value) => {
                let _ = write!(out, "{value}");
            }
            Self::Int(value) => {
                let _ = write!(out, "{value}");
            }
            Self::UInt(value) => {
                let _ = write!(out, "{value}");
            }
            Self::Float(value) => {
                // -0.0 == 0.0, so both must print the same.
                let value = if *value == 0.0 { 0.0 } else { *value };
                let _ = write!(out, "{value:?}");
            }
            Self::Str(value) => {
                let _ = write!(out, "{value:?}");
            }
            Self::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out);
                }
                out.push(']');
            }
            Self::Object(fields) => {
                out.push('{');
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{name:?}:");
                    value.write_canonical(out);
                }
                out.push('}');
            }
        }
    }
}

impl PartialEq for KeySegment {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Int(a), Self::UInt(b)) | (Self::UInt(b), Self::Int(a)) => {
                u64::try_from(*a).is_ok_and(|a| a == *b)
            }
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

macro_rules! int_segment {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeySegment {
                fn from(value: $ty) -> Self {
                    Self::Int(i64::from(value))
                }
            }
        )*
    };
}

int_segment!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for KeySegment {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::UInt(value), Self::Int)
    }
}

impl From<usize> for KeySegment {
    fn from(value: usize) -> Self {
        Self::from(value as u64)
    }
}

/// Integral floats collapse to [`KeySegment::Int`] so `1.0` and `1` are the same key.
impl From<f64> for KeySegment {
    fn from(value: f64) -> Self {
        const MAX_EXACT: f64 = 9_007_199_254_740_992.0; // 2^53
        if value.fract() == 0.0 && value.abs() <= MAX_EXACT {
            Self::Int(value as i64)
        } else {
            Self::Float(value)
        }
    }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<KeySegment>> From<Vec<T>> for KeySegment {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for KeySegment {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Self::Int(i),
                (None, Some(u)) => Self::UInt(u),
                (None, None) => n.as_f64().map_or(Self::Null, Self::from),
            },
            Value::String(s) => Self::Str(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => Self::Object(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Structured identifier for a cacheable resource.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    pub fn new(segments: impl IntoIterator<Item = KeySegment>) -> Self {
        Self(segments.into_iter().collect())
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new key with `segment` appended.
    #[must_use]
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Checks every segment for numbers that cannot be compared structurally.
    ///
    /// Unlike [`validate`](Self::validate) this accepts the empty key, which is
    /// a valid invalidation prefix matching every entry.
    pub fn check_segments(&self) -> Result<(), InvalidKeyError> {
        match self.0.iter().position(|segment| !segment.is_finite()) {
            Some(index) => Err(InvalidKeyError::NonFiniteNumber { index }),
            None => Ok(()),
        }
    }

    /// Validates the key for use as a cache address.
    pub fn validate(&self) -> Result<(), InvalidKeyError> {
        if self.0.is_empty() {
            return Err(InvalidKeyError::Empty);
        }
        self.check_segments()
    }

    /// Produces the stable comparison form used to address the cache.
    pub fn canonicalize(&self) -> Result<CanonicalKey, InvalidKeyError> {
        self.validate()?;
        let mut out = String::new();
        out.push('[');
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            segment.write_canonical(&mut out);
        }
        out.push(']');
        Ok(CanonicalKey(out))
    }

    /// Returns `true` if every segment of `self` equals the segment at the same
    /// position of `full`.
    pub fn is_prefix_of(&self, full: &QueryKey) -> bool {
        is_prefix_of(self, full)
    }
}

/// Returns `true` if `prefix` selects `full` for invalidation.
///
/// `["posts"]` is a prefix of `["posts", 1]` and of itself.
pub fn is_prefix_of(prefix: &QueryKey, full: &QueryKey) -> bool {
    prefix.0.len() <= full.0.len() && prefix.0.iter().zip(&full.0).all(|(p, f)| p == f)
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonicalize() {
            Ok(canonical) => f.write_str(canonical.as_str()),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self(vec![KeySegment::from(value)])
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self(vec![KeySegment::from(value)])
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(value: &QueryKey) -> Self {
        value.clone()
    }
}

impl<S: Into<KeySegment>> From<Vec<S>> for QueryKey {
    fn from(value: Vec<S>) -> Self {
        Self(value.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<KeySegment>, const N: usize> From<[S; N]> for QueryKey {
    fn from(value: [S; N]) -> Self {
        Self(value.into_iter().map(Into::into).collect())
    }
}

/// Builds a [`QueryKey`] from heterogeneous segments.
///
/// ```
/// use tears_query::query_key;
///
/// let key = query_key!["posts", 2, "comments"];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::QueryKey::new(::std::vec![$($crate::KeySegment::from($segment)),*])
    };
}

/// The canonical, totally ordered form of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
