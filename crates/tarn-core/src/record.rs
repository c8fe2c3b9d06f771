//! Self-describing records and the sort keys that order them.
//!
//! A pool stores heterogeneous typed records; the only structure the lake
//! itself imposes is the pool's **sort key**: a dotted field path plus a
//! direction. Sort-key values are projected into [`KeyValue`], a small
//! scalar domain with a deterministic total order (rank by type, then by
//! value), so that objects can record their key extremes and scans can be
//! pruned by range.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One self-describing typed record.
///
/// Records are JSON values, almost always objects. The lake never interprets
/// a record beyond projecting its sort-key field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(serde_json::Value);

impl Record {
    /// Wraps a JSON value as a record.
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Returns the underlying JSON value.
    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Consumes the record, returning the underlying JSON value.
    #[must_use]
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Resolves a dotted field path against the record.
    ///
    /// Returns `None` when any path component is absent or the record is
    /// not an object along the way.
    #[must_use]
    pub fn get(&self, path: &FieldPath) -> Option<&serde_json::Value> {
        let mut cur = &self.0;
        for part in path.parts() {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }

    /// Projects the sort-key value at `path`.
    ///
    /// A missing field projects to [`KeyValue::Null`], which sorts before
    /// every other value.
    #[must_use]
    pub fn key(&self, path: &FieldPath) -> KeyValue {
        self.get(path).map_or(KeyValue::Null, KeyValue::from_json)
    }

    /// Serializes the record as one line of a record file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if serialization fails.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| Error::io(format!("serialize record: {e}")))
    }

    /// Parses one line of a record file.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the line is not one well-formed record.
    pub fn from_line(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line)
            .map(Self)
            .map_err(|e| Error::corrupt(format!("malformed record: {e}")))
    }
}

impl From<serde_json::Value> for Record {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// A scalar sort-key value with a deterministic total order.
///
/// Values order by type rank first (`Null < Bool < numbers < String`), then
/// by value; integers and floats compare numerically within the shared
/// number rank. Composite values (arrays, objects) project to `Null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    /// Absent or non-scalar field.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float; ordered by `total_cmp`.
    Float(f64),
    /// UTF-8 string.
    String(String),
}

impl KeyValue {
    /// Projects a JSON value into the sort-key scalar domain.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || n.as_f64().map_or(Self::Null, Self::Float),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::String(s.clone()),
            // Null, arrays, and objects all sort as Null.
            _ => Self::Null,
        }
    }

    const fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::String(_) => 3,
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    #[allow(clippy::cast_precision_loss)]
    fn cmp(&self, other: &Self) -> Ordering {
        match self.type_rank().cmp(&other.type_rank()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).total_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.total_cmp(&(*b as f64)),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            _ => unreachable!("same type_rank implies comparable variants"),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// A dotted field path such as `meta.ts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parses a dotted path.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for an empty path or empty path component.
    pub fn parse(dotted: &str) -> Result<Self> {
        if dotted.is_empty() {
            return Err(Error::invalid("empty field path"));
        }
        let parts: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if parts.iter().any(String::is_empty) {
            return Err(Error::invalid(format!("bad field path '{dotted}'")));
        }
        Ok(Self(parts))
    }

    /// Returns the path components.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Ascending: smallest key first.
    Asc,
    /// Descending: largest key first.
    Desc,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

/// The tuple of field paths and direction that orders records in a pool.
///
/// The wire form carries a list of keys; the lake currently allows exactly
/// one, which callers validate at pool creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Sort direction, shared by all keys.
    pub order: Order,
    /// Dotted field paths, outermost first.
    pub keys: Vec<FieldPath>,
}

impl SortKey {
    /// Creates a single-key sort key.
    #[must_use]
    pub fn new(order: Order, key: FieldPath) -> Self {
        Self {
            order,
            keys: vec![key],
        }
    }

    /// Parses `"<dotted-path>:<asc|desc>"`, or a bare path meaning
    /// ascending.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` on a malformed path or direction.
    pub fn parse(s: &str) -> Result<Self> {
        let (path, order) = match s.rsplit_once(':') {
            Some((path, "asc")) => (path, Order::Asc),
            Some((path, "desc")) => (path, Order::Desc),
            Some((_, other)) => {
                return Err(Error::invalid(format!("bad sort direction '{other}'")))
            }
            None => (s, Order::Asc),
        };
        Ok(Self::new(order, FieldPath::parse(path)?))
    }

    /// Returns the primary (and currently only permitted) key.
    #[must_use]
    pub fn primary(&self) -> Option<&FieldPath> {
        self.keys.first()
    }

    /// Projects a record's primary sort-key value.
    #[must_use]
    pub fn key_of(&self, record: &Record) -> KeyValue {
        self.primary()
            .map_or(KeyValue::Null, |path| record.key(path))
    }

    /// Compares two already-projected key values, direction honored.
    #[must_use]
    pub fn compare_values(&self, a: &KeyValue, b: &KeyValue) -> Ordering {
        let ord = a.cmp(b);
        match self.order {
            Order::Asc => ord,
            Order::Desc => ord.reverse(),
        }
    }

    /// Compares two records by the primary key, direction honored.
    #[must_use]
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        self.compare_values(&self.key_of(a), &self.key_of(b))
    }
}

impl Default for SortKey {
    /// The default pool ordering: `ts` descending.
    fn default() -> Self {
        Self {
            order: Order::Desc,
            keys: vec![FieldPath(vec!["ts".to_string()])],
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths: Vec<String> = self.keys.iter().map(ToString::to_string).collect();
        write!(f, "{}:{}", paths.join(","), self.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn dotted_path_resolution() {
        let rec = Record::new(json!({"meta": {"ts": 7}, "v": "a"}));
        let path = FieldPath::parse("meta.ts").unwrap();
        assert_eq!(rec.key(&path), KeyValue::Int(7));

        let missing = FieldPath::parse("meta.none").unwrap();
        assert_eq!(rec.key(&missing), KeyValue::Null);
    }

    #[test]
    fn null_sorts_before_everything() {
        let values = [
            KeyValue::Bool(false),
            KeyValue::Int(i64::MIN),
            KeyValue::Float(f64::NEG_INFINITY),
            KeyValue::String(String::new()),
        ];
        for v in values {
            assert!(KeyValue::Null < v, "null should precede {v}");
        }
    }

    #[test]
    fn numbers_compare_across_int_and_float() {
        assert_eq!(KeyValue::Int(3), KeyValue::Float(3.0));
        assert!(KeyValue::Int(3) < KeyValue::Float(3.5));
        assert!(KeyValue::Float(2.5) < KeyValue::Int(3));
    }

    #[test]
    fn sort_key_honors_direction() {
        let key = SortKey::parse("ts:desc").unwrap();
        let a = Record::new(json!({"ts": 3}));
        let b = Record::new(json!({"ts": 1}));
        assert_eq!(key.compare(&a, &b), Ordering::Less);

        let asc = SortKey::parse("ts").unwrap();
        assert_eq!(asc.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn sort_key_roundtrips_through_serde() {
        let key = SortKey::parse("meta.ts:desc").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let back: SortKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
        assert_eq!(key.to_string(), "meta.ts:desc");
    }

    #[test]
    fn bad_sort_keys_are_rejected() {
        assert!(SortKey::parse("ts:sideways").is_err());
        assert!(SortKey::parse(":desc").is_err());
        assert!(FieldPath::parse("a..b").is_err());
    }

    #[test]
    fn key_value_untagged_serde() {
        let kv = KeyValue::Int(42);
        assert_eq!(serde_json::to_string(&kv).unwrap(), "42");
        let back: KeyValue = serde_json::from_str("42").unwrap();
        assert_eq!(back, KeyValue::Int(42));

        let s: KeyValue = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(s, KeyValue::String("abc".into()));
    }

    fn key_value_strategy() -> impl Strategy<Value = KeyValue> {
        prop_oneof![
            Just(KeyValue::Null),
            any::<bool>().prop_map(KeyValue::Bool),
            any::<i64>().prop_map(KeyValue::Int),
            any::<f64>().prop_map(KeyValue::Float),
            ".{0,16}".prop_map(KeyValue::String),
        ]
    }

    proptest! {
        #[test]
        fn key_value_order_is_total(a in key_value_strategy(), b in key_value_strategy()) {
            // Antisymmetry: a <= b and b <= a implies a == b.
            let ab = a.cmp(&b);
            let ba = b.cmp(&a);
            prop_assert_eq!(ab, ba.reverse());
        }

        #[test]
        fn sorting_is_deterministic(mut values in prop::collection::vec(key_value_strategy(), 0..32)) {
            let mut again = values.clone();
            values.sort();
            again.sort();
            prop_assert_eq!(values, again);
        }
    }
}
