// Runtime value system for callscript
// Represents values flowing through call chains (different from the AST,
// which represents parsed code)

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reserved map key marking a tagged rich value on the wire.
pub const EXT_TAG_KEY: &str = "!ext";
/// Reserved map key carrying a tagged value's payload.
pub const EXT_DATA_KEY: &str = "data";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// Extension hook for rich types beyond primitives/collections. Encoded
    /// as a two-key map (`!ext` tag + `data` payload) so any peer can decode
    /// it structurally even without a registered codec for the tag.
    Tagged { tag: String, value: Box<Value> },
}

impl Value {
    pub fn tagged(tag: impl Into<String>, value: Value) -> Self {
        Value::Tagged {
            tag: tag.into(),
            value: Box::new(value),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Tagged { .. } => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Tagged { .. } => "tagged",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "none"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Bytes(b) => write!(f, "#bytes({})", b.len()),
            Value::List(l) => {
                let items: Vec<String> = l.iter().map(|item| format!("{}", item)).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Map(m) => {
                let mut items: Vec<String> =
                    m.iter().map(|(k, v)| format!("\"{}\": {}", k, v)).collect();
                items.sort();
                write!(f, "{{{}}}", items.join(", "))
            }
            Value::Tagged { tag, value } => write!(f, "#{}({})", tag, value),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(m: HashMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::List(l) => {
                let mut seq = serializer.serialize_seq(Some(l.len()))?;
                for item in l {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Tagged { tag, value } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(EXT_TAG_KEY, tag)?;
                map.serialize_entry(EXT_DATA_KEY, value.as_ref())?;
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a callscript value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, i: i64) -> Result<Value, E> {
        Ok(Value::Int(i))
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> Result<Value, E> {
        i64::try_from(u)
            .map(Value::Int)
            .map_err(|_| E::custom("integer out of range"))
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> Result<Value, E> {
        Ok(Value::Float(f))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::Str(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::Str(s))
    }

    fn visit_bytes<E: de::Error>(self, b: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(b.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, b: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(b))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = HashMap::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        // A two-key map carrying the reserved tag key is a rich value.
        let is_tagged = map.len() == 2
            && map.contains_key(EXT_DATA_KEY)
            && matches!(map.get(EXT_TAG_KEY), Some(Value::Str(_)));
        if is_tagged {
            if let (Some(Value::Str(tag)), Some(value)) =
                (map.remove(EXT_TAG_KEY), map.remove(EXT_DATA_KEY))
            {
                return Ok(Value::Tagged {
                    tag,
                    value: Box::new(value),
                });
            }
        }
        Ok(Value::Map(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Conversion hook for rich types carried across the wire as tagged values.
///
/// Implementors pick a tag and a payload shape; any peer without the type
/// still round-trips the value structurally as `Value::Tagged`.
pub trait TaggedValue: Sized {
    const TAG: &'static str;

    fn to_payload(&self) -> Value;
    fn from_payload(payload: &Value) -> Option<Self>;

    fn to_value(&self) -> Value {
        Value::tagged(Self::TAG, self.to_payload())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Tagged { tag, value } if tag == Self::TAG => Self::from_payload(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Instant {
        epoch_ms: i64,
    }

    impl TaggedValue for Instant {
        const TAG: &'static str = "instant";

        fn to_payload(&self) -> Value {
            Value::Int(self.epoch_ms)
        }

        fn from_payload(payload: &Value) -> Option<Self> {
            payload.as_int().map(|epoch_ms| Instant { epoch_ms })
        }
    }

    #[test]
    fn tagged_value_hook_round_trips() {
        let wire = Instant { epoch_ms: 1700000000000 }.to_value();
        assert_eq!(wire.type_name(), "tagged");
        let back = Instant::from_value(&wire).unwrap();
        assert_eq!(back.epoch_ms, 1700000000000);
        assert!(Instant::from_value(&Value::Int(3)).is_none());
        assert!(Instant::from_value(&Value::tagged("other", Value::Int(1))).is_none());
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Int(3).is_truthy());
        assert!(Value::tagged("frame", Value::Null).is_truthy());
    }

    #[test]
    fn display_is_stable() {
        let v = Value::List(vec![Value::Int(1), Value::Str("a".into()), Value::Null]);
        assert_eq!(v.to_string(), "[1, \"a\", none]");
        assert_eq!(
            Value::tagged("frame", Value::Int(2)).to_string(),
            "#frame(2)"
        );
    }
}
