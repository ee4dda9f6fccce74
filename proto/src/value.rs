use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Dynamically typed structured data, carried by configuration directives
/// (`config.value`) and configurable-key schemas.
///
/// Serialization is format-aware: human-readable formats (the YAML world
/// file, filter documents) see plain untagged values, while the binary
/// wire uses an explicitly tagged representation so a non-self-describing
/// codec can round-trip it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Integer(i) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

/// Tagged mirror used on non-self-describing formats.
#[derive(Serialize)]
enum TaggedRef<'a> {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(&'a str),
    List(&'a [Value]),
    Map(&'a BTreeMap<String, Value>),
}

#[derive(Deserialize)]
enum Tagged {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl From<Tagged> for Value {
    fn from(tagged: Tagged) -> Self {
        match tagged {
            Tagged::Null => Value::Null,
            Tagged::Bool(b) => Value::Bool(b),
            Tagged::Integer(i) => Value::Integer(i),
            Tagged::Float(f) => Value::Float(f),
            Tagged::String(s) => Value::String(s),
            Tagged::List(l) => Value::List(l),
            Tagged::Map(m) => Value::Map(m),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match self {
                Value::Null => serializer.serialize_unit(),
                Value::Bool(b) => serializer.serialize_bool(*b),
                Value::Integer(i) => serializer.serialize_i64(*i),
                Value::Float(f) => serializer.serialize_f64(*f),
                Value::String(s) => serializer.serialize_str(s),
                Value::List(list) => list.serialize(serializer),
                Value::Map(map) => map.serialize(serializer),
            }
        } else {
            let tagged = match self {
                Value::Null => TaggedRef::Null,
                Value::Bool(b) => TaggedRef::Bool(*b),
                Value::Integer(i) => TaggedRef::Integer(*i),
                Value::Float(f) => TaggedRef::Float(*f),
                Value::String(s) => TaggedRef::String(s),
                Value::List(list) => TaggedRef::List(list),
                Value::Map(map) => TaggedRef::Map(map),
            };
            tagged.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(AnyVisitor)
        } else {
            Tagged::deserialize(deserializer).map(Value::from)
        }
    }
}

struct AnyVisitor;

impl<'de> Visitor<'de> for AnyVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("any structured value") }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Value, E> { Ok(Value::Null) }

    fn visit_none<E: serde::de::Error>(self) -> Result<Value, E> { Ok(Value::Null) }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E: serde::de::Error>(self, b: bool) -> Result<Value, E> { Ok(Value::Bool(b)) }

    fn visit_i64<E: serde::de::Error>(self, i: i64) -> Result<Value, E> { Ok(Value::Integer(i)) }

    fn visit_u64<E: serde::de::Error>(self, u: u64) -> Result<Value, E> {
        i64::try_from(u).map(Value::Integer).map_err(|_| E::custom("integer out of range"))
    }

    fn visit_f64<E: serde::de::Error>(self, f: f64) -> Result<Value, E> { Ok(Value::Float(f)) }

    fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<Value, E> { Ok(Value::String(s.to_string())) }

    fn visit_string<E: serde::de::Error>(self, s: String) -> Result<Value, E> { Ok(Value::String(s)) }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut list = Vec::new();
        while let Some(item) = seq.next_element()? {
            list.push(item);
        }
        Ok(Value::List(list))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::Map(BTreeMap::from([
            ("region".to_string(), Value::String("eu-1".to_string())),
            ("channels".to_string(), Value::List(vec![Value::Integer(1), Value::Integer(3)])),
            ("enabled".to_string(), Value::Bool(true)),
            ("gain".to_string(), Value::Float(0.5)),
            ("note".to_string(), Value::Null),
        ]))
    }

    #[test]
    fn bincode_round_trip() {
        let value = sample();
        let bytes = bincode::serialize(&value).unwrap();
        assert_eq!(value, bincode::deserialize(&bytes).unwrap());
    }

    #[test]
    fn yaml_is_untagged() {
        let yaml = serde_yaml::to_string(&sample()).unwrap();
        assert!(yaml.contains("region: eu-1"), "{yaml}");
        assert!(!yaml.contains("String"), "{yaml}");

        let back: Value = serde_yaml::from_str(&yaml).unwrap();
        // YAML renders Null as null and parses it back
        assert_eq!(back, sample());
    }

    #[test]
    fn yaml_scalars_parse_typed() {
        let value: Value = serde_yaml::from_str("42").unwrap();
        assert_eq!(value, Value::Integer(42));
        let value: Value = serde_yaml::from_str("fourty-two").unwrap();
        assert_eq!(value, Value::String("fourty-two".into()));
    }
}
