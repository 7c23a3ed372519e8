use std::collections::HashMap;

use callscript::values::Value;

fn roundtrip(value: &Value) -> Value {
    let bytes = rmp_serde::to_vec_named(value).unwrap();
    rmp_serde::from_slice(&bytes).unwrap()
}

#[test]
fn primitives_roundtrip() {
    for v in [
        Value::Null,
        Value::Bool(true),
        Value::Bool(false),
        Value::Int(-42),
        Value::Int(i64::MAX),
        Value::Float(3.25),
        Value::Str("hello".into()),
        Value::Bytes(vec![0, 1, 2, 255]),
    ] {
        assert_eq!(roundtrip(&v), v);
    }
}

#[test]
fn collections_roundtrip() {
    let mut map = HashMap::new();
    map.insert("k".to_string(), Value::List(vec![Value::Int(1), Value::Null]));
    map.insert("nested".to_string(), {
        let mut inner = HashMap::new();
        inner.insert("x".to_string(), Value::Float(0.5));
        Value::Map(inner)
    });
    let v = Value::Map(map);
    assert_eq!(roundtrip(&v), v);
}

#[test]
fn tagged_values_roundtrip() {
    let mut payload = HashMap::new();
    payload.insert("columns".to_string(), Value::List(vec!["a".into(), "b".into()]));
    payload.insert(
        "rows".to_string(),
        Value::List(vec![Value::List(vec![Value::Int(1), Value::Int(2)])]),
    );
    let v = Value::tagged("table", Value::Map(payload));
    assert_eq!(roundtrip(&v), v);
}

#[test]
fn tagged_inside_collections_roundtrip() {
    let v = Value::List(vec![
        Value::tagged("ts", Value::Str("2024-01-01T00:00:00Z".into())),
        Value::Int(7),
    ]);
    assert_eq!(roundtrip(&v), v);
}

#[test]
fn plain_two_key_map_is_not_mistaken_for_tag() {
    let mut map = HashMap::new();
    map.insert("a".to_string(), Value::Int(1));
    map.insert("b".to_string(), Value::Int(2));
    let v = Value::Map(map);
    assert_eq!(roundtrip(&v), v);
}
