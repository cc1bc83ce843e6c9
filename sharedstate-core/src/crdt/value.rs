//! Conversion between JSON values and automerge objects.
//!
//! Element values are stored as plain automerge structure: JSON objects
//! become maps, arrays become lists and everything else becomes a scalar.
//! Strings are stored as scalar strings (last-writer-wins), not as text
//! objects; text objects written by other tools still read back as
//! strings.

use automerge::{
    transaction::Transactable, AutoCommit, AutomergeError, ObjId, ObjType, Prop, ReadDoc,
    ScalarValue, Value as AmValue,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{Map, Number, Value};

/// Reads the value stored at `obj[prop]`, or `None` if nothing is there.
pub fn read_prop<P: Into<Prop>>(
    doc: &AutoCommit,
    obj: &ObjId,
    prop: P,
) -> Result<Option<Value>, AutomergeError> {
    match doc.get(obj, prop)? {
        Some((AmValue::Object(obj_type), id)) => Ok(Some(read_object(doc, &id, obj_type)?)),
        Some((AmValue::Scalar(scalar), _)) => Ok(Some(scalar_to_json(&scalar))),
        None => Ok(None),
    }
}

/// Reads a whole automerge object as JSON.
pub fn read_object(
    doc: &AutoCommit,
    obj: &ObjId,
    obj_type: ObjType,
) -> Result<Value, AutomergeError> {
    match obj_type {
        ObjType::List => {
            let mut items = Vec::with_capacity(doc.length(obj));
            for index in 0..doc.length(obj) {
                items.push(read_prop(doc, obj, index)?.unwrap_or(Value::Null));
            }
            Ok(Value::Array(items))
        }
        ObjType::Text => Ok(Value::String(doc.text(obj)?)),
        _ => {
            let mut map = Map::new();
            for key in doc.keys(obj) {
                if let Some(value) = read_prop(doc, obj, key.as_str())? {
                    map.insert(key, value);
                }
            }
            Ok(Value::Object(map))
        }
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Value {
    match scalar {
        ScalarValue::Null => Value::Null,
        ScalarValue::Boolean(b) => Value::Bool(*b),
        ScalarValue::Str(s) => Value::String(s.to_string()),
        ScalarValue::Int(n) => Value::from(*n),
        ScalarValue::Uint(n) => Value::from(*n),
        ScalarValue::F64(f) => Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ScalarValue::Counter(_) | ScalarValue::Timestamp(_) => {
            scalar.to_i64().map(Value::from).unwrap_or(Value::Null)
        }
        ScalarValue::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
        _ => Value::Null,
    }
}

/// Converts a JSON leaf to an automerge scalar.
///
/// Arrays and objects are not scalars; callers route them through
/// [`put_json`] or [`insert_json`] instead.
pub(crate) fn json_to_scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Bool(b) => ScalarValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => ScalarValue::from(s.as_str()),
        _ => ScalarValue::Null,
    }
}

/// Writes `value` at `obj[prop]`, replacing whatever was there.
pub fn put_json<P: Into<Prop>>(
    doc: &mut AutoCommit,
    obj: &ObjId,
    prop: P,
    value: &Value,
) -> Result<(), AutomergeError> {
    match value {
        Value::Array(items) => {
            let list = doc.put_object(obj, prop, ObjType::List)?;
            fill_list(doc, &list, items)
        }
        Value::Object(fields) => {
            let map = doc.put_object(obj, prop, ObjType::Map)?;
            fill_map(doc, &map, fields)
        }
        scalar => doc.put(obj, prop, json_to_scalar(scalar)),
    }
}

/// Inserts `value` into the list `obj` at `index`.
pub fn insert_json(
    doc: &mut AutoCommit,
    obj: &ObjId,
    index: usize,
    value: &Value,
) -> Result<(), AutomergeError> {
    match value {
        Value::Array(items) => {
            let list = doc.insert_object(obj, index, ObjType::List)?;
            fill_list(doc, &list, items)
        }
        Value::Object(fields) => {
            let map = doc.insert_object(obj, index, ObjType::Map)?;
            fill_map(doc, &map, fields)
        }
        scalar => doc.insert(obj, index, json_to_scalar(scalar)),
    }
}

fn fill_list(doc: &mut AutoCommit, list: &ObjId, items: &[Value]) -> Result<(), AutomergeError> {
    for (index, item) in items.iter().enumerate() {
        insert_json(doc, list, index, item)?;
    }
    Ok(())
}

fn fill_map(
    doc: &mut AutoCommit,
    map: &ObjId,
    fields: &Map<String, Value>,
) -> Result<(), AutomergeError> {
    for (key, field) in fields {
        put_json(doc, map, key.as_str(), field)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::ROOT;
    use serde_json::json;

    #[test]
    fn test_nested_value_reads_back() {
        let mut doc = AutoCommit::new();
        let value = json!({
            "count": 3,
            "title": "hello",
            "ratio": 0.5,
            "done": false,
            "missing": null,
            "tags": ["a", "b"],
            "items": [{"name": "x", "qty": 2}],
        });

        put_json(&mut doc, &ROOT, "value", &value).unwrap();

        let read = read_prop(&doc, &ROOT, "value").unwrap().unwrap();
        assert_eq!(read, value);
    }

    #[test]
    fn test_scalar_root_value() {
        let mut doc = AutoCommit::new();
        put_json(&mut doc, &ROOT, "value", &json!(true)).unwrap();
        assert_eq!(read_prop(&doc, &ROOT, "value").unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_missing_prop_is_none() {
        let doc = AutoCommit::new();
        assert_eq!(read_prop(&doc, &ROOT, "value").unwrap(), None);
    }

    #[test]
    fn test_counter_reads_as_number() {
        let mut doc = AutoCommit::new();
        doc.put(&ROOT, "clicks", ScalarValue::counter(5)).unwrap();
        doc.increment(&ROOT, "clicks", 2).unwrap();
        assert_eq!(read_prop(&doc, &ROOT, "clicks").unwrap(), Some(json!(7)));
    }

    #[test]
    fn test_text_object_reads_as_string() {
        let mut doc = AutoCommit::new();
        let text = doc.put_object(&ROOT, "note", ObjType::Text).unwrap();
        doc.splice_text(&text, 0, 0, "hi there").unwrap();
        assert_eq!(read_prop(&doc, &ROOT, "note").unwrap(), Some(json!("hi there")));
    }

    #[test]
    fn test_insert_json_into_list() {
        let mut doc = AutoCommit::new();
        put_json(&mut doc, &ROOT, "list", &json!([1, 3])).unwrap();
        let (_, list) = doc.get(&ROOT, "list").unwrap().unwrap();
        insert_json(&mut doc, &list, 1, &json!({"two": 2})).unwrap();
        assert_eq!(
            read_prop(&doc, &ROOT, "list").unwrap(),
            Some(json!([1, {"two": 2}, 3]))
        );
    }
}
