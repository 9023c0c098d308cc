//! JSON program images.
//!
//! An image is a JSON document whose root object is a package. JSON values
//! map onto VM values directly:
//!
//! | JSON            | Value    |
//! |-----------------|----------|
//! | `null`          | `Undef`  |
//! | `true`/`false`  | `Bool`   |
//! | integer         | `Int64`  |
//! | string          | `Str`    |
//! | array           | `Array`  |
//! | object          | `Object` |
//!
//! Objects may be named with an `"#id"` key and referenced from anywhere in
//! the document as `{"@ref": "<id>"}`, which is how blocks refer to each
//! other (including to themselves, for loops).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::{Map, Value as Json};

use crate::vm::{GcRef, Heap, Value};

const ID_KEY: &str = "#id";
const REF_KEY: &str = "@ref";

/// Load an image file into `heap`, returning the package object.
pub fn load_image_file(path: &Path, heap: &mut Heap) -> Result<GcRef, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("failed to read image {}: {}", path.display(), e))?;
    load_image_str(&content, heap)
        .map_err(|e| format!("failed to load image {}: {}", path.display(), e))
}

pub fn load_image_str(source: &str, heap: &mut Heap) -> Result<GcRef, String> {
    let json: Json =
        serde_json::from_str(source).map_err(|e| format!("invalid JSON: {}", e))?;
    load_image(&json, heap)
}

/// Load an already-parsed image.
pub fn load_image(json: &Json, heap: &mut Heap) -> Result<GcRef, String> {
    if !json.is_object() {
        return Err("image root must be an object".to_string());
    }
    let mut loader = Loader {
        heap,
        named: HashMap::new(),
    };
    loader.declare(json)?;
    match loader.convert(json)? {
        Value::Object(r) => Ok(r),
        other => Err(format!("image root must be an object, got {}", other.type_name())),
    }
}

struct Loader<'h> {
    heap: &'h mut Heap,
    named: HashMap<String, GcRef>,
}

impl Loader<'_> {
    /// Allocate every named object up front so references can point forward.
    fn declare(&mut self, json: &Json) -> Result<(), String> {
        match json {
            Json::Array(items) => {
                for item in items {
                    self.declare(item)?;
                }
            }
            Json::Object(map) => {
                if let Some(id) = map.get(ID_KEY) {
                    let id = id
                        .as_str()
                        .ok_or_else(|| format!("\"{}\" must be a string", ID_KEY))?;
                    let obj = self.heap.alloc_object(map.len().saturating_sub(1));
                    if self.named.insert(id.to_string(), obj).is_some() {
                        return Err(format!("duplicate object id \"{}\"", id));
                    }
                }
                for (key, value) in map {
                    if key != ID_KEY {
                        self.declare(value)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn convert(&mut self, json: &Json) -> Result<Value, String> {
        Ok(match json {
            Json::Null => Value::Undef,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Int64(
                n.as_i64()
                    .ok_or_else(|| format!("number {} is not a 64-bit integer", n))?,
            ),
            Json::String(s) => Value::Str(self.heap.alloc_string(s.as_str())),
            Json::Array(items) => {
                let elements = items
                    .iter()
                    .map(|item| self.convert(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Array(self.heap.alloc_array(elements))
            }
            Json::Object(map) => {
                if let Some(target) = map.get(REF_KEY) {
                    return self.reference(map, target);
                }
                let obj = match map.get(ID_KEY).and_then(Json::as_str) {
                    Some(id) => self.named[id],
                    None => self.heap.alloc_object(map.len()),
                };
                for (key, value) in map {
                    if key == ID_KEY {
                        continue;
                    }
                    let value = self.convert(value)?;
                    self.heap
                        .object_mut(obj)
                        .ok_or_else(|| format!("object for field \"{}\" vanished", key))?
                        .set_field(key, value)
                        .map_err(|e| e.to_string())?;
                }
                Value::Object(obj)
            }
        })
    }

    fn reference(&self, map: &Map<String, Json>, target: &Json) -> Result<Value, String> {
        if map.len() != 1 {
            return Err(format!("\"{}\" objects cannot carry other fields", REF_KEY));
        }
        let name = target
            .as_str()
            .ok_or_else(|| format!("\"{}\" must be a string", REF_KEY))?;
        self.named
            .get(name)
            .map(|r| Value::Object(*r))
            .ok_or_else(|| format!("reference to undefined object \"{}\"", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_mapping() {
        let mut heap = Heap::new();
        let root = load_image(
            &json!({ "a": 1, "b": true, "c": null, "d": "hi", "e": [1, 2] }),
            &mut heap,
        )
        .unwrap();
        let obj = heap.object(root).unwrap();
        assert_eq!(obj.get_field("a").unwrap().0, Value::Int64(1));
        assert_eq!(obj.get_field("b").unwrap().0, Value::Bool(true));
        assert_eq!(obj.get_field("c").unwrap().0, Value::Undef);
        let d = obj.get_field("d").unwrap().0.as_str().unwrap();
        assert_eq!(heap.string(d), Some("hi"));
        let e = obj.get_field("e").unwrap().0.as_array().unwrap();
        assert_eq!(heap.array(e).unwrap().len(), 2);
    }

    #[test]
    fn test_cyclic_references() {
        let mut heap = Heap::new();
        let root = load_image(
            &json!({
                "loop": {
                    "#id": "loop",
                    "instrs": [ { "op": "jump", "to": { "@ref": "loop" } } ]
                }
            }),
            &mut heap,
        )
        .unwrap();
        let obj = heap.object(root).unwrap();
        let block = obj.get_field("loop").unwrap().0.as_object().unwrap();
        assert!(!heap.object(block).unwrap().has_field("#id"));

        let instrs = heap.object(block).unwrap().get_field("instrs").unwrap().0;
        let instr = heap.array(instrs.as_array().unwrap()).unwrap().elements[0];
        let to = heap
            .object(instr.as_object().unwrap())
            .unwrap()
            .get_field("to")
            .unwrap()
            .0;
        assert_eq!(to, Value::Object(block));
    }

    #[test]
    fn test_load_errors() {
        let mut heap = Heap::new();
        assert!(load_image(&json!([1]), &mut heap).is_err());
        assert!(load_image(&json!({ "x": 1.5 }), &mut heap).is_err());
        assert!(load_image(&json!({ "x": { "@ref": "nope" } }), &mut heap).is_err());
        assert!(
            load_image(
                &json!({ "a": { "#id": "x" }, "b": { "#id": "x" } }),
                &mut heap
            )
            .is_err()
        );
        assert!(load_image_str("{ not json", &mut heap).is_err());
    }

    #[test]
    fn test_load_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.json");
        fs::write(&path, r#"{ "answer": 42 }"#).unwrap();

        let mut heap = Heap::new();
        let root = load_image_file(&path, &mut heap).unwrap();
        assert_eq!(
            heap.object(root).unwrap().get_field("answer").unwrap().0,
            Value::Int64(42)
        );
        assert!(load_image_file(&dir.path().join("missing.json"), &mut heap).is_err());
    }
}
