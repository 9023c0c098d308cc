use std::collections::HashMap;
use std::fmt;

use super::error::{Result, VmError};
use super::Value;

/// Reference to an object in the [`Heap`].
///
/// References are plain arena indices. Objects are never moved or freed, so a
/// reference stays valid for the life of the heap that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef {
    index: u32,
}

impl GcRef {
    pub fn from_index(index: u32) -> Self {
        Self { index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Immutable string.
#[derive(Debug, Clone)]
pub struct ZetaString {
    pub value: String,
}

/// Growable array of values.
#[derive(Debug, Clone, Default)]
pub struct ZetaArray {
    pub elements: Vec<Value>,
}

impl ZetaArray {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.elements.push(value);
    }

    pub fn get(&self, index: i64) -> Result<Value> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.elements.get(i).copied())
            .ok_or(VmError::IndexOutOfBounds {
                op: "get_elem",
                index,
                len: self.elements.len(),
            })
    }

    pub fn set(&mut self, index: i64, value: Value) -> Result<()> {
        let len = self.elements.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.elements.get_mut(i))
            .ok_or(VmError::IndexOutOfBounds {
                op: "set_elem",
                index,
                len,
            })?;
        *slot = value;
        Ok(())
    }
}

/// Open record of name/value pairs. Fields keep their insertion slot, which
/// is what inline caches record.
#[derive(Debug, Clone, Default)]
pub struct ZetaObject {
    fields: Vec<(String, Value)>,
}

impl ZetaObject {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.slot_of(name).is_some()
    }

    /// Look up a field, also returning the slot index it lives in.
    pub fn get_field(&self, name: &str) -> Option<(Value, usize)> {
        let slot = self.slot_of(name)?;
        Some((self.fields[slot].1, slot))
    }

    pub fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        if !is_valid_ident(name) {
            return Err(VmError::InvalidIdentifier(name.to_string()));
        }
        match self.slot_of(name) {
            Some(slot) => self.fields[slot].1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
        Ok(())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn slot_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(k, _)| k == name)
    }
}

/// Check that a field name is `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub enum HeapObject {
    String(ZetaString),
    Array(ZetaArray),
    Object(ZetaObject),
}

/// Arena for strings, arrays and objects.
///
/// There is no collector: program images, compiled blocks and inline caches
/// all hold raw references, so objects live as long as the heap does.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    /// One-character strings produced by `get_char`, keyed by byte.
    char_strings: HashMap<u8, GcRef>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn alloc(&mut self, obj: HeapObject) -> GcRef {
        let r = GcRef::from_index(self.objects.len() as u32);
        self.objects.push(obj);
        r
    }

    pub fn alloc_string(&mut self, value: impl Into<String>) -> GcRef {
        self.alloc(HeapObject::String(ZetaString {
            value: value.into(),
        }))
    }

    pub fn alloc_array(&mut self, elements: Vec<Value>) -> GcRef {
        self.alloc(HeapObject::Array(ZetaArray { elements }))
    }

    pub fn alloc_object(&mut self, capacity: usize) -> GcRef {
        self.alloc(HeapObject::Object(ZetaObject::with_capacity(capacity)))
    }

    /// Single-byte string for an ASCII `byte`, allocated once and shared
    /// afterwards.
    pub fn char_string(&mut self, byte: u8) -> GcRef {
        assert!(byte.is_ascii(), "byte {:#04x} is not a one-byte string", byte);
        if let Some(r) = self.char_strings.get(&byte) {
            return *r;
        }
        let r = self.alloc_string(char::from(byte).to_string());
        self.char_strings.insert(byte, r);
        r
    }

    pub fn get(&self, r: GcRef) -> Option<&HeapObject> {
        self.objects.get(r.index() as usize)
    }

    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(r.index() as usize)
    }

    pub fn string(&self, r: GcRef) -> Option<&str> {
        match self.get(r)? {
            HeapObject::String(s) => Some(&s.value),
            _ => None,
        }
    }

    pub fn array(&self, r: GcRef) -> Option<&ZetaArray> {
        match self.get(r)? {
            HeapObject::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, r: GcRef) -> Option<&mut ZetaArray> {
        match self.get_mut(r)? {
            HeapObject::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn object(&self, r: GcRef) -> Option<&ZetaObject> {
        match self.get(r)? {
            HeapObject::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, r: GcRef) -> Option<&mut ZetaObject> {
        match self.get_mut(r)? {
            HeapObject::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Render a value for printing.
    pub fn display(&self, value: Value) -> String {
        let mut out = String::new();
        self.write_value(&mut out, value, 0);
        out
    }

    fn write_value(&self, out: &mut String, value: Value, depth: usize) {
        use std::fmt::Write;

        if depth > 8 {
            out.push_str("...");
            return;
        }
        match value {
            Value::Undef => out.push_str("$undef"),
            Value::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            Value::Int64(n) => {
                let _ = write!(out, "{}", n);
            }
            Value::Str(r) => out.push_str(self.string(r).unwrap_or("<invalid string>")),
            Value::Array(r) => {
                out.push('[');
                if let Some(arr) = self.array(r) {
                    for (i, elem) in arr.elements.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.write_value(out, *elem, depth + 1);
                    }
                }
                out.push(']');
            }
            Value::Object(r) => {
                out.push('{');
                if let Some(obj) = self.object(r) {
                    for (i, (name, v)) in obj.fields().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        let _ = write!(out, "{}: ", name);
                        self.write_value(out, v, depth + 1);
                    }
                }
                out.push('}');
            }
            Value::HostFn(id) => {
                let _ = write!(out, "<hostfn {}>", id.0);
            }
            Value::RetAddr(_) | Value::SavedFrame(_) => out.push_str("<frame marker>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_fields_report_slots() {
        let mut heap = Heap::new();
        let r = heap.alloc_object(2);
        let obj = heap.object_mut(r).unwrap();
        obj.set_field("x", Value::Int64(1)).unwrap();
        obj.set_field("y", Value::Int64(2)).unwrap();
        obj.set_field("x", Value::Int64(3)).unwrap();

        let obj = heap.object(r).unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj.get_field("x"), Some((Value::Int64(3), 0)));
        assert_eq!(obj.get_field("y"), Some((Value::Int64(2), 1)));
        assert_eq!(obj.get_field("z"), None);
        assert!(obj.has_field("y"));
    }

    #[test]
    fn test_set_field_rejects_bad_identifiers() {
        let mut obj = ZetaObject::with_capacity(1);
        assert!(obj.set_field("_ok1", Value::Undef).is_ok());
        for bad in ["", "1abc", "a-b", "has space"] {
            assert_eq!(
                obj.set_field(bad, Value::Undef),
                Err(VmError::InvalidIdentifier(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_array_bounds() {
        let mut arr = ZetaArray::default();
        arr.push(Value::Int64(10));
        assert_eq!(arr.get(0), Ok(Value::Int64(10)));
        assert!(matches!(
            arr.get(1),
            Err(VmError::IndexOutOfBounds { index: 1, len: 1, .. })
        ));
        assert!(arr.get(-1).is_err());
        assert!(arr.set(5, Value::Undef).is_err());
        arr.set(0, Value::Bool(true)).unwrap();
        assert_eq!(arr.elements, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_char_strings_are_shared() {
        let mut heap = Heap::new();
        let a = heap.char_string(b'a');
        let b = heap.char_string(b'a');
        assert_eq!(a, b);
        assert_eq!(heap.string(a), Some("a"));
        assert_ne!(heap.char_string(b'b'), a);
    }

    #[test]
    #[should_panic(expected = "not a one-byte string")]
    fn test_char_string_rejects_non_ascii() {
        Heap::new().char_string(0xc3);
    }

    #[test]
    fn test_display() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("hi");
        let arr = heap.alloc_array(vec![Value::Int64(1), Value::Str(s)]);
        assert_eq!(heap.display(Value::Array(arr)), "[1, hi]");
        assert_eq!(heap.display(Value::Undef), "$undef");
    }
}
