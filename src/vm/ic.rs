//! Inline caches for field access.
//!
//! A [`FieldCache`] is bound to one field name at one access site. Each
//! successful lookup records the slot index the object reported for that
//! name. The slot is a hint only: lookups always go through the name, so a
//! stale hint can never produce a wrong value.

use std::cell::Cell;

use super::error::{Result, VmError};
use super::heap::{GcRef, Heap};
use super::Value;

#[derive(Debug, Clone)]
pub struct FieldCache {
    field: &'static str,
    slot: Cell<Option<usize>>,
}

impl FieldCache {
    pub const fn new(field: &'static str) -> Self {
        Self {
            field,
            slot: Cell::new(None),
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Slot index reported by the most recent successful lookup.
    pub fn slot_hint(&self) -> Option<usize> {
        self.slot.get()
    }

    pub fn get(&self, heap: &Heap, obj: GcRef) -> Result<Value> {
        let object = heap
            .object(obj)
            .unwrap_or_else(|| panic!("field cache \"{}\" used on a non-object", self.field));
        match object.get_field(self.field) {
            Some((value, slot)) => {
                self.slot.set(Some(slot));
                Ok(value)
            }
            None => Err(VmError::MissingField(self.field.to_string())),
        }
    }

    /// Like [`FieldCache::get`] but yields `None` for an absent field.
    pub fn get_opt(&self, heap: &Heap, obj: GcRef) -> Option<Value> {
        self.get(heap, obj).ok()
    }

    pub fn get_int64(&self, heap: &Heap, obj: GcRef) -> Result<i64> {
        let value = self.get(heap, obj)?;
        Ok(value.as_int64().unwrap_or_else(|| self.wrong_tag("int64", value)))
    }

    pub fn get_str<'h>(&self, heap: &'h Heap, obj: GcRef) -> Result<&'h str> {
        let value = self.get(heap, obj)?;
        let r = value.as_str().unwrap_or_else(|| self.wrong_tag("string", value));
        Ok(heap
            .string(r)
            .unwrap_or_else(|| panic!("dangling string in field \"{}\"", self.field)))
    }

    pub fn get_object(&self, heap: &Heap, obj: GcRef) -> Result<GcRef> {
        let value = self.get(heap, obj)?;
        Ok(value.as_object().unwrap_or_else(|| self.wrong_tag("object", value)))
    }

    pub fn get_array(&self, heap: &Heap, obj: GcRef) -> Result<GcRef> {
        let value = self.get(heap, obj)?;
        Ok(value.as_array().unwrap_or_else(|| self.wrong_tag("array", value)))
    }

    fn wrong_tag(&self, expected: &str, found: Value) -> ! {
        panic!(
            "field \"{}\" expected {} value, found {}",
            self.field,
            expected,
            found.type_name()
        )
    }
}

/// Caches owned by one compiled `call` instruction, used to read the callee's
/// calling-convention fields.
#[derive(Debug, Clone)]
pub struct CallSiteCache {
    pub num_params: FieldCache,
    pub num_locals: FieldCache,
    pub entry: FieldCache,
}

impl CallSiteCache {
    pub fn new() -> Self {
        Self {
            num_params: FieldCache::new("num_params"),
            num_locals: FieldCache::new("num_locals"),
            entry: FieldCache::new("entry"),
        }
    }
}

impl Default for CallSiteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_with(heap: &mut Heap, fields: &[(&str, Value)]) -> GcRef {
        let r = heap.alloc_object(fields.len());
        let obj = heap.object_mut(r).unwrap();
        for (name, value) in fields {
            obj.set_field(name, *value).unwrap();
        }
        r
    }

    #[test]
    fn test_ic_records_slot() {
        let mut heap = Heap::new();
        let obj = object_with(
            &mut heap,
            &[("a", Value::Int64(1)), ("idx", Value::Int64(7))],
        );
        let ic = FieldCache::new("idx");
        assert_eq!(ic.slot_hint(), None);
        assert_eq!(ic.get_int64(&heap, obj), Ok(7));
        assert_eq!(ic.slot_hint(), Some(1));
    }

    #[test]
    fn test_ic_hint_does_not_bypass_lookup() {
        let mut heap = Heap::new();
        let first = object_with(&mut heap, &[("val", Value::Int64(1))]);
        let second = object_with(
            &mut heap,
            &[("other", Value::Int64(5)), ("val", Value::Int64(2))],
        );
        let ic = FieldCache::new("val");
        assert_eq!(ic.get(&heap, first), Ok(Value::Int64(1)));
        assert_eq!(ic.get(&heap, second), Ok(Value::Int64(2)));
        assert_eq!(ic.slot_hint(), Some(1));
    }

    #[test]
    fn test_ic_missing_field() {
        let mut heap = Heap::new();
        let obj = object_with(&mut heap, &[]);
        let ic = FieldCache::new("to");
        assert_eq!(
            ic.get(&heap, obj),
            Err(VmError::MissingField("to".to_string()))
        );
        assert_eq!(ic.slot_hint(), None);
        assert_eq!(ic.get_opt(&heap, obj), None);
    }

    #[test]
    #[should_panic(expected = "expected int64")]
    fn test_ic_typed_accessor_wrong_tag_is_fatal() {
        let mut heap = Heap::new();
        let obj = object_with(&mut heap, &[("idx", Value::Bool(true))]);
        let _ = FieldCache::new("idx").get_int64(&heap, obj);
    }

    #[test]
    fn test_ic_get_str() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("push");
        let obj = object_with(&mut heap, &[("op", Value::Str(s))]);
        assert_eq!(FieldCache::new("op").get_str(&heap, obj), Ok("push"));
    }
}
