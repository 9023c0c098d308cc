use std::fmt;

use super::heap::GcRef;
use super::host::HostFnId;
use super::stack::FrameLink;
use super::version::BranchSlot;

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Undef = 0,
    Bool = 1,
    Int64 = 2,
    String = 3,
    Array = 4,
    Object = 5,
    HostFn = 6,
    RetAddr = 7,
    SavedFrame = 8,
}

impl Tag {
    /// Name used by the `has_tag` instruction.
    pub fn name(self) -> &'static str {
        match self {
            Tag::Undef => "undef",
            Tag::Bool => "bool",
            Tag::Int64 => "int64",
            Tag::String => "string",
            Tag::Array => "array",
            Tag::Object => "object",
            Tag::HostFn => "hostfn",
            Tag::RetAddr => "retaddr",
            Tag::SavedFrame => "savedframe",
        }
    }

    /// Parse a tag name as written in an instruction's `tag` field.
    /// Stack-internal markers are not nameable.
    pub fn from_name(name: &str) -> Option<Tag> {
        match name {
            "undef" => Some(Tag::Undef),
            "bool" => Some(Tag::Bool),
            "int64" => Some(Tag::Int64),
            "string" => Some(Tag::String),
            "array" => Some(Tag::Array),
            "object" => Some(Tag::Object),
            "hostfn" => Some(Tag::HostFn),
            _ => None,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Tag> {
        Some(match raw {
            0 => Tag::Undef,
            1 => Tag::Bool,
            2 => Tag::Int64,
            3 => Tag::String,
            4 => Tag::Array,
            5 => Tag::Object,
            6 => Tag::HostFn,
            7 => Tag::RetAddr,
            8 => Tag::SavedFrame,
            _ => return None,
        })
    }
}

/// A fixed-width tagged value.
///
/// Heap-backed values (strings, arrays, objects) hold a [`GcRef`] into the
/// VM's [`Heap`](super::Heap); equality on those is reference identity.
/// `RetAddr` and `SavedFrame` only ever appear in frame headers on the value
/// stack.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Undef,
    Bool(bool),
    Int64(i64),
    Str(GcRef),
    Array(GcRef),
    Object(GcRef),
    HostFn(HostFnId),
    /// Return-address marker. `None` marks a top-level activation.
    RetAddr(Option<BranchSlot>),
    /// Saved-caller marker linking a frame to its caller.
    SavedFrame(FrameLink),
}

pub const TRUE: Value = Value::Bool(true);

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Undef => Tag::Undef,
            Value::Bool(_) => Tag::Bool,
            Value::Int64(_) => Tag::Int64,
            Value::Str(_) => Tag::String,
            Value::Array(_) => Tag::Array,
            Value::Object(_) => Tag::Object,
            Value::HostFn(_) => Tag::HostFn,
            Value::RetAddr(_) => Tag::RetAddr,
            Value::SavedFrame(_) => Tag::SavedFrame,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.tag().name()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<GcRef> {
        match self {
            Value::Str(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<GcRef> {
        match self {
            Value::Array(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<GcRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Encode as a (tag, payload) word pair for the code stream.
    pub fn to_words(self) -> (u64, u64) {
        let payload = match self {
            Value::Undef => 0,
            Value::Bool(b) => b as u64,
            Value::Int64(n) => n as u64,
            Value::Str(r) | Value::Array(r) | Value::Object(r) => r.index() as u64,
            Value::HostFn(id) => id.0 as u64,
            Value::RetAddr(slot) => slot.map_or(0, |s| s.0 as u64 + 1),
            Value::SavedFrame(link) => link.to_bits(),
        };
        (self.tag() as u64, payload)
    }

    /// Decode a (tag, payload) word pair written by [`Value::to_words`].
    pub fn from_words(tag: u64, payload: u64) -> Option<Value> {
        let tag = u8::try_from(tag).ok().and_then(Tag::from_u8)?;
        Some(match tag {
            Tag::Undef => Value::Undef,
            Tag::Bool => Value::Bool(payload != 0),
            Tag::Int64 => Value::Int64(payload as i64),
            Tag::String => Value::Str(GcRef::from_index(payload as u32)),
            Tag::Array => Value::Array(GcRef::from_index(payload as u32)),
            Tag::Object => Value::Object(GcRef::from_index(payload as u32)),
            Tag::HostFn => Value::HostFn(HostFnId(payload as u32)),
            Tag::RetAddr => Value::RetAddr(match payload {
                0 => None,
                n => Some(BranchSlot((n - 1) as u32)),
            }),
            Tag::SavedFrame => Value::SavedFrame(FrameLink::from_bits(payload)),
        })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undef => write!(f, "Undef"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int64(n) => write!(f, "Int64({})", n),
            Value::Str(r) => write!(f, "Str(#{})", r.index()),
            Value::Array(r) => write!(f, "Array(#{})", r.index()),
            Value::Object(r) => write!(f, "Object(#{})", r.index()),
            Value::HostFn(id) => write!(f, "HostFn({})", id.0),
            Value::RetAddr(None) => write!(f, "RetAddr(top)"),
            Value::RetAddr(Some(slot)) => write!(f, "RetAddr(slot {})", slot.0),
            Value::SavedFrame(link) => write!(f, "SavedFrame({:?})", link),
        }
    }
}
