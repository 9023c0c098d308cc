//! Code heap for compiled block bodies.
//!
//! A fixed-capacity byte arena with a bump cursor. Bytes are only ever
//! appended, so an offset handed out once stays valid for the life of the VM.
//! All multi-byte fields are little-endian.

use super::Value;

/// Byte offset into the code heap.
pub type CodeAddr = u32;

/// Initial code heap size in bytes.
pub const DEFAULT_CODE_HEAP_SIZE: usize = 1 << 20;

/// Smallest usable code heap: a `push` (opcode and inline value) followed by
/// a `ret`.
pub const MIN_CODE_HEAP_SIZE: usize = 2 + 16 + 2;

pub struct CodeHeap {
    code: Vec<u8>,
    capacity: usize,
}

impl CodeHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity <= u32::MAX as usize,
            "code heap capacity {} exceeds the addressable range",
            capacity
        );
        Self {
            code: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Current allocation cursor (the address the next byte is written to).
    pub fn offset(&self) -> CodeAddr {
        self.code.len() as CodeAddr
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    fn reserve(&mut self, n: usize) {
        if self.code.len() + n > self.capacity {
            panic!(
                "code heap exhausted: {} of {} bytes used, {} more requested",
                self.code.len(),
                self.capacity,
                n
            );
        }
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.reserve(1);
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit_bytes(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.emit_bytes(&value.to_le_bytes());
    }

    pub fn emit_value(&mut self, value: Value) {
        let (tag, payload) = value.to_words();
        self.emit_u64(tag);
        self.emit_u64(payload);
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.code.extend_from_slice(bytes);
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    fn read<const N: usize>(&self, addr: &mut usize) -> [u8; N] {
        let end = *addr + N;
        let bytes = self
            .code
            .get(*addr..end)
            .unwrap_or_else(|| panic!("code read past end of heap at {}", *addr));
        *addr = end;
        bytes.try_into().expect("slice has length N")
    }

    pub fn read_u8(&self, addr: &mut usize) -> u8 {
        self.read::<1>(addr)[0]
    }

    pub fn read_u16(&self, addr: &mut usize) -> u16 {
        u16::from_le_bytes(self.read(addr))
    }

    pub fn read_u32(&self, addr: &mut usize) -> u32 {
        u32::from_le_bytes(self.read(addr))
    }

    pub fn read_u64(&self, addr: &mut usize) -> u64 {
        u64::from_le_bytes(self.read(addr))
    }

    pub fn read_value(&self, addr: &mut usize) -> Value {
        let at = *addr;
        let tag = self.read_u64(addr);
        let payload = self.read_u64(addr);
        Value::from_words(tag, payload)
            .unwrap_or_else(|| panic!("corrupt value literal at code offset {}", at))
    }
}

impl std::fmt::Debug for CodeHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeHeap")
            .field("used", &self.code.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
