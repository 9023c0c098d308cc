//! The value stack.
//!
//! One contiguous array holds every frame's header, locals and operands.
//! The stack grows downward from `bottom` (the array length) toward index 0.
//!
//! ```text
//!   high  +---------------------+
//!         | RetAddr             |  base + 1
//!         | SavedFrame (caller) |  base
//!         | local 0             |  base - 1
//!         | ...                 |
//!         | local n-1           |  base - n
//!         | operands ...        |  < operand_base
//!   low   +---------------------+  sp
//! ```

use super::error::{Result, VmError};
use super::version::BranchSlot;
use super::Value;

/// Initial stack size in slots.
pub const DEFAULT_STACK_SIZE: usize = 1 << 16;

/// Caller state saved in a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameLink {
    pub base: u32,
    pub operand_base: u32,
}

impl FrameLink {
    pub fn to_bits(self) -> u64 {
        ((self.base as u64) << 32) | self.operand_base as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            base: (bits >> 32) as u32,
            operand_base: bits as u32,
        }
    }
}

/// Saved stack registers, used to unwind after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMark {
    sp: usize,
    base: usize,
    operand_base: usize,
}

pub struct ValueStack {
    slots: Vec<Value>,
    /// Index of the topmost value; `slots.len()` when empty.
    sp: usize,
    /// Index of the active frame's saved-caller slot.
    base: usize,
    /// `sp` of the active frame with an empty operand stack.
    operand_base: usize,
}

impl ValueStack {
    pub fn new(size: usize) -> Self {
        assert!(size > 0 && size <= u32::MAX as usize, "invalid stack size {}", size);
        Self {
            slots: vec![Value::Undef; size],
            sp: size,
            base: size,
            operand_base: size,
        }
    }

    /// Number of operands on the active frame's operand stack.
    pub fn depth(&self) -> usize {
        self.operand_base - self.sp
    }

    /// Number of values stored on the whole stack.
    pub fn used(&self) -> usize {
        self.slots.len() - self.sp
    }

    pub fn mark(&self) -> StackMark {
        StackMark {
            sp: self.sp,
            base: self.base,
            operand_base: self.operand_base,
        }
    }

    pub fn restore(&mut self, mark: StackMark) {
        assert!(mark.sp <= self.slots.len(), "stack mark out of range");
        self.sp = mark.sp;
        self.base = mark.base;
        self.operand_base = mark.operand_base;
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.sp == 0 {
            return Err(VmError::StackOverflow {
                capacity: self.slots.len(),
            });
        }
        self.sp -= 1;
        self.slots[self.sp] = value;
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value> {
        if self.sp >= self.operand_base {
            return Err(VmError::StackUnderflow("op cannot pop value, stack empty"));
        }
        let value = self.slots[self.sp];
        self.sp += 1;
        Ok(value)
    }

    /// Value `idx` slots below the top of the operand stack.
    pub fn peek(&self, idx: usize) -> Result<Value> {
        if idx >= self.depth() {
            return Err(VmError::StackUnderflow("invalid index for dup"));
        }
        Ok(self.slots[self.sp + idx])
    }

    pub fn num_locals(&self) -> usize {
        self.base.saturating_sub(self.operand_base)
    }

    pub fn local(&self, index: usize) -> Result<Value> {
        let slot = self.local_slot(index)?;
        Ok(self.slots[slot])
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> Result<()> {
        let slot = self.local_slot(index)?;
        self.slots[slot] = value;
        Ok(())
    }

    fn local_slot(&self, index: usize) -> Result<usize> {
        let num_locals = self.num_locals();
        if index >= num_locals {
            return Err(VmError::InvalidLocal { index, num_locals });
        }
        Ok(self.base - 1 - index)
    }

    /// Push a frame header and reserve `num_locals` slots set to undefined.
    /// `ret` is `None` for a top-level activation.
    pub fn push_frame(&mut self, ret: Option<BranchSlot>, num_locals: usize) -> Result<()> {
        let link = FrameLink {
            base: self.base as u32,
            operand_base: self.operand_base as u32,
        };
        if self.sp < num_locals + 2 {
            return Err(VmError::StackOverflow {
                capacity: self.slots.len(),
            });
        }
        self.sp -= 1;
        self.slots[self.sp] = Value::RetAddr(ret);
        self.sp -= 1;
        self.slots[self.sp] = Value::SavedFrame(link);
        self.base = self.sp;

        self.sp -= num_locals;
        self.slots[self.sp..self.base].fill(Value::Undef);
        self.operand_base = self.sp;
        Ok(())
    }

    /// Return-address marker of the active frame.
    pub fn return_address(&self) -> Option<BranchSlot> {
        match self.slots.get(self.base + 1) {
            Some(Value::RetAddr(ret)) => *ret,
            other => panic!("frame at {} has no return address: {:?}", self.base, other),
        }
    }

    /// Discard the active frame (header, locals and leftover operands) and
    /// reinstate the caller's. Returns the popped frame's return address.
    pub fn pop_frame(&mut self) -> Option<BranchSlot> {
        let ret = self.return_address();
        let link = match self.slots[self.base] {
            Value::SavedFrame(link) => link,
            other => panic!("frame at {} has no saved caller: {:?}", self.base, other),
        };
        self.sp = self.base + 2;
        self.base = link.base as usize;
        self.operand_base = link.operand_base as usize;
        ret
    }
}

impl std::fmt::Debug for ValueStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStack")
            .field("capacity", &self.slots.len())
            .field("sp", &self.sp)
            .field("base", &self.base)
            .field("operand_base", &self.operand_base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut stack = ValueStack::new(8);
        stack.push_frame(None, 0).unwrap();
        stack.push(Value::Int64(1)).unwrap();
        stack.push(Value::Int64(2)).unwrap();
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.pop(), Ok(Value::Int64(2)));
        assert_eq!(stack.pop(), Ok(Value::Int64(1)));
        assert!(matches!(stack.pop(), Err(VmError::StackUnderflow(_))));
    }

    #[test]
    fn test_pop_never_reaches_into_locals() {
        let mut stack = ValueStack::new(16);
        stack.push_frame(None, 2).unwrap();
        stack.set_local(0, Value::Int64(5)).unwrap();
        assert!(stack.pop().is_err());
        assert_eq!(stack.local(0), Ok(Value::Int64(5)));
        assert_eq!(stack.local(1), Ok(Value::Undef));
        assert_eq!(
            stack.local(2),
            Err(VmError::InvalidLocal {
                index: 2,
                num_locals: 2
            })
        );
    }

    #[test]
    fn test_peek_bounds() {
        let mut stack = ValueStack::new(8);
        stack.push_frame(None, 0).unwrap();
        stack.push(Value::Int64(42)).unwrap();
        assert_eq!(stack.peek(0), Ok(Value::Int64(42)));
        assert!(stack.peek(1).is_err());
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut stack = ValueStack::new(3);
        stack.push_frame(None, 0).unwrap();
        stack.push(Value::Undef).unwrap();
        assert_eq!(
            stack.push(Value::Undef),
            Err(VmError::StackOverflow { capacity: 3 })
        );
        assert!(ValueStack::new(3).push_frame(None, 2).is_err());
    }

    #[test]
    fn test_nested_frames_restore_caller() {
        let mut stack = ValueStack::new(32);
        let empty = stack.mark();
        stack.push_frame(None, 1).unwrap();
        stack.set_local(0, Value::Int64(10)).unwrap();
        stack.push(Value::Int64(99)).unwrap();
        let caller = stack.mark();

        stack.push_frame(Some(BranchSlot(4)), 2).unwrap();
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.num_locals(), 2);
        stack.push(Value::Int64(7)).unwrap();
        assert_eq!(stack.return_address(), Some(BranchSlot(4)));

        assert_eq!(stack.pop_frame(), Some(BranchSlot(4)));
        assert_eq!(stack.mark(), caller);
        assert_eq!(stack.local(0), Ok(Value::Int64(10)));
        assert_eq!(stack.pop(), Ok(Value::Int64(99)));

        assert_eq!(stack.pop_frame(), None);
        assert_eq!(stack.mark(), empty);
    }
}
