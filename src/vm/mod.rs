mod value;
mod heap;
mod vm;
pub mod codeheap;
pub mod compiler;
pub mod disasm;
pub mod error;
pub mod host;
pub mod ic;
pub mod ops;
pub mod stack;
pub mod version;

pub use value::{Tag, Value, TRUE};
pub use heap::{GcRef, Heap, HeapObject, ZetaArray, ZetaObject, ZetaString};
pub use vm::{VM, VmStats};
pub use codeheap::{CodeAddr, CodeHeap, DEFAULT_CODE_HEAP_SIZE, MIN_CODE_HEAP_SIZE};
pub use error::{Result, VmError};
pub use host::{HostCtx, HostFn, HostFnId};
pub use stack::DEFAULT_STACK_SIZE;
pub use version::{BranchSlot, BranchTarget, VersionId};
