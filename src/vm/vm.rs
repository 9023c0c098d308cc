use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;

use crate::config::RuntimeConfig;
use crate::vm::codeheap::{CodeAddr, CodeHeap, DEFAULT_CODE_HEAP_SIZE};
use crate::vm::compiler::{CodeSpace, Compiler};
use crate::vm::error::{Result, VmError};
use crate::vm::heap::{GcRef, Heap};
use crate::vm::host::{HostCtx, HostFn, HostFnId, HostRegistry, ImportResolver};
use crate::vm::ic::CallSiteCache;
use crate::vm::ops::Opcode;
use crate::vm::stack::{ValueStack, DEFAULT_STACK_SIZE};
use crate::vm::value::{Tag, TRUE};
use crate::vm::version::{BranchSlot, BranchTable, BranchTarget, VersionId, VersionTable};
use crate::vm::Value;

/// Execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStats {
    pub blocks_compiled: usize,
    pub branches_resolved: usize,
    pub instructions_executed: u64,
    pub calls: u64,
}

/// Calling-convention fields of a function object.
struct FunInfo {
    num_params: usize,
    num_locals: usize,
    entry: GcRef,
}

/// The zeta virtual machine.
///
/// Blocks are compiled lazily into the code heap the first time control can
/// reach them; a `VM` owns all state, so separate instances are isolated.
pub struct VM {
    code: CodeHeap,
    versions: VersionTable,
    branches: BranchTable,
    compiler: Compiler,
    stack: ValueStack,
    heap: Heap,
    hosts: HostRegistry,
    imports: ImportResolver,
    /// Caches for top-level `call_fun` invocations
    entry_site: CallSiteCache,
    stats: VmStats,
    /// Output stream for host functions
    output: Box<dyn Write>,
}

impl VM {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        Self::with_sizes(DEFAULT_CODE_HEAP_SIZE, DEFAULT_STACK_SIZE, output)
    }

    /// Create a VM with explicit code heap (bytes) and stack (slots) sizes.
    pub fn with_sizes(code_heap_size: usize, stack_size: usize, output: Box<dyn Write>) -> Self {
        Self {
            code: CodeHeap::with_capacity(code_heap_size),
            versions: VersionTable::new(),
            branches: BranchTable::new(),
            compiler: Compiler::new(),
            stack: ValueStack::new(stack_size),
            heap: Heap::new(),
            hosts: HostRegistry::new(),
            imports: ImportResolver::default(),
            entry_site: CallSiteCache::new(),
            stats: VmStats::default(),
            output,
        }
    }

    /// Create a new VM from a runtime configuration.
    pub fn with_config(config: &RuntimeConfig, output: Box<dyn Write>) -> Self {
        let mut vm = Self::with_sizes(config.code_heap_size, config.stack_size, output);
        vm.compiler.set_trace(config.trace_compile);
        vm.imports = ImportResolver::new(config.import_paths.clone());
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    pub fn code_heap(&self) -> &CodeHeap {
        &self.code
    }

    pub fn versions(&self) -> &VersionTable {
        &self.versions
    }

    pub fn branches(&self) -> &BranchTable {
        &self.branches
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub fn imports_mut(&mut self) -> &mut ImportResolver {
        &mut self.imports
    }

    /// Register a host function and return a value that can be called.
    pub fn register_host_fn(&mut self, f: HostFn) -> Value {
        Value::HostFn(self.hosts.register(f))
    }

    pub fn host_fn(&self, id: HostFnId) -> &HostFn {
        self.hosts.get(id)
    }

    /// Get the version of a block, creating a placeholder on first request.
    pub fn get_block_version(&mut self, block: GcRef) -> VersionId {
        self.versions.get_block_version(block)
    }

    /// Compile a version unless it already has code; returns its start.
    pub fn ensure_compiled(&mut self, version: VersionId) -> Result<CodeAddr> {
        if let Some(start) = self.versions.get(version).start() {
            return Ok(start);
        }
        let mut space = CodeSpace {
            code: &mut self.code,
            versions: &mut self.versions,
            branches: &mut self.branches,
        };
        let (start, _) = self.compiler.compile(version, &self.heap, &mut space)?;
        self.stats.blocks_compiled += 1;
        Ok(start)
    }

    /// Compile `block` and return its code range. Repeated calls return the
    /// same range.
    pub fn compile_block(&mut self, block: GcRef) -> Result<(CodeAddr, CodeAddr)> {
        let version = self.get_block_version(block);
        self.ensure_compiled(version)?;
        self.versions
            .get(version)
            .range()
            .ok_or_else(|| VmError::MalformedBlock(format!("block {:?} has no code", block)))
    }

    /// Eagerly compile every block reachable from `entry` through branch
    /// targets. Returns the number of blocks compiled by this call.
    pub fn compile_reachable(&mut self, entry: GcRef) -> Result<usize> {
        let mut queue = VecDeque::from([self.get_block_version(entry)]);
        let mut compiled = 0;
        while let Some(version) = queue.pop_front() {
            if self.versions.get(version).is_compiled() {
                continue;
            }
            let first_slot = self.branches.len();
            self.ensure_compiled(version)?;
            compiled += 1;
            for slot in first_slot..self.branches.len() {
                queue.push_back(self.branches.target_version(BranchSlot(slot as u32)));
            }
        }
        Ok(compiled)
    }

    /// Address a branch slot jumps to, compiling the target the first time.
    fn resolve_branch(&mut self, slot: BranchSlot) -> Result<CodeAddr> {
        match self.branches.get(slot) {
            BranchTarget::Resolved(addr) => Ok(addr),
            BranchTarget::Unresolved(version) => {
                let start = self.ensure_compiled(version)?;
                self.branches.resolve(slot, start);
                self.stats.branches_resolved += 1;
                tracing::trace!(slot = slot.0, version = version.0, start, "resolved branch");
                Ok(start)
            }
        }
    }

    /// Run compiled code from `start` until the top-level frame returns.
    pub fn exec_code(&mut self, start: CodeAddr) -> Result<Value> {
        let mut ip = start as usize;
        loop {
            let at = ip;
            let raw = self.code.read_u16(&mut ip);
            let op = Opcode::from_u16(raw)
                .unwrap_or_else(|| panic!("invalid opcode {} at code offset {}", raw, at));
            self.stats.instructions_executed += 1;

            match op {
                Opcode::GetLocal => {
                    let idx = self.code.read_u16(&mut ip) as usize;
                    let value = self.stack.local(idx)?;
                    self.stack.push(value)?;
                }
                Opcode::SetLocal => {
                    let idx = self.code.read_u16(&mut ip) as usize;
                    let value = self.stack.pop()?;
                    self.stack.set_local(idx, value)?;
                }
                Opcode::Push => {
                    let value = self.code.read_value(&mut ip);
                    self.stack.push(value)?;
                }
                Opcode::Pop => {
                    self.stack.pop()?;
                }
                Opcode::Dup => {
                    let idx = self.code.read_u16(&mut ip) as usize;
                    let value = self.stack.peek(idx)?;
                    self.stack.push(value)?;
                }
                Opcode::Swap => {
                    let v0 = self.stack.pop()?;
                    let v1 = self.stack.pop()?;
                    self.stack.push(v0)?;
                    self.stack.push(v1)?;
                }

                Opcode::AddI64 => self.int_binop(op, |a, b| Value::Int64(a.wrapping_add(b)))?,
                Opcode::SubI64 => self.int_binop(op, |a, b| Value::Int64(a.wrapping_sub(b)))?,
                Opcode::MulI64 => self.int_binop(op, |a, b| Value::Int64(a.wrapping_mul(b)))?,
                Opcode::LtI64 => self.int_binop(op, |a, b| Value::Bool(a < b))?,
                Opcode::LeI64 => self.int_binop(op, |a, b| Value::Bool(a <= b))?,
                Opcode::GtI64 => self.int_binop(op, |a, b| Value::Bool(a > b))?,
                Opcode::GeI64 => self.int_binop(op, |a, b| Value::Bool(a >= b))?,
                Opcode::EqI64 => self.int_binop(op, |a, b| Value::Bool(a == b))?,

                Opcode::StrLen => {
                    let s = self.pop_str("str_len")?;
                    let len = self.str_value(s).len();
                    self.stack.push(Value::Int64(len as i64))?;
                }
                Opcode::GetChar => {
                    let (index, byte) = self.pop_char_byte("get_char")?;
                    if !byte.is_ascii() {
                        return Err(VmError::NonAsciiChar {
                            op: "get_char",
                            index,
                            byte,
                        });
                    }
                    let s = self.heap.char_string(byte);
                    self.stack.push(Value::Str(s))?;
                }
                Opcode::GetCharCode => {
                    let (_, byte) = self.pop_char_byte("get_char_code")?;
                    self.stack.push(Value::Int64(byte as i64))?;
                }
                Opcode::StrCat => {
                    let a = self.pop_str("str_cat")?;
                    let b = self.pop_str("str_cat")?;
                    let joined = format!("{}{}", self.str_value(b), self.str_value(a));
                    let s = self.heap.alloc_string(joined);
                    self.stack.push(Value::Str(s))?;
                }
                Opcode::EqStr => {
                    let arg1 = self.pop_str("eq_str")?;
                    let arg0 = self.pop_str("eq_str")?;
                    let eq = self.str_value(arg0) == self.str_value(arg1);
                    self.stack.push(Value::Bool(eq))?;
                }

                Opcode::NewObject => {
                    let capacity = self.pop_int("new_object")?;
                    let obj = self.heap.alloc_object(capacity_hint(capacity));
                    self.stack.push(Value::Object(obj))?;
                }
                Opcode::HasField => {
                    let name = self.pop_str("has_field")?;
                    let obj = self.pop_object("has_field")?;
                    let has = self.object(obj).has_field(self.str_value(name));
                    self.stack.push(Value::Bool(has))?;
                }
                Opcode::SetField => {
                    let value = self.stack.pop()?;
                    let name = self.pop_str("set_field")?;
                    let obj = self.pop_object("set_field")?;
                    let name = self.str_value(name).to_string();
                    self.heap
                        .object_mut(obj)
                        .unwrap_or_else(|| panic!("dangling object {:?}", obj))
                        .set_field(&name, value)?;
                }
                Opcode::GetField => {
                    let name = self.pop_str("get_field")?;
                    let obj = self.pop_object("get_field")?;
                    let name = self.str_value(name);
                    let (value, _) = self
                        .object(obj)
                        .get_field(name)
                        .ok_or_else(|| VmError::MissingField(name.to_string()))?;
                    self.stack.push(value)?;
                }
                Opcode::EqObj => {
                    let arg1 = self.stack.pop()?;
                    let arg0 = self.stack.pop()?;
                    self.stack.push(Value::Bool(arg0 == arg1))?;
                }
                Opcode::EqBool => {
                    let arg1 = self.pop_bool("eq_bool")?;
                    let arg0 = self.pop_bool("eq_bool")?;
                    self.stack.push(Value::Bool(arg0 == arg1))?;
                }
                Opcode::HasTag => {
                    let raw = self.code.read_u8(&mut ip);
                    let tag = Tag::from_u8(raw)
                        .unwrap_or_else(|| panic!("invalid tag {} at code offset {}", raw, at));
                    let value = self.stack.pop()?;
                    self.stack.push(Value::Bool(value.tag() == tag))?;
                }

                Opcode::NewArray => {
                    let capacity = self.pop_int("new_array")?;
                    let arr = self
                        .heap
                        .alloc_array(Vec::with_capacity(capacity_hint(capacity)));
                    self.stack.push(Value::Array(arr))?;
                }
                Opcode::ArrayLen => {
                    let arr = self.pop_array("array_len")?;
                    let len = self.array(arr).len();
                    self.stack.push(Value::Int64(len as i64))?;
                }
                Opcode::ArrayPush => {
                    let value = self.stack.pop()?;
                    let arr = self.pop_array("array_push")?;
                    self.array_mut(arr).push(value);
                }
                Opcode::GetElem => {
                    let idx = self.pop_int("get_elem")?;
                    let arr = self.pop_array("get_elem")?;
                    let value = self.array(arr).get(idx)?;
                    self.stack.push(value)?;
                }
                Opcode::SetElem => {
                    let value = self.stack.pop()?;
                    let idx = self.pop_int("set_elem")?;
                    let arr = self.pop_array("set_elem")?;
                    self.array_mut(arr).set(idx, value)?;
                }

                Opcode::Jump => {
                    let slot = BranchSlot(self.code.read_u32(&mut ip));
                    ip = self.resolve_branch(slot)? as usize;
                }
                Opcode::IfTrue => {
                    let then_slot = BranchSlot(self.code.read_u32(&mut ip));
                    let else_slot = BranchSlot(self.code.read_u32(&mut ip));
                    let cond = self.stack.pop()?;
                    let slot = if cond == TRUE { then_slot } else { else_slot };
                    ip = self.resolve_branch(slot)? as usize;
                }
                Opcode::Call => {
                    let num_args = self.code.read_u16(&mut ip) as usize;
                    let site = self.code.read_u32(&mut ip);
                    let ret_slot = BranchSlot(self.code.read_u32(&mut ip));
                    let pos = self.code.read_u32(&mut ip);
                    ip = self.call(num_args, site, ret_slot, pos)? as usize;
                }
                Opcode::Ret => {
                    let value = self.stack.pop()?;
                    match self.stack.pop_frame() {
                        None => return Ok(value),
                        Some(ret_slot) => {
                            self.stack.push(value)?;
                            ip = self.resolve_branch(ret_slot)? as usize;
                        }
                    }
                }

                Opcode::Import => {
                    let name = self.pop_str("import")?;
                    let name = self.str_value(name).to_string();
                    let pkg = self.imports.import(&name, &mut self.heap, &mut self.hosts)?;
                    self.stack.push(pkg)?;
                }
                Opcode::Abort => {
                    let pos = self.code.read_u32(&mut ip);
                    let message = self.pop_str("abort")?;
                    return Err(VmError::Aborted {
                        pos: self.pos_prefix(pos),
                        message: self.str_value(message).to_string(),
                    });
                }
            }
        }
    }

    /// Execute a `call` instruction; returns the address to continue at.
    fn call(
        &mut self,
        num_args: usize,
        site: u32,
        ret_slot: BranchSlot,
        pos: u32,
    ) -> Result<CodeAddr> {
        let callee = self.stack.pop()?;
        if self.stack.depth() < num_args {
            return Err(VmError::StackUnderflow("stack underflow at call"));
        }
        let mut args = (0..num_args)
            .map(|_| self.stack.pop())
            .collect::<Result<Vec<_>>>()?;
        args.reverse();

        match callee {
            Value::Object(fun) => {
                let info = function_info(&self.heap, self.compiler.call_site(site), fun)?;
                if num_args != info.num_params {
                    return Err(VmError::ArityMismatch {
                        pos: self.pos_prefix(pos),
                        received: num_args,
                        expected: info.num_params,
                    });
                }
                self.stack.push_frame(Some(ret_slot), info.num_locals)?;
                for (i, arg) in args.into_iter().enumerate() {
                    self.stack.set_local(i, arg)?;
                }
                self.stats.calls += 1;
                let version = self.versions.get_block_version(info.entry);
                self.ensure_compiled(version)
            }
            Value::HostFn(id) => {
                let host = self.hosts.get(id);
                if num_args != host.num_params() {
                    return Err(VmError::ArityMismatch {
                        pos: self.pos_prefix(pos),
                        received: num_args,
                        expected: host.num_params(),
                    });
                }
                let mut ctx = HostCtx {
                    heap: &mut self.heap,
                    output: &mut *self.output,
                };
                let result = host.call(&mut ctx, &args)?;
                self.stats.calls += 1;
                self.stack.push(result)?;
                self.resolve_branch(ret_slot)
            }
            _ => Err(VmError::InvalidCallee),
        }
    }

    /// Begin the execution of a function (top-level call).
    ///
    /// Missing trailing arguments leave their locals undefined. The stack is
    /// restored to its pre-call state whether the call succeeds or fails.
    pub fn call_fun(&mut self, fun: GcRef, args: &[Value]) -> Result<Value> {
        let mark = self.stack.mark();
        match self.call_fun_inner(fun, args) {
            Ok(value) => {
                assert_eq!(
                    self.stack.mark(),
                    mark,
                    "stack displaced by top-level call"
                );
                tracing::info!(
                    function = ?fun,
                    instructions = self.stats.instructions_executed,
                    "top-level call returned"
                );
                Ok(value)
            }
            Err(e) => {
                self.stack.restore(mark);
                Err(e)
            }
        }
    }

    fn call_fun_inner(&mut self, fun: GcRef, args: &[Value]) -> Result<Value> {
        let info = function_info(&self.heap, &self.entry_site, fun)?;
        if args.len() > info.num_params {
            return Err(VmError::ArityMismatch {
                pos: String::new(),
                received: args.len(),
                expected: info.num_params,
            });
        }

        self.stack.push_frame(None, info.num_locals)?;
        for (i, arg) in args.iter().enumerate() {
            self.stack.set_local(i, *arg)?;
        }
        self.stats.calls += 1;

        let version = self.get_block_version(info.entry);
        let start = self.ensure_compiled(version)?;
        self.exec_code(start)
    }

    /// Look up the function exported as `name` by a package object.
    pub fn export(&self, pkg: GcRef, name: &str) -> Result<GcRef> {
        let pkg_obj = self
            .heap
            .object(pkg)
            .ok_or_else(|| VmError::InvalidFunction("package is not an object".to_string()))?;
        let (value, _) = pkg_obj
            .get_field(name)
            .ok_or_else(|| VmError::MissingField(name.to_string()))?;
        value.as_object().ok_or_else(|| {
            VmError::InvalidFunction(format!(
                "export \"{}\" is a {}, not a function object",
                name,
                value.type_name()
            ))
        })
    }

    /// Entry block of a function object.
    pub fn function_entry(&self, fun: GcRef) -> Result<GcRef> {
        Ok(function_info(&self.heap, &self.entry_site, fun)?.entry)
    }

    /// Call a function exported by a package.
    pub fn call_export(&mut self, pkg: GcRef, name: &str, args: &[Value]) -> Result<Value> {
        let fun = self.export(pkg, name)?;
        self.call_fun(fun, args)
    }

    /// Load a program image into this VM's heap.
    pub fn load_image(&mut self, path: &Path) -> Result<GcRef> {
        let pkg = crate::image::load_image_file(path, &mut self.heap).map_err(VmError::Image)?;
        tracing::info!(
            path = %path.display(),
            objects = self.heap.object_count(),
            "loaded image"
        );
        Ok(pkg)
    }

    /// Load an image and call its `export` function without arguments.
    pub fn run_image(&mut self, path: &Path, export: &str) -> Result<Value> {
        let pkg = self.load_image(path)?;
        self.call_export(pkg, export, &[])
    }

    /// Render the compiled code of every block version.
    pub fn disassemble(&self) -> String {
        crate::vm::disasm::disassemble(self)
    }

    fn int_binop(&mut self, op: Opcode, f: impl FnOnce(i64, i64) -> Value) -> Result<()> {
        let arg1 = self.pop_int(op.name())?;
        let arg0 = self.pop_int(op.name())?;
        self.stack.push(f(arg0, arg1))
    }

    fn pop_int(&mut self, op: &'static str) -> Result<i64> {
        let value = self.stack.pop()?;
        value
            .as_int64()
            .ok_or_else(|| VmError::type_mismatch(op, "int64", value.type_name()))
    }

    fn pop_bool(&mut self, op: &'static str) -> Result<bool> {
        let value = self.stack.pop()?;
        value
            .as_bool()
            .ok_or_else(|| VmError::type_mismatch(op, "bool", value.type_name()))
    }

    fn pop_str(&mut self, op: &'static str) -> Result<GcRef> {
        let value = self.stack.pop()?;
        value
            .as_str()
            .ok_or_else(|| VmError::type_mismatch(op, "string", value.type_name()))
    }

    fn pop_object(&mut self, op: &'static str) -> Result<GcRef> {
        let value = self.stack.pop()?;
        value
            .as_object()
            .ok_or_else(|| VmError::type_mismatch(op, "object", value.type_name()))
    }

    fn pop_array(&mut self, op: &'static str) -> Result<GcRef> {
        let value = self.stack.pop()?;
        value
            .as_array()
            .ok_or_else(|| VmError::type_mismatch(op, "array", value.type_name()))
    }

    /// Pop an index and a string and return the index with the byte there.
    fn pop_char_byte(&mut self, op: &'static str) -> Result<(i64, u8)> {
        let idx = self.pop_int(op)?;
        let s = self.pop_str(op)?;
        let bytes = self.str_value(s).as_bytes();
        usize::try_from(idx)
            .ok()
            .and_then(|i| bytes.get(i).map(|&b| (idx, b)))
            .ok_or(VmError::IndexOutOfBounds {
                op,
                index: idx,
                len: bytes.len(),
            })
    }

    fn str_value(&self, r: GcRef) -> &str {
        self.heap
            .string(r)
            .unwrap_or_else(|| panic!("dangling string {:?}", r))
    }

    fn object(&self, r: GcRef) -> &crate::vm::heap::ZetaObject {
        self.heap
            .object(r)
            .unwrap_or_else(|| panic!("dangling object {:?}", r))
    }

    fn array(&self, r: GcRef) -> &crate::vm::heap::ZetaArray {
        self.heap
            .array(r)
            .unwrap_or_else(|| panic!("dangling array {:?}", r))
    }

    fn array_mut(&mut self, r: GcRef) -> &mut crate::vm::heap::ZetaArray {
        self.heap
            .array_mut(r)
            .unwrap_or_else(|| panic!("dangling array {:?}", r))
    }

    /// Error-message prefix for a source position operand.
    fn pos_prefix(&self, pos: u32) -> String {
        self.compiler
            .src_pos(pos)
            .map(|p| format!("{} - ", p))
            .unwrap_or_default()
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest capacity hint honored by `new_object`/`new_array`.
const MAX_CAPACITY_HINT: usize = 1 << 16;

fn capacity_hint(requested: i64) -> usize {
    usize::try_from(requested)
        .unwrap_or(0)
        .min(MAX_CAPACITY_HINT)
}

/// Read a function object's calling convention through `site`'s caches.
fn function_info(heap: &Heap, site: &CallSiteCache, fun: GcRef) -> Result<FunInfo> {
    if heap.object(fun).is_none() {
        return Err(VmError::InvalidFunction(format!(
            "{:?} is not a function object",
            fun
        )));
    }
    let count = |ic: &crate::vm::ic::FieldCache| -> Result<usize> {
        let value = ic
            .get(heap, fun)
            .map_err(|e| VmError::InvalidFunction(e.to_string()))?;
        value
            .as_int64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                VmError::InvalidFunction(format!(
                    "\"{}\" must be a non-negative int64, got {}",
                    ic.field(),
                    value.type_name()
                ))
            })
    };
    let num_params = count(&site.num_params)?;
    let num_locals = count(&site.num_locals)?;
    if num_params > num_locals {
        return Err(VmError::InvalidFunction(format!(
            "num_params ({}) exceeds num_locals ({})",
            num_params, num_locals
        )));
    }
    let entry = site
        .entry
        .get(heap, fun)
        .map_err(|e| VmError::InvalidFunction(e.to_string()))?;
    let entry = entry.as_object().ok_or_else(|| {
        VmError::InvalidFunction(format!("\"entry\" must be a block, got {}", entry.type_name()))
    })?;
    Ok(FunInfo {
        num_params,
        num_locals,
        entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Run a single-block `main` with two locals and return its result.
    fn run_instrs(instrs: serde_json::Value) -> (VM, Result<Value>) {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let image = json!({
            "main": { "num_params": 0, "num_locals": 2, "entry": { "instrs": instrs } }
        });
        let pkg = crate::image::load_image(&image, vm.heap_mut()).unwrap();
        let result = vm.call_export(pkg, "main", &[]);
        (vm, result)
    }

    fn run_ok(instrs: serde_json::Value) -> Value {
        let (_, result) = run_instrs(instrs);
        result.unwrap()
    }

    #[test]
    fn test_push_ret() {
        assert_eq!(
            run_ok(json!([{ "op": "push", "val": 777 }, { "op": "ret" }])),
            Value::Int64(777)
        );
    }

    #[test]
    fn test_arithmetic() {
        let result = run_ok(json!([
            { "op": "push", "val": 6 },
            { "op": "push", "val": 7 },
            { "op": "mul_i64" },
            { "op": "push", "val": 2 },
            { "op": "sub_i64" },
            { "op": "push", "val": 10 },
            { "op": "add_i64" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(50));
    }

    #[test]
    fn test_arithmetic_wraps() {
        let result = run_ok(json!([
            { "op": "push", "val": i64::MAX },
            { "op": "push", "val": 1 },
            { "op": "add_i64" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(i64::MIN));
    }

    #[test]
    fn test_comparisons() {
        for (op, expected) in [
            ("lt_i64", true),
            ("le_i64", true),
            ("gt_i64", false),
            ("ge_i64", false),
            ("eq_i64", false),
        ] {
            let result = run_ok(json!([
                { "op": "push", "val": 1 },
                { "op": "push", "val": 2 },
                { "op": op },
                { "op": "ret" }
            ]));
            assert_eq!(result, Value::Bool(expected), "{}", op);
        }
    }

    #[test]
    fn test_locals_and_swap() {
        let result = run_ok(json!([
            { "op": "push", "val": 1 },
            { "op": "push", "val": 2 },
            { "op": "swap" },
            { "op": "set_local", "idx": 1 },
            { "op": "pop" },
            { "op": "get_local", "idx": 1 },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(1));
    }

    #[test]
    fn test_invalid_local() {
        let (_, result) = run_instrs(json!([{ "op": "get_local", "idx": 2 }, { "op": "ret" }]));
        assert_eq!(
            result,
            Err(VmError::InvalidLocal {
                index: 2,
                num_locals: 2
            })
        );
    }

    #[test]
    fn test_string_ops() {
        let (vm, result) = run_instrs(json!([
            { "op": "push", "val": "foo" },
            { "op": "push", "val": "bar" },
            { "op": "str_cat" },
            { "op": "ret" }
        ]));
        let s = result.unwrap().as_str().unwrap();
        assert_eq!(vm.heap().string(s), Some("foobar"));

        let result = run_ok(json!([
            { "op": "push", "val": "abc" },
            { "op": "push", "val": 1 },
            { "op": "get_char_code" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(b'b' as i64));

        let result = run_ok(json!([
            { "op": "push", "val": "abc" },
            { "op": "push", "val": "abc" },
            { "op": "eq_str" },
            { "op": "ret" }
        ]));
        assert_eq!(result, TRUE);
    }

    #[test]
    fn test_get_char_is_shared() {
        let (_, result) = run_instrs(json!([
            { "op": "push", "val": "xyx" },
            { "op": "push", "val": 0 },
            { "op": "get_char" },
            { "op": "push", "val": "xyx" },
            { "op": "push", "val": 2 },
            { "op": "get_char" },
            { "op": "eq_obj" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Ok(TRUE));
    }

    #[test]
    fn test_get_char_out_of_bounds() {
        let (_, result) = run_instrs(json!([
            { "op": "push", "val": "ab" },
            { "op": "push", "val": 2 },
            { "op": "get_char" },
            { "op": "ret" }
        ]));
        assert_eq!(
            result,
            Err(VmError::IndexOutOfBounds {
                op: "get_char",
                index: 2,
                len: 2
            })
        );
    }

    #[test]
    fn test_get_char_on_multibyte_string() {
        let bytes = |idx: i64| {
            run_ok(json!([
                { "op": "push", "val": "é" },
                { "op": "push", "val": idx },
                { "op": "get_char_code" },
                { "op": "ret" }
            ]))
        };
        assert_eq!(bytes(0), Value::Int64(0xc3));
        assert_eq!(bytes(1), Value::Int64(0xa9));

        let result = run_ok(json!([
            { "op": "push", "val": "é" },
            { "op": "str_len" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(2));

        let (_, result) = run_instrs(json!([
            { "op": "push", "val": "aé" },
            { "op": "push", "val": 1 },
            { "op": "get_char" },
            { "op": "str_len" },
            { "op": "ret" }
        ]));
        assert_eq!(
            result,
            Err(VmError::NonAsciiChar {
                op: "get_char",
                index: 1,
                byte: 0xc3
            })
        );
        assert_eq!(
            result.unwrap_err().to_string(),
            "get_char, byte 0xc3 at index 1 is not a single-byte character"
        );

        let result = run_ok(json!([
            { "op": "push", "val": "aé" },
            { "op": "push", "val": 0 },
            { "op": "get_char" },
            { "op": "str_len" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(1));
    }

    #[test]
    fn test_object_ops() {
        let result = run_ok(json!([
            { "op": "push", "val": 4 },
            { "op": "new_object" },
            { "op": "set_local", "idx": 0 },
            { "op": "get_local", "idx": 0 },
            { "op": "push", "val": "x" },
            { "op": "push", "val": 5 },
            { "op": "set_field" },
            { "op": "get_local", "idx": 0 },
            { "op": "push", "val": "x" },
            { "op": "get_field" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(5));

        let (_, result) = run_instrs(json!([
            { "op": "push", "val": 0 },
            { "op": "new_object" },
            { "op": "push", "val": "y" },
            { "op": "get_field" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Err(VmError::MissingField("y".to_string())));

        let (_, result) = run_instrs(json!([
            { "op": "push", "val": 0 },
            { "op": "new_object" },
            { "op": "push", "val": "not valid" },
            { "op": "push", "val": 1 },
            { "op": "set_field" },
            { "op": "push", "val": 0 },
            { "op": "ret" }
        ]));
        assert_eq!(
            result,
            Err(VmError::InvalidIdentifier("not valid".to_string()))
        );
    }

    #[test]
    fn test_array_ops() {
        let result = run_ok(json!([
            { "op": "push", "val": 2 },
            { "op": "new_array" },
            { "op": "set_local", "idx": 0 },
            { "op": "get_local", "idx": 0 },
            { "op": "push", "val": 10 },
            { "op": "array_push" },
            { "op": "get_local", "idx": 0 },
            { "op": "push", "val": 0 },
            { "op": "push", "val": 11 },
            { "op": "set_elem" },
            { "op": "get_local", "idx": 0 },
            { "op": "push", "val": 0 },
            { "op": "get_elem" },
            { "op": "get_local", "idx": 0 },
            { "op": "array_len" },
            { "op": "add_i64" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Int64(12));
    }

    #[test]
    fn test_has_tag() {
        let result = run_ok(json!([
            { "op": "push", "val": "s" },
            { "op": "has_tag", "tag": "string" },
            { "op": "push", "val": null },
            { "op": "has_tag", "tag": "int64" },
            { "op": "eq_bool" },
            { "op": "ret" }
        ]));
        assert_eq!(result, Value::Bool(false));
    }

    #[test]
    fn test_type_mismatch() {
        let (_, result) = run_instrs(json!([
            { "op": "push", "val": "one" },
            { "op": "push", "val": 1 },
            { "op": "add_i64" },
            { "op": "ret" }
        ]));
        assert_eq!(
            result,
            Err(VmError::type_mismatch("add_i64", "int64", "string"))
        );
    }

    #[test]
    fn test_pop_empty_stack() {
        let (vm, result) = run_instrs(json!([{ "op": "pop" }, { "op": "ret" }]));
        assert!(matches!(result, Err(VmError::StackUnderflow(_))));
        assert_eq!(vm.stack().used(), 0);
    }

    #[test]
    fn test_abort_message() {
        let (_, result) = run_instrs(json!([
            { "op": "push", "val": "boom" },
            {
                "op": "abort",
                "src_pos": { "line_no": 4, "col_no": 2, "src_name": "t.pls" }
            }
        ]));
        assert_eq!(
            result.unwrap_err().to_string(),
            "t.pls@4:2 - aborting execution due to error: boom"
        );
    }

    #[test]
    fn test_host_call_via_registry() {
        fn double(_ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
            Ok(Value::Int64(args[0].as_int64().unwrap_or(0) * 2))
        }

        let mut vm = VM::with_output(Box::new(io::sink()));
        let f = vm.register_host_fn(HostFn::new("double", 1, double));
        let image = json!({
            "main": {
                "num_params": 1, "num_locals": 1,
                "entry": { "instrs": [
                    { "op": "push", "val": 21 },
                    { "op": "get_local", "idx": 0 },
                    { "op": "call", "num_args": 1, "ret_to": { "#id": "done", "instrs": [ { "op": "ret" } ] } }
                ] }
            }
        });
        let pkg = crate::image::load_image(&image, vm.heap_mut()).unwrap();
        assert_eq!(vm.call_export(pkg, "main", &[f]), Ok(Value::Int64(42)));
        assert_eq!(vm.stack().used(), 0);
    }

    #[test]
    fn test_call_passes_arguments_in_order() {
        fn sub(_ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
            Ok(Value::Int64(args[0].as_int64().unwrap_or(0) - args[1].as_int64().unwrap_or(0)))
        }

        let mut vm = VM::with_output(Box::new(io::sink()));
        let host_sub = vm.register_host_fn(HostFn::new("sub", 2, sub));
        let image = json!({
            "main": {
                "num_params": 1, "num_locals": 2,
                "entry": { "instrs": [
                    { "op": "push", "val": 10 },
                    { "op": "push", "val": 3 },
                    { "op": "get_local", "idx": 0 },
                    { "op": "call", "num_args": 2, "ret_to": { "instrs": [
                        { "op": "set_local", "idx": 1 },
                        { "op": "push", "val": 100 },
                        { "op": "push", "val": 1 },
                        { "op": "push", "val": { "@ref": "sub3" } },
                        { "op": "call", "num_args": 2, "ret_to": { "instrs": [
                            { "op": "get_local", "idx": 1 },
                            { "op": "add_i64" },
                            { "op": "ret" }
                        ] } }
                    ] } }
                ] }
            },
            "sub3": {
                "#id": "sub3",
                "num_params": 2, "num_locals": 2,
                "entry": { "instrs": [
                    { "op": "get_local", "idx": 0 },
                    { "op": "get_local", "idx": 1 },
                    { "op": "sub_i64" },
                    { "op": "ret" }
                ] }
            }
        });
        let pkg = crate::image::load_image(&image, vm.heap_mut()).unwrap();
        // (10 - 3) from the host function plus (100 - 1) from the bytecode one
        assert_eq!(vm.call_export(pkg, "main", &[host_sub]), Ok(Value::Int64(106)));
        assert_eq!(vm.stack().used(), 0);
    }

    #[test]
    fn test_compile_reachable() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let image = json!({
            "entry": {
                "instrs": [ {
                    "op": "if_true",
                    "then": { "#id": "a", "instrs": [ { "op": "jump", "to": { "@ref": "b" } } ] },
                    "else": { "#id": "b", "instrs": [ { "op": "ret" } ] }
                } ]
            }
        });
        let pkg = crate::image::load_image(&image, vm.heap_mut()).unwrap();
        let entry = vm.export(pkg, "entry").unwrap();
        assert_eq!(vm.compile_reachable(entry), Ok(3));
        assert_eq!(vm.compile_reachable(entry), Ok(0));
        assert_eq!(vm.versions().compiled_count(), 3);
        assert_eq!(vm.branches().resolved_count(), 0);
    }
}
