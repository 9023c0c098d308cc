//! Block compiler.
//!
//! Translates the instruction objects of one block into encoded opcodes
//! appended to the code heap. Branch targets are never compiled here: each
//! one becomes an unresolved [`BranchSlot`] naming the target's version, and
//! the dispatcher compiles the target the first time the branch is taken.

use super::codeheap::{CodeAddr, CodeHeap};
use super::error::{Result, VmError};
use super::heap::{GcRef, Heap};
use super::ic::{CallSiteCache, FieldCache};
use super::ops::{Opcode, NO_SRC_POS};
use super::value::Tag;
use super::version::{BranchSlot, BranchTable, VersionId, VersionTable};
use super::Value;

/// Mutable state a compilation appends to.
pub struct CodeSpace<'a> {
    pub code: &'a mut CodeHeap,
    pub versions: &'a mut VersionTable,
    pub branches: &'a mut BranchTable,
}

/// One instruction after validation, before encoding.
enum Instr {
    Plain(Opcode),
    Push(Value),
    Index(Opcode, u16),
    HasTag(Tag),
    Jump(GcRef),
    IfTrue(GcRef, GcRef),
    Call {
        num_args: u16,
        ret_to: GcRef,
        src_pos: Option<String>,
    },
    Abort(Option<String>),
}

pub struct Compiler {
    instrs: FieldCache,
    op: FieldCache,
    val: FieldCache,
    idx: FieldCache,
    tag: FieldCache,
    to: FieldCache,
    then_: FieldCache,
    else_: FieldCache,
    ret_to: FieldCache,
    num_args: FieldCache,
    src_pos: FieldCache,
    line_no: FieldCache,
    col_no: FieldCache,
    src_name: FieldCache,
    call_sites: Vec<CallSiteCache>,
    src_positions: Vec<String>,
    trace: bool,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            instrs: FieldCache::new("instrs"),
            op: FieldCache::new("op"),
            val: FieldCache::new("val"),
            idx: FieldCache::new("idx"),
            tag: FieldCache::new("tag"),
            to: FieldCache::new("to"),
            then_: FieldCache::new("then"),
            else_: FieldCache::new("else"),
            ret_to: FieldCache::new("ret_to"),
            num_args: FieldCache::new("num_args"),
            src_pos: FieldCache::new("src_pos"),
            line_no: FieldCache::new("line_no"),
            col_no: FieldCache::new("col_no"),
            src_name: FieldCache::new("src_name"),
            call_sites: Vec::new(),
            src_positions: Vec::new(),
            trace: false,
        }
    }

    /// Print every compiled block to stderr.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn call_site(&self, id: u32) -> &CallSiteCache {
        &self.call_sites[id as usize]
    }

    pub fn call_site_count(&self) -> usize {
        self.call_sites.len()
    }

    /// Source position recorded for a `call`/`abort`, formatted as
    /// `src_name@line_no:col_no`.
    pub fn src_pos(&self, id: u32) -> Option<&str> {
        if id == NO_SRC_POS {
            return None;
        }
        self.src_positions.get(id as usize).map(String::as_str)
    }

    /// Compile `version` and record its code range.
    ///
    /// The block is validated in full before anything is emitted, so a
    /// rejected block leaves the code heap and branch table untouched.
    pub fn compile(
        &mut self,
        version: VersionId,
        heap: &Heap,
        space: &mut CodeSpace<'_>,
    ) -> Result<(CodeAddr, CodeAddr)> {
        let block = space.versions.get(version).block;
        assert!(
            !space.versions.get(version).is_compiled(),
            "block version {} is already compiled",
            version.0
        );

        let instrs = self.decode_block(heap, block)?;

        let start = space.code.offset();
        for instr in &instrs {
            self.emit(instr, space);
        }
        let end = space.code.offset();
        space.versions.set_compiled(version, start, end);

        tracing::debug!(
            block = ?block,
            version = version.0,
            start,
            end,
            instrs = instrs.len(),
            "compiled block"
        );
        if self.trace {
            eprintln!(
                "[compile] block {:?} -> {}..{} ({} instrs)",
                block,
                start,
                end,
                instrs.len()
            );
        }
        Ok((start, end))
    }

    fn decode_block(&self, heap: &Heap, block: GcRef) -> Result<Vec<Instr>> {
        let instrs = self.instrs.get_array(heap, block)?;
        let elements = &heap
            .array(instrs)
            .unwrap_or_else(|| panic!("block {:?} has a dangling instrs array", block))
            .elements;

        if elements.is_empty() {
            return Err(VmError::MalformedBlock(
                "target basic block is empty".to_string(),
            ));
        }

        let mut out = Vec::with_capacity(elements.len());
        for (i, instr) in elements.iter().enumerate() {
            let instr = instr.as_object().ok_or_else(|| {
                VmError::MalformedBlock(format!(
                    "instruction {} is a {}, not an object",
                    i,
                    instr.type_name()
                ))
            })?;
            let op_name = self.op.get_str(heap, instr)?;
            let op = Opcode::from_name(op_name)
                .ok_or_else(|| VmError::UnhandledOpcode(op_name.to_string()))?;

            let is_last = i + 1 == elements.len();
            if op.is_terminator() && !is_last {
                return Err(VmError::MalformedBlock(format!(
                    "only the last instruction in a block can be a branch (\"{}\")",
                    op_name
                )));
            }
            if !op.is_terminator() && is_last {
                return Err(VmError::MalformedBlock(format!(
                    "block does not end in a branch (last instruction is \"{}\")",
                    op_name
                )));
            }

            out.push(self.decode_instr(heap, op, instr)?);
        }
        Ok(out)
    }

    fn decode_instr(&self, heap: &Heap, op: Opcode, instr: GcRef) -> Result<Instr> {
        Ok(match op {
            Opcode::Push => Instr::Push(self.val.get(heap, instr)?),
            Opcode::Dup | Opcode::GetLocal | Opcode::SetLocal => {
                let idx = self.idx.get_int64(heap, instr)?;
                let idx = u16::try_from(idx).map_err(|_| {
                    VmError::MalformedBlock(format!("{} index {} out of range", op.name(), idx))
                })?;
                Instr::Index(op, idx)
            }
            Opcode::HasTag => {
                let name = self.tag.get_str(heap, instr)?;
                let tag = Tag::from_name(name).ok_or_else(|| {
                    VmError::MalformedBlock(format!("unknown tag \"{}\" in has_tag", name))
                })?;
                Instr::HasTag(tag)
            }
            Opcode::Jump => Instr::Jump(self.to.get_object(heap, instr)?),
            Opcode::IfTrue => Instr::IfTrue(
                self.then_.get_object(heap, instr)?,
                self.else_.get_object(heap, instr)?,
            ),
            Opcode::Call => {
                let num_args = self.num_args.get_int64(heap, instr)?;
                let num_args = u16::try_from(num_args).map_err(|_| {
                    VmError::MalformedBlock(format!("invalid argument count {} in call", num_args))
                })?;
                Instr::Call {
                    num_args,
                    ret_to: self.ret_to.get_object(heap, instr)?,
                    src_pos: self.decode_src_pos(heap, instr)?,
                }
            }
            Opcode::Abort => Instr::Abort(self.decode_src_pos(heap, instr)?),
            _ => Instr::Plain(op),
        })
    }

    fn decode_src_pos(&self, heap: &Heap, instr: GcRef) -> Result<Option<String>> {
        let Some(pos) = self.src_pos.get_opt(heap, instr) else {
            return Ok(None);
        };
        let pos = pos.as_object().ok_or_else(|| {
            VmError::MalformedBlock(format!("src_pos is a {}, not an object", pos.type_name()))
        })?;
        let line_no = self.line_no.get_int64(heap, pos)?;
        let col_no = self.col_no.get_int64(heap, pos)?;
        let src_name = self.src_name.get_str(heap, pos)?;
        Ok(Some(format!("{}@{}:{}", src_name, line_no, col_no)))
    }

    fn emit(&mut self, instr: &Instr, space: &mut CodeSpace<'_>) {
        match instr {
            Instr::Plain(op) => space.code.emit_u16(*op as u16),
            Instr::Push(value) => {
                space.code.emit_u16(Opcode::Push as u16);
                space.code.emit_value(*value);
            }
            Instr::Index(op, idx) => {
                space.code.emit_u16(*op as u16);
                space.code.emit_u16(*idx);
            }
            Instr::HasTag(tag) => {
                space.code.emit_u16(Opcode::HasTag as u16);
                space.code.emit_u8(*tag as u8);
            }
            Instr::Jump(to) => {
                let slot = branch_to(space, *to);
                space.code.emit_u16(Opcode::Jump as u16);
                space.code.emit_u32(slot.0);
            }
            Instr::IfTrue(then_block, else_block) => {
                let then_slot = branch_to(space, *then_block);
                let else_slot = branch_to(space, *else_block);
                space.code.emit_u16(Opcode::IfTrue as u16);
                space.code.emit_u32(then_slot.0);
                space.code.emit_u32(else_slot.0);
            }
            Instr::Call {
                num_args,
                ret_to,
                src_pos,
            } => {
                let ret_slot = branch_to(space, *ret_to);
                let site = self.call_sites.len() as u32;
                self.call_sites.push(CallSiteCache::new());
                let pos = self.intern_src_pos(src_pos.as_deref());
                space.code.emit_u16(Opcode::Call as u16);
                space.code.emit_u16(*num_args);
                space.code.emit_u32(site);
                space.code.emit_u32(ret_slot.0);
                space.code.emit_u32(pos);
            }
            Instr::Abort(src_pos) => {
                let pos = self.intern_src_pos(src_pos.as_deref());
                space.code.emit_u16(Opcode::Abort as u16);
                space.code.emit_u32(pos);
            }
        }
    }

    fn intern_src_pos(&mut self, pos: Option<&str>) -> u32 {
        match pos {
            Some(pos) => {
                self.src_positions.push(pos.to_string());
                (self.src_positions.len() - 1) as u32
            }
            None => NO_SRC_POS,
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate an unresolved branch slot for `block`, creating its version
/// placeholder if it has none yet.
fn branch_to(space: &mut CodeSpace<'_>, block: GcRef) -> BranchSlot {
    let target = space.versions.get_block_version(block);
    space.branches.add(target)
}
