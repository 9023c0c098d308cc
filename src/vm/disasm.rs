//! Code heap disassembler.

use crate::vm::codeheap::CodeAddr;
use crate::vm::ops::Opcode;
use crate::vm::value::Tag;
use crate::vm::version::{BranchSlot, BranchTarget};
use crate::vm::{Value, VM};

/// Disassembler for compiled block versions.
pub struct Disassembler<'a> {
    vm: &'a VM,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(vm: &'a VM) -> Self {
        Self {
            vm,
            output: String::new(),
        }
    }

    /// Render every compiled version, in compilation order.
    pub fn disassemble(&mut self) -> &str {
        let mut compiled: Vec<_> = self
            .vm
            .versions()
            .iter()
            .filter_map(|(id, v)| v.range().map(|range| (id, v.block, range)))
            .collect();
        compiled.sort_by_key(|(_, _, (start, _))| *start);

        for (id, block, (start, end)) in compiled {
            self.output.push_str(&format!(
                "== Block {:?} (version {}, {}..{}) ==\n",
                block, id.0, start, end
            ));
            self.disassemble_range(start, end);
            self.output.push('\n');
        }
        &self.output
    }

    /// Render the instructions in `[start, end)`.
    pub fn disassemble_range(&mut self, start: CodeAddr, end: CodeAddr) -> &str {
        let mut ip = start as usize;
        while ip < end as usize {
            self.output.push_str(&format!("{:06}: ", ip));
            self.disassemble_instr(&mut ip);
            self.output.push('\n');
        }
        &self.output
    }

    fn disassemble_instr(&mut self, ip: &mut usize) {
        let vm = self.vm;
        let code = vm.code_heap();
        let raw = code.read_u16(ip);
        let Some(op) = Opcode::from_u16(raw) else {
            self.output.push_str(&format!("<invalid opcode {}>", raw));
            // Nothing after an unknown opcode can be decoded reliably.
            *ip = code.len();
            return;
        };
        self.output.push_str(op.name());

        match op {
            Opcode::Push => {
                let value = code.read_value(ip);
                self.output.push(' ');
                self.push_value(value);
            }
            Opcode::Dup | Opcode::GetLocal | Opcode::SetLocal => {
                self.output.push_str(&format!(" {}", code.read_u16(ip)));
            }
            Opcode::HasTag => {
                let raw = code.read_u8(ip);
                let name = Tag::from_u8(raw).map_or("<?>", Tag::name);
                self.output.push_str(&format!(" {}", name));
            }
            Opcode::Jump => {
                let slot = BranchSlot(code.read_u32(ip));
                self.push_branch(" ", slot);
            }
            Opcode::IfTrue => {
                let then_slot = BranchSlot(code.read_u32(ip));
                let else_slot = BranchSlot(code.read_u32(ip));
                self.push_branch(" ", then_slot);
                self.push_branch(", ", else_slot);
            }
            Opcode::Call => {
                let num_args = code.read_u16(ip);
                let site = code.read_u32(ip);
                let ret_slot = BranchSlot(code.read_u32(ip));
                let pos = code.read_u32(ip);
                self.output
                    .push_str(&format!(" {} (site {}), ret_to", num_args, site));
                self.push_branch(" ", ret_slot);
                self.push_pos(pos);
            }
            Opcode::Abort => {
                let pos = code.read_u32(ip);
                self.push_pos(pos);
            }
            _ => {}
        }
    }

    fn push_value(&mut self, value: Value) {
        match value {
            Value::Str(r) => {
                let s = self.vm.heap().string(r).unwrap_or("<?>");
                let escaped = s.replace('\n', "\\n").replace('\t', "\\t");
                self.output.push_str(&format!("\"{}\"", escaped));
            }
            Value::Array(_) | Value::Object(_) => {
                self.output.push_str(&format!("{:?}", value));
            }
            other => self.output.push_str(&self.vm.heap().display(other)),
        }
    }

    fn push_branch(&mut self, sep: &str, slot: BranchSlot) {
        let target = match self.vm.branches().get(slot) {
            BranchTarget::Resolved(addr) => format!("@{}", addr),
            BranchTarget::Unresolved(version) => format!("stub(version {})", version.0),
        };
        self.output
            .push_str(&format!("{}[slot {}] {}", sep, slot.0, target));
    }

    fn push_pos(&mut self, pos: u32) {
        if let Some(pos) = self.vm.compiler().src_pos(pos) {
            self.output.push_str(&format!(" ; {}", pos));
        }
    }
}

/// Render every compiled block of `vm`.
pub fn disassemble(vm: &VM) -> String {
    Disassembler::new(vm).disassemble().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disassemble_shows_stub_then_resolution() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        let image = json!({
            "main": {
                "num_params": 0, "num_locals": 0,
                "entry": { "instrs": [
                    { "op": "push", "val": "hi" },
                    { "op": "pop" },
                    { "op": "jump", "to": { "instrs": [
                        { "op": "push", "val": 7 },
                        { "op": "ret" }
                    ] } }
                ] }
            }
        });
        let pkg = crate::image::load_image(&image, vm.heap_mut()).unwrap();
        let main = vm.export(pkg, "main").unwrap();
        let entry = vm.function_entry(main).unwrap();
        vm.compile_block(entry).unwrap();

        let before = disassemble(&vm);
        assert!(before.contains("push \"hi\""));
        assert!(before.contains("jump [slot 0] stub(version 1)"));

        assert_eq!(vm.call_fun(main, &[]), Ok(Value::Int64(7)));
        let after = disassemble(&vm);
        assert!(after.contains("jump [slot 0] @"));
        assert!(after.contains("push 7"));
        assert!(after.contains("ret"));
    }
}
