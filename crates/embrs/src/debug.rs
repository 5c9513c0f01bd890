//! Bytecode disassembler.
//!
//! Renders a compiled function (and, recursively, every function in its
//! constant pool) opcode by opcode. Enabled through the runtime's
//! `dump_bytecode` flag; the output format follows the classic
//! offset/line/opcode/operand layout.

use std::fmt::Write;

use crate::bytecode::{Blob, Opcode};
use crate::heap::{Heap, Obj, ObjRef};
use crate::value::{echo_value, Value};

/// Disassemble `function` and every function nested in its constants.
pub fn disassemble(heap: &Heap, function: ObjRef) -> String {
    let mut out = String::new();
    disassemble_function(heap, function, &mut out);
    out
}

fn disassemble_function(heap: &Heap, function: ObjRef, out: &mut String) {
    let f = heap.function(function);
    let name = match f.name {
        Some(name) => heap.str_text(name).to_string(),
        None => "<script>".to_string(),
    };
    let _ = writeln!(out, "== {} ==", name);

    let mut offset = 0;
    while offset < f.blob.code.len() {
        offset = disassemble_instruction(heap, &f.blob, offset, out);
    }

    for constant in &f.blob.constants {
        if let Some(r) = constant.as_obj() {
            if matches!(heap.get(r), Obj::Function(_)) {
                let _ = writeln!(out);
                disassemble_function(heap, r, out);
            }
        }
    }
}

/// Decode one instruction, append its rendering, and return the offset of
/// the next instruction.
pub fn disassemble_instruction(heap: &Heap, blob: &Blob, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && blob.line_at(offset) == blob.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", blob.line_at(offset));
    }

    let Some(op) = Opcode::from_byte(blob.code[offset]) else {
        let _ = writeln!(out, "unknown opcode {:#x}", blob.code[offset]);
        return offset + 1;
    };

    use Opcode::*;
    match op {
        Constant | DefineGlobal | GetGlobal | SetGlobal | GetProperty | GetSelfProperty
        | SetProperty | Class | GetSuper | Method | CallImport | NativeModule | SelectImport
        | SelectNativeImport | EjectImport | EjectNativeImport | Switch => {
            let index = blob.read_u16(offset + 1);
            let constant = constant_at(blob, index);
            let _ = writeln!(out, "{:<18} {:4} {}", name_of(op), index, render(heap, constant));
            offset + 3
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | PopN | List | Dict => {
            let operand = blob.read_u16(offset + 1);
            let _ = writeln!(out, "{:<18} {:4}", name_of(op), operand);
            offset + 3
        }
        Jump | JumpIfFalse | BreakPlaceholder => {
            let jump = blob.read_u16(offset + 1) as usize;
            let _ = writeln!(out, "{:<18} {:4} -> {}", name_of(op), offset, offset + 3 + jump);
            offset + 3
        }
        Loop => {
            let jump = blob.read_u16(offset + 1) as usize;
            let _ = writeln!(out, "{:<18} {:4} -> {}", name_of(op), offset, offset + 3 - jump);
            offset + 3
        }
        Call | SuperInvokeSelf | GetIndex | GetRangedIndex => {
            let operand = blob.code[offset + 1];
            let _ = writeln!(out, "{:<18} {:4}", name_of(op), operand);
            offset + 2
        }
        Invoke | InvokeSelf | SuperInvoke => {
            let index = blob.read_u16(offset + 1);
            let argc = blob.code[offset + 3];
            let constant = constant_at(blob, index);
            let _ = writeln!(
                out,
                "{:<18} ({} args) {:4} {}",
                name_of(op),
                argc,
                index,
                render(heap, constant)
            );
            offset + 4
        }
        ClassProperty => {
            let index = blob.read_u16(offset + 1);
            let is_static = blob.code[offset + 3];
            let constant = constant_at(blob, index);
            let _ = writeln!(
                out,
                "{:<18} {:4} {} ({})",
                name_of(op),
                index,
                render(heap, constant),
                if is_static == 1 { "static" } else { "instance" }
            );
            offset + 4
        }
        Try => {
            let type_const = blob.read_u16(offset + 1);
            let handler = blob.read_u16(offset + 3);
            let finally = blob.read_u16(offset + 5);
            let constant = constant_at(blob, type_const);
            let _ = writeln!(
                out,
                "{:<18} {} handler {} finally {}",
                name_of(op),
                render(heap, constant),
                handler,
                finally
            );
            offset + 7
        }
        Closure => {
            let index = blob.read_u16(offset + 1);
            let constant = constant_at(blob, index);
            let _ = writeln!(out, "{:<18} {:4} {}", name_of(op), index, render(heap, constant));
            let mut next = offset + 3;
            let upvalue_count = constant
                .as_obj()
                .map(|r| heap.function(r).upvalue_count)
                .unwrap_or(0);
            for _ in 0..upvalue_count {
                let is_local = blob.code[next];
                let slot = blob.read_u16(next + 1);
                let _ = writeln!(
                    out,
                    "{:04}    |   {} {}",
                    next,
                    if is_local == 1 { "local" } else { "upvalue" },
                    slot
                );
                next += 3;
            }
            next
        }
        _ => {
            let _ = writeln!(out, "{}", name_of(op));
            offset + 1
        }
    }
}

fn constant_at(blob: &Blob, index: u16) -> Value {
    blob.constants.get(index as usize).copied().unwrap_or(Value::Nil)
}

fn render(heap: &Heap, value: Value) -> String {
    echo_value(heap, value)
}

fn name_of(op: Opcode) -> String {
    format!("{:?}", op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions};
    use crate::heap::ModuleObj;
    use crate::table::Table;

    #[test]
    fn disassembles_a_simple_script() {
        let mut heap = Heap::new();
        let module = heap.alloc(Obj::Module(ModuleObj {
            name: "<test>".to_string(),
            file: "<test>".to_string(),
            values: Table::new(),
            preloader: None,
            unloader: None,
            imported: false,
        }));
        let function =
            compile(&mut heap, "var a = 1 + 2\necho a\n", module, &CompileOptions::default())
                .unwrap();
        let listing = disassemble(&heap, function);
        assert!(listing.contains("== <script> =="));
        assert!(listing.contains("Constant"));
        assert!(listing.contains("Add"));
        assert!(listing.contains("Echo"));
        assert!(listing.contains("Return"));
    }
}
