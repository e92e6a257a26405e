//! Compile-time switches for the interpreter's diagnostic output, plus the
//! bytecode disassembler that feeds them.

use crate::compiler::chunk::Chunk;
use crate::memory::Object;
use crate::vm::instruction::OpCode;
use crate::vm::value::Value;

/// Dump every chunk once it has been compiled.
pub const LOG_COMPILED_CODE: bool = false;
/// Log parser and emitter steps while compiling.
pub const LOG_COMPILER: bool = false;
/// Log every instruction as it executes.
pub const TRACE_EXECUTION_INSTR: bool = false;
/// Log the value stack before every instruction.
pub const TRACE_EXECUTION_STACK: bool = false;
/// Log collection cycles and swept objects.
pub const LOG_GC: bool = false;
/// Log object allocation and destruction.
pub const LOG_OBJECT: bool = false;
/// Collect on every allocation instead of waiting for the threshold.
pub const STRESS_GC: bool = false;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        let line = if offset > 0 && chunk.line_of(offset) == chunk.line_of(offset - 1) {
            "   |".to_owned()
        } else {
            format!("{:4}", chunk.line_of(offset))
        };

        let (text, width) = disassemble_instruction(chunk, offset);
        println!("{:04} {} {}", offset, line, text);
        offset += width;
    }
}

/// Decodes the instruction at `offset`, returning its rendering and the
/// number of bytes it occupies.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let op_code = match chunk.code.get(offset) {
        Some(byte) => OpCode::from(*byte),
        None => return ("<end of chunk>".to_owned(), 1),
    };

    match op_code {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Inherit
        | OpCode::Return => (op_code.name().to_owned(), 1),

        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => (constant_text(chunk, op_code, offset), 2),

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let operand = chunk.code.get(offset + 1).copied().unwrap_or(0);
            (format!("{:<16} {}", op_code.name(), operand), 2)
        }

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let hi = chunk.code.get(offset + 1).copied().unwrap_or(0) as usize;
            let lo = chunk.code.get(offset + 2).copied().unwrap_or(0) as usize;
            let jump = hi << 8 | lo;
            let target = if op_code == OpCode::Loop {
                offset + 3 - jump
            } else {
                offset + 3 + jump
            };
            (
                format!("{:<16} {} -> {}", op_code.name(), offset, target),
                3,
            )
        }

        OpCode::Invoke | OpCode::SuperInvoke => {
            let arg_count = chunk.code.get(offset + 2).copied().unwrap_or(0);
            (
                format!("{} ({} args)", constant_text(chunk, op_code, offset), arg_count),
                3,
            )
        }

        OpCode::Closure => {
            let index = chunk.code.get(offset + 1).copied().unwrap_or(0) as usize;
            let mut width = 2;
            let mut text = match chunk.constants.get(index) {
                Some(constant) => format!("{:<16} {} {}", op_code.name(), index, constant),
                None => format!("{:<16} {} <bad constant>", op_code.name(), index),
            };

            // The operand pairs that follow describe the captured upvalues.
            if let Some(Value::Object(object)) = chunk.constants.get(index) {
                if let Object::Function(function) = object.as_ref() {
                    for _ in 0..function.upvalue_count {
                        let is_local = chunk.code.get(offset + width).copied().unwrap_or(0);
                        let slot = chunk.code.get(offset + width + 1).copied().unwrap_or(0);
                        let kind = if is_local == 1 { "local" } else { "upvalue" };
                        text.push_str(&format!(" ({} {})", kind, slot));
                        width += 2;
                    }
                }
            }
            (text, width)
        }
    }
}

fn constant_text(chunk: &Chunk, op_code: OpCode, offset: usize) -> String {
    let index = chunk.code.get(offset + 1).copied();
    match index.and_then(|index| chunk.constants.get(index as usize)) {
        Some(constant) => format!("{:<16} {} '{}'", op_code.name(), index.unwrap_or(0), constant),
        None => format!("{:<16} <bad constant>", op_code.name()),
    }
}
