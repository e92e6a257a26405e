use super::rle::RLE;
use crate::vm::{instruction::OpCode, value::Value};

/// Append-only bytecode buffer with its constant pool and a line table
/// parallel to the byte array (one entry per byte, run-length encoded).
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: RLE<u64>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, op_code: OpCode, line: u64) {
        self.write_byte(op_code.into(), line);
    }

    pub fn write_byte(&mut self, byte: u8, line: u64) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_index(&mut self, op_code: OpCode, index: u8, line: u64) {
        self.write(op_code, line);
        self.write_byte(index, line);
    }

    /// Appends a constant and returns its index. The compiler is responsible
    /// for rejecting pools that outgrow the one-byte operand.
    pub fn add_constant(&mut self, constant: Value) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    pub fn line_of(&self, offset: usize) -> u64 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_lines_parallel_code() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Nil, 1);
        let index = chunk.add_constant(Value::Number(1.0));
        chunk.write_index(OpCode::Constant, index as u8, 2);
        chunk.write(OpCode::Return, 3);

        assert_eq!(chunk.code.len(), 4);
        assert_eq!(chunk.line_of(0), 1);
        assert_eq!(chunk.line_of(1), 2);
        assert_eq!(chunk.line_of(2), 2);
        assert_eq!(chunk.line_of(3), 3);
    }

    #[test]
    fn chunk_constant_indices() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.add_constant(Value::Number(1.0)), 0);
        assert_eq!(chunk.add_constant(Value::Number(2.0)), 1);
        assert_eq!(chunk.constants.len(), 2);
    }
}
