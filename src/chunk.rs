use std::io::{self, Write};

use crate::{Heap, OpCode, Position, Value};

/// A chunk holds a sequence of instructions to be executed and their data.
///
/// Instructions and source positions are parallel arrays so the virtual
/// machine can report where a fault happened without paying for the position
/// on the happy path.
#[derive(Default, Debug)]
pub struct Chunk {
    instructions: Vec<OpCode>,
    constants: Vec<Value>,
    positions: Vec<Position>,
}

impl Chunk {
    /// Add a new instruction to the chunk.
    pub fn write_instruction(&mut self, code: OpCode, pos: Position) {
        self.instructions.push(code);
        self.positions.push(pos);
    }

    /// Read the instruction at the index.
    pub fn read_instruction(&self, idx: usize) -> (&OpCode, &Position) {
        (&self.instructions[idx], &self.positions[idx])
    }

    /// Return the number of written instructions.
    pub fn instructions_count(&self) -> usize {
        self.instructions.len()
    }

    /// Replace the placeholder offset at the given jump instruction.
    pub fn patch_jump_instruction(&mut self, jump: usize, offset: u16) {
        match self.instructions[jump] {
            OpCode::Jump(ref mut placeholder) | OpCode::JumpIfFalse(ref mut placeholder) => {
                *placeholder = offset;
            }
            _ => unreachable!("Only jumps can be patched."),
        }
    }

    /// Add a constant value to the chunk and return its position in the pool.
    pub fn write_const(&mut self, val: Value) -> usize {
        self.constants.push(val);
        self.constants.len() - 1
    }

    /// Read the constant at the given index.
    pub fn read_const(&self, idx: u8) -> Value {
        self.constants[idx as usize]
    }

    /// Get the number of constants stored in the chunk.
    pub fn const_count(&self) -> usize {
        self.constants.len()
    }

    /// All constants in the pool, in insertion order.
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Bytes owned by this chunk's storage, for the allocator's accounting.
    pub(crate) fn heap_size(&self) -> usize {
        self.instructions.capacity() * std::mem::size_of::<OpCode>()
            + self.constants.capacity() * std::mem::size_of::<Value>()
            + self.positions.capacity() * std::mem::size_of::<Position>()
    }

    /// Go through the instructions in the chunk and write them out in
    /// human-readable format.
    pub fn disassemble<W: Write>(&self, name: &str, heap: &Heap, w: &mut W) -> io::Result<()> {
        writeln!(w, "== {} ==", name)?;
        for i in 0..self.instructions.len() {
            self.disassemble_instruction(i, heap, w)?;
        }
        Ok(())
    }

    /// Write a single instruction in human-readable format.
    pub fn disassemble_instruction<W: Write>(
        &self,
        idx: usize,
        heap: &Heap,
        w: &mut W,
    ) -> io::Result<()> {
        write!(w, "{:04} ", idx)?;
        if idx > 0 && self.positions[idx].line == self.positions[idx - 1].line {
            write!(w, "   | ")?;
        } else {
            write!(w, "{:4} ", self.positions[idx].line)?;
        }

        let constant_instruction = |w: &mut W, op_repr: &str, const_id: u8| {
            writeln!(
                w,
                "{:-16} {:4} '{}'",
                op_repr,
                const_id,
                self.read_const(const_id).show(heap)
            )
        };
        let byte_instruction =
            |w: &mut W, op_repr: &str, slot: u8| writeln!(w, "{:-16} {:4}", op_repr, slot);
        // +1 since the instruction pointer is increased right after we read an
        // opcode
        let jump_instruction = |w: &mut W, op_repr: &str, offset: u16, fwd: bool| {
            let jump_target = if fwd {
                idx + 1 + offset as usize
            } else {
                idx + 1 - offset as usize
            };
            writeln!(w, "{:-16} {:4} -> {}", op_repr, idx, jump_target)
        };

        match &self.instructions[idx] {
            OpCode::Constant(id) => constant_instruction(w, "OP_CONSTANT", *id),
            OpCode::Nil => writeln!(w, "OP_NIL"),
            OpCode::True => writeln!(w, "OP_TRUE"),
            OpCode::False => writeln!(w, "OP_FALSE"),
            OpCode::Pop => writeln!(w, "OP_POP"),
            OpCode::GetLocal(slot) => byte_instruction(w, "OP_GET_LOCAL", *slot),
            OpCode::SetLocal(slot) => byte_instruction(w, "OP_SET_LOCAL", *slot),
            OpCode::GetGlobal(id) => constant_instruction(w, "OP_GET_GLOBAL", *id),
            OpCode::DefineGlobal(id) => constant_instruction(w, "OP_DEFINE_GLOBAL", *id),
            OpCode::SetGlobal(id) => constant_instruction(w, "OP_SET_GLOBAL", *id),
            OpCode::GetUpvalue(slot) => byte_instruction(w, "OP_GET_UPVALUE", *slot),
            OpCode::SetUpvalue(slot) => byte_instruction(w, "OP_SET_UPVALUE", *slot),
            OpCode::GetProperty(id) => constant_instruction(w, "OP_GET_PROPERTY", *id),
            OpCode::SetProperty(id) => constant_instruction(w, "OP_SET_PROPERTY", *id),
            OpCode::Equal => writeln!(w, "OP_EQUAL"),
            OpCode::Greater => writeln!(w, "OP_GREATER"),
            OpCode::Less => writeln!(w, "OP_LESS"),
            OpCode::Add => writeln!(w, "OP_ADD"),
            OpCode::Subtract => writeln!(w, "OP_SUBTRACT"),
            OpCode::Multiply => writeln!(w, "OP_MULTIPLY"),
            OpCode::Divide => writeln!(w, "OP_DIVIDE"),
            OpCode::Not => writeln!(w, "OP_NOT"),
            OpCode::Negate => writeln!(w, "OP_NEGATE"),
            OpCode::Print => writeln!(w, "OP_PRINT"),
            OpCode::Jump(offset) => jump_instruction(w, "OP_JUMP", *offset, true),
            OpCode::JumpIfFalse(offset) => jump_instruction(w, "OP_JUMP_IF_FALSE", *offset, true),
            OpCode::Loop(offset) => jump_instruction(w, "OP_LOOP", *offset, false),
            OpCode::Call(argc) => byte_instruction(w, "OP_CALL", *argc),
            OpCode::Closure(id, upvalues) => {
                let value = self.read_const(*id);
                writeln!(w, "{:-16} {:4} {}", "OP_CLOSURE", id, value.show(heap))?;
                for upvalue in upvalues {
                    writeln!(
                        w,
                        "{:04}      |                     {} {}",
                        idx,
                        if upvalue.is_local { "local" } else { "upvalue" },
                        upvalue.index,
                    )?;
                }
                Ok(())
            }
            OpCode::CloseUpvalue => writeln!(w, "OP_CLOSE_UPVALUE"),
            OpCode::Return => writeln!(w, "OP_RETURN"),
            OpCode::Class(id) => constant_instruction(w, "OP_CLASS", *id),
            OpCode::Method(id) => constant_instruction(w, "OP_METHOD", *id),
        }
    }
}
