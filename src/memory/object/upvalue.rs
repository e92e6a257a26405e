use crate::vm::value::Value;

/// A variable captured by a closure. While the variable is live on the
/// stack the upvalue stays open and records its slot; when the slot is
/// about to disappear the value is hoisted into the upvalue and it closes.
/// Every closure capturing the same variable shares one upvalue object.
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Points at a live stack slot.
    Open(usize),

    /// Owns the value after the stack slot went away.
    Closed(Value),
}

impl Upvalue {
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }

    pub fn close(&mut self, value: Value) {
        *self = Upvalue::Closed(value);
    }
}
