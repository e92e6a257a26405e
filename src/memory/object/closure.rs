use super::{Function, Object};
use crate::memory::Gc;

/// A function paired with the upvalues it closed over. The upvalue vector
/// is filled in by the VM while executing the Closure instruction and ends
/// up exactly `upvalue_count` long.
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Gc<Object>,
    pub upvalues: Vec<Gc<Object>>,
}

impl Closure {
    /// Requires `function` to be a garbage collected function.
    pub fn new(function: Gc<Object>) -> Self {
        let upvalue_count = function.as_function().upvalue_count;
        Self {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }

    pub fn function(&self) -> &Function {
        self.function.as_function()
    }
}
