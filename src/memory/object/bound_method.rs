use super::Object;
use crate::memory::Gc;
use crate::vm::value::Value;

/// A method closure pinned to the receiver it was accessed through, so the
/// pair can be passed around and called like a plain closure later.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Gc<Object>,
}

impl BoundMethod {
    /// Requires `method` to be a garbage collected closure.
    pub fn new(receiver: Value, method: Gc<Object>) -> Self {
        Self { receiver, method }
    }
}
