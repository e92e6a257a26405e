mod gc;
mod object;
mod ptr;
mod trace;

pub use gc::GC;
pub use object::{
    BoundMethod, Class, Closure, Function, Instance, NativeFn, NativeFunction, Object, Upvalue,
};
pub use ptr::Gc;

use trace::Traced;
