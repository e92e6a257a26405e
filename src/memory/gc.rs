use std::collections::HashMap;
use std::mem;

use colored::*;

use super::object::{
    BoundMethod, Class, Closure, Function, Instance, NativeFn, Object, Upvalue,
};
use super::{Gc, Traced};
use crate::compiler::FunctionState;
use crate::debug::{LOG_GC, STRESS_GC};
use crate::vm::{value::Value, CallFrame};

const DEFAULT_NEXT_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Tri-color mark and sweep garbage collector.
///
/// Objects start out white. Marking the roots turns directly reachable
/// objects gray (marked and queued on the gray list); tracing drains the
/// gray list, blackening each object while graying what it references.
/// Everything still white afterwards is swept.
///
/// The collector also owns the mutator state that makes up the root set:
/// the value stack, globals, call frames, open upvalues and the chain of
/// functions being compiled. Keeping those here means a collection
/// triggered from any allocation sees every root without callbacks.
pub struct GC {
    /// The VM's value stack.
    pub stack: Vec<Value>,

    /// Global variables by name.
    pub globals: HashMap<String, Value>,

    /// Call frames of the running VM.
    pub call_frames: Vec<CallFrame>,

    /// Functions currently being compiled, innermost last.
    pub functions: Vec<FunctionState>,

    /// Upvalues still pointing into the stack, sorted by ascending slot.
    pub open_upvalues: Vec<Gc<Object>>,

    /// All objects tracked by the collector, excluding strings.
    objects: Vec<Box<Traced<Object>>>,

    /// Interned strings keyed by their contents. The table holds the only
    /// owning reference but is treated as weak: entries are purged between
    /// mark and sweep when their string was not reached.
    interned_strings: HashMap<String, Box<Traced<Object>>>,

    /// Marked objects whose references have not been traced yet. Lives
    /// outside the managed heap.
    gray_list: Vec<Gc<Object>>,

    /// Total bytes accounted to live allocations.
    bytes_allocated: usize,

    /// Threshold that triggers the next collection.
    next_gc: usize,
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}

impl GC {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            globals: HashMap::new(),
            call_frames: Vec::new(),
            functions: Vec::new(),
            open_upvalues: Vec::new(),
            objects: Vec::new(),
            interned_strings: HashMap::new(),
            gray_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
        }
    }

    /// Interns a string, returning the existing object when one with the
    /// same contents is alive.
    pub fn track_string(&mut self, string: String) -> Gc<Object> {
        if let Some(existing) = self.interned_strings.get_mut(&string) {
            return Gc::new(&mut **existing);
        }

        self.on_track(mem::size_of::<String>() + string.len());
        let mut boxed = Box::new(Traced::new(Object::String(string.clone())));
        let object = Gc::new(&mut *boxed);
        self.interned_strings.insert(string, boxed);
        object
    }

    pub fn track_function(&mut self, function: Function) -> Gc<Object> {
        self.track(Object::Function(function))
    }

    pub fn track_native(&mut self, native_fn: NativeFn) -> Gc<Object> {
        self.track(Object::Native(native_fn))
    }

    pub fn track_closure(&mut self, closure: Closure) -> Gc<Object> {
        self.track(Object::Closure(closure))
    }

    pub fn track_upvalue(&mut self, upvalue: Upvalue) -> Gc<Object> {
        self.track(Object::Upvalue(upvalue))
    }

    pub fn track_class(&mut self, class: Class) -> Gc<Object> {
        self.track(Object::Class(class))
    }

    pub fn track_instance(&mut self, instance: Instance) -> Gc<Object> {
        self.track(Object::Instance(instance))
    }

    pub fn track_bound_method(&mut self, bound: BoundMethod) -> Gc<Object> {
        self.track(Object::BoundMethod(bound))
    }

    /// Number of live interned strings, exposed for heap introspection.
    pub fn interned_count(&self) -> usize {
        self.interned_strings.len()
    }

    /// Number of live non-string objects, exposed for heap introspection.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    fn track(&mut self, object: Object) -> Gc<Object> {
        // Collect before the new object exists so it cannot be swept while
        // it is still unreachable.
        self.on_track(object_size(&object));
        let mut boxed = Box::new(Traced::new(object));
        let tracked = Gc::new(&mut *boxed);
        self.objects.push(boxed);
        tracked
    }

    fn on_track(&mut self, allocated: usize) {
        if STRESS_GC {
            self.collect();
        }
        self.bytes_allocated += allocated;
        if self.bytes_allocated > self.next_gc {
            self.collect();
        }
    }

    /// Traces the full object graph from the roots and frees everything
    /// that could not be reached.
    pub(crate) fn collect(&mut self) {
        let before = self.bytes_allocated;
        if LOG_GC {
            println!("{}\tbegin", "[GC]".cyan());
        }

        self.mark_roots();
        self.trace_references();
        self.sweep();

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;

        if LOG_GC {
            println!(
                "{}\tcollected {} bytes ({} -> {}), next collection at {}",
                "[GC]".cyan(),
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn mark_roots(&mut self) {
        // Stack slots.
        let stack_objects: Vec<Gc<Object>> =
            self.stack.iter().filter_map(Value::as_object_opt).collect();
        self.mark_objects(stack_objects.into_iter());

        // Global values.
        let global_objects: Vec<Gc<Object>> = self
            .globals
            .values()
            .filter_map(Value::as_object_opt)
            .collect();
        self.mark_objects(global_objects.into_iter());

        // Closures of every active call frame.
        let frame_objects: Vec<Gc<Object>> =
            self.call_frames.iter().map(|frame| frame.closure).collect();
        self.mark_objects(frame_objects.into_iter());

        // Upvalues still pointing into the stack.
        let upvalue_objects = self.open_upvalues.clone();
        self.mark_objects(upvalue_objects.into_iter());

        // Functions being compiled: their names plus every constant emitted
        // so far. Constants holding finished inner functions are traced
        // further when they are blackened.
        let compiler_objects: Vec<Gc<Object>> = self
            .functions
            .iter()
            .flat_map(|state| {
                let name = state.function.name.into_iter();
                let constants = state
                    .function
                    .chunk
                    .constants
                    .iter()
                    .filter_map(Value::as_object_opt);
                name.chain(constants).collect::<Vec<_>>()
            })
            .collect();
        self.mark_objects(compiler_objects.into_iter());
    }

    /// Drains the gray list, blackening each object in turn.
    fn trace_references(&mut self) {
        while let Some(object) = self.gray_list.pop() {
            self.blacken(object);
        }
    }

    /// Marks the objects an already-marked object refers to.
    fn blacken(&mut self, object: Gc<Object>) {
        if LOG_GC {
            println!("{}\tblacken {}", "[GC]".cyan(), object.as_ref());
        }
        match object.as_ref() {
            Object::String(_) => {}
            Object::Native(native) => {
                self.mark_object(native.name);
            }
            Object::Function(function) => {
                if let Some(name) = function.name {
                    self.mark_object(name);
                }
                for constant in function.chunk.constants.iter() {
                    self.mark_value(constant);
                }
            }
            Object::Closure(closure) => {
                self.mark_object(closure.function);
                self.mark_objects(closure.upvalues.iter().copied());
            }
            Object::Upvalue(upvalue) => match upvalue {
                Upvalue::Closed(value) => self.mark_value(value),
                Upvalue::Open(_) => {}
            },
            Object::Class(class) => {
                self.mark_object(class.name);
                self.mark_objects(class.methods.values().copied());
            }
            Object::Instance(instance) => {
                self.mark_object(instance.class);
                for value in instance.fields.values() {
                    self.mark_value(value);
                }
            }
            Object::BoundMethod(bound) => {
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    fn mark_value(&mut self, value: &Value) {
        if let Some(object) = value.as_object_opt() {
            self.mark_object(object);
        }
    }

    /// Marks an object gray. Idempotent, so cycles terminate.
    fn mark_object(&mut self, object: Gc<Object>) {
        if !object.marked() {
            if LOG_GC {
                println!("{}\tmark {}", "[GC]".cyan(), object.as_ref());
            }
            object.mark();
            self.gray_list.push(object);
        }
    }

    fn mark_objects(&mut self, objects: impl Iterator<Item = Gc<Object>>) {
        objects.for_each(|object| self.mark_object(object));
    }

    /// Frees everything left white and clears the mark bits of the
    /// survivors for the next cycle.
    fn sweep(&mut self) {
        let mut freed = 0;

        // The interned string table is weak: purge entries whose string was
        // not reached before the strings themselves are dropped.
        self.interned_strings.retain(|_, traced| {
            if traced.marked() {
                traced.unmark();
                true
            } else {
                if LOG_GC {
                    println!("{}\tsweep string {}", "[GC]".cyan(), traced.data);
                }
                freed += object_size(&traced.data);
                false
            }
        });

        let mut i = 0;
        while i < self.objects.len() {
            if self.objects[i].marked() {
                self.objects[i].unmark();
                i += 1;
            } else {
                if LOG_GC {
                    println!("{}\tsweep {}", "[GC]".cyan(), self.objects[i].data);
                }
                let removed = self.objects.swap_remove(i);
                freed += object_size(&removed.data);
                // The swapped-in element still needs a look, so i stays.
            }
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
    }
}

fn object_size(object: &Object) -> usize {
    match object {
        Object::String(string) => mem::size_of::<String>() + string.len(),
        Object::Function(_) => mem::size_of::<Function>(),
        Object::Native(_) => mem::size_of::<NativeFn>(),
        Object::Closure(_) => mem::size_of::<Closure>(),
        Object::Upvalue(_) => mem::size_of::<Upvalue>(),
        Object::Class(_) => mem::size_of::<Class>(),
        Object::Instance(_) => mem::size_of::<Instance>(),
        Object::BoundMethod(_) => mem::size_of::<BoundMethod>(),
    }
}
