use std::io::{self, Write};

use colored::*;

use super::{instruction::OpCode, value::Value, CallFrame, Result, VMError};
use crate::compiler::Compiler;
use crate::debug::{self, TRACE_EXECUTION_INSTR, TRACE_EXECUTION_STACK};
use crate::memory::{
    BoundMethod, Class, Closure, Gc, Instance, NativeFn, NativeFunction, Object, Upvalue, GC,
};

/// Call depth limit; blowing it is the "Stack overflow." runtime error.
const FRAMES_MAX: usize = 64;

/// Stack based bytecode interpreter. All mutable run-time state (value
/// stack, frames, globals, heap) lives in the `GC` context so that a
/// collection triggered mid-instruction sees every root; the VM itself
/// only holds the output sink `print` writes to.
pub struct VM<'a> {
    gc: &'a mut GC,
    out: Box<dyn Write + 'a>,
}

impl<'a> VM<'a> {
    pub fn new(gc: &'a mut GC) -> Self {
        Self::with_output(gc, Box::new(io::stdout()))
    }

    /// A VM writing `print` output into `out`; tests use this to assert on
    /// program output.
    pub fn with_output(gc: &'a mut GC, out: Box<dyn Write + 'a>) -> Self {
        let mut vm = Self { gc, out };
        vm.define_native("clock", native_clock);
        vm
    }

    /// Compiles and runs `source`. Globals survive across calls, which is
    /// what makes the REPL work.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let function = {
            let compiler = Compiler::new(source, self.gc);
            compiler.compile()?
        };
        self.interpret_function(function)
    }

    /// Runs an already compiled script function.
    pub fn interpret_function(&mut self, function: Gc<Object>) -> Result<()> {
        // Keep the function reachable while the closure is allocated.
        self.gc.stack.push(function.into());
        let closure = self.gc.track_closure(Closure::new(function));
        self.gc.stack.pop();
        self.gc.stack.push(closure.into());

        let result = self
            .call_value(closure.into(), 0)
            .and_then(|_| self.run());

        if let Err(err) = result {
            eprintln!("{}", err);
            self.print_stack_trace();
            self.reset_stack();
            return Err(err);
        }
        Ok(())
    }

    fn define_native(&mut self, name: &str, native_fn: NativeFunction) {
        let name_obj = self.gc.track_string(name.to_owned());
        self.gc.stack.push(name_obj.into()); // Reachable across the next allocation.
        let native = self.gc.track_native(NativeFn::new(name_obj, native_fn));
        self.gc.stack.push(native.into());
        self.gc.globals.insert(name.to_owned(), native.into());
        self.gc.stack.pop();
        self.gc.stack.pop();
    }

    fn run(&mut self) -> Result<()> {
        loop {
            if TRACE_EXECUTION_STACK || TRACE_EXECUTION_INSTR {
                self.trace_execution();
            }

            let instruction = OpCode::from(self.read_byte()?);
            match instruction {
                OpCode::Return => {
                    let result = self.pop()?;
                    let stack_base = self.frame()?.stack_base;
                    self.close_upvalues(stack_base);

                    self.gc.call_frames.pop();
                    if self.gc.call_frames.is_empty() {
                        // Pop the script closure itself and finish.
                        self.gc.stack.pop();
                        return Ok(());
                    }

                    self.gc.stack.truncate(stack_base);
                    self.push(result);
                }
                OpCode::Constant => {
                    let constant = self.read_constant()?;
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let index = self.frame()?.stack_base + slot;
                    let value = self
                        .gc
                        .stack
                        .get(index)
                        .cloned()
                        .ok_or(VMError::InvalidBytecode)?;
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let index = self.frame()?.stack_base + slot;
                    let value = self.peek(0)?.clone();
                    self.gc.stack[index] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant()?;
                    let value = match self.gc.globals.get(name.as_string()) {
                        Some(value) => value.clone(),
                        None => {
                            return Err(VMError::UndefinedVariable(name.as_string().clone()))
                        }
                    };
                    self.push(value);
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant()?;
                    let value = self.peek(0)?.clone();
                    self.gc.globals.insert(name.as_string().clone(), value);
                    self.pop()?;
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant()?;
                    let key = name.as_string().clone();
                    if !self.gc.globals.contains_key(&key) {
                        return Err(VMError::UndefinedVariable(key));
                    }
                    let value = self.peek(0)?.clone();
                    self.gc.globals.insert(key, value);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let closure = self.frame()?.closure;
                    let upvalue = closure
                        .as_closure()
                        .upvalues
                        .get(slot)
                        .copied()
                        .ok_or(VMError::InvalidBytecode)?;
                    let value = match upvalue.as_upvalue() {
                        Upvalue::Open(stack_slot) => self
                            .gc
                            .stack
                            .get(*stack_slot)
                            .cloned()
                            .ok_or(VMError::InvalidBytecode)?,
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let value = self.peek(0)?.clone();
                    let closure = self.frame()?.closure;
                    let mut upvalue = closure
                        .as_closure()
                        .upvalues
                        .get(slot)
                        .copied()
                        .ok_or(VMError::InvalidBytecode)?;
                    match upvalue.as_upvalue_mut() {
                        Upvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.gc.stack[stack_slot] = value;
                        }
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::GetProperty => {
                    let receiver = self.peek(0)?.clone();
                    let instance_obj = match receiver.as_object_opt() {
                        Some(object) if matches!(object.as_ref(), Object::Instance(_)) => object,
                        _ => return Err(VMError::OnlyInstancesHaveProperties),
                    };
                    let name_obj = self.read_string_constant()?;
                    let name = name_obj.as_string();

                    if let Some(value) = instance_obj.as_instance().fields.get(name) {
                        let value = value.clone();
                        self.pop()?; // Receiver.
                        self.push(value);
                    } else {
                        let class = instance_obj.as_instance().class;
                        let method = class
                            .as_class()
                            .methods
                            .get(name)
                            .copied()
                            .ok_or_else(|| VMError::UndefinedProperty(name.clone()))?;
                        // The receiver stays on the stack while the bound
                        // method is allocated.
                        let bound = self
                            .gc
                            .track_bound_method(BoundMethod::new(receiver, method));
                        self.pop()?; // Receiver.
                        self.push(bound.into());
                    }
                }
                OpCode::SetProperty => {
                    let receiver = self.peek(1)?.clone();
                    let mut instance_obj = match receiver.as_object_opt() {
                        Some(object) if matches!(object.as_ref(), Object::Instance(_)) => object,
                        _ => return Err(VMError::OnlyInstancesHaveFields),
                    };
                    let name_obj = self.read_string_constant()?;

                    let value = self.peek(0)?.clone();
                    instance_obj
                        .as_instance_mut()
                        .fields
                        .insert(name_obj.as_string().clone(), value);

                    let value = self.pop()?;
                    self.pop()?; // Receiver.
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name_obj = self.read_string_constant()?;
                    // The compiler guarantees a class in the hidden local.
                    let superclass = self.pop()?.as_object();
                    let method = superclass
                        .as_class()
                        .methods
                        .get(name_obj.as_string())
                        .copied()
                        .ok_or_else(|| {
                            VMError::UndefinedProperty(name_obj.as_string().clone())
                        })?;

                    let receiver = self.peek(0)?.clone();
                    let bound = self
                        .gc
                        .track_bound_method(BoundMethod::new(receiver, method));
                    self.pop()?; // Receiver.
                    self.push(bound.into());
                }
                OpCode::Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.push(Value::Bool(lhs.equals(&rhs)));
                }
                OpCode::Greater => self.comparison(|lhs, rhs| lhs > rhs)?,
                OpCode::Less => self.comparison(|lhs, rhs| lhs < rhs)?,
                OpCode::Add => {
                    let lhs = self.peek(1)?.clone();
                    let rhs = self.peek(0)?.clone();
                    match (&lhs, &rhs) {
                        (Value::Number(lhs), Value::Number(rhs)) => {
                            let sum = lhs + rhs;
                            self.pop()?;
                            self.pop()?;
                            self.push(Value::Number(sum));
                        }
                        (Value::Object(lhs_obj), Value::Object(rhs_obj)) => {
                            match (lhs_obj.as_ref(), rhs_obj.as_ref()) {
                                (Object::String(lhs_str), Object::String(rhs_str)) => {
                                    let mut new =
                                        String::with_capacity(lhs_str.len() + rhs_str.len());
                                    new.push_str(lhs_str);
                                    new.push_str(rhs_str);
                                    // Both operands stay on the stack until
                                    // the result is tracked.
                                    let result = self.gc.track_string(new);
                                    self.pop()?;
                                    self.pop()?;
                                    self.push(result.into());
                                }
                                _ => return Err(VMError::OperandsMustBeNumbersOrStrings),
                            }
                        }
                        _ => return Err(VMError::OperandsMustBeNumbersOrStrings),
                    }
                }
                OpCode::Subtract => self.binary(|lhs, rhs| lhs - rhs)?,
                OpCode::Multiply => self.binary(|lhs, rhs| lhs * rhs)?,
                OpCode::Divide => self.binary(|lhs, rhs| lhs / rhs)?,
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsy()));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(v) => self.push(Value::Number(-v)),
                        _ => return Err(VMError::OperandMustBeNumber),
                    }
                }
                OpCode::Print => {
                    let value = self.pop()?;
                    writeln!(self.out, "{}", value)?;
                }
                OpCode::Jump => {
                    let offset = self.read_jump()?;
                    self.frame_mut()?.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_jump()?;
                    if self.peek(0)?.is_falsy() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_jump()?;
                    self.frame_mut()?.ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte()? as usize;
                    let callee = self.peek(arg_count)?.clone();
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant()?;
                    let arg_count = self.read_byte()? as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant()?;
                    let arg_count = self.read_byte()? as usize;
                    let superclass = self.pop()?.as_object();
                    self.invoke_from_class(superclass, name.as_string(), arg_count)?;
                }
                OpCode::Closure => {
                    let function = self.read_constant()?.as_object();
                    let mut closure = self.gc.track_closure(Closure::new(function));
                    self.push(closure.into());

                    let upvalue_count = closure.as_closure().function().upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte()? == 1;
                        let index = self.read_byte()? as usize;
                        let upvalue = if is_local {
                            let stack_base = self.frame()?.stack_base;
                            self.capture_upvalue(stack_base + index)
                        } else {
                            let enclosing = self.frame()?.closure;
                            enclosing
                                .as_closure()
                                .upvalues
                                .get(index)
                                .copied()
                                .ok_or(VMError::InvalidBytecode)?
                        };
                        closure.as_closure_mut().upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.gc.stack.len().saturating_sub(1);
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Class => {
                    let name = self.read_string_constant()?;
                    let class = self.gc.track_class(Class::new(name));
                    self.push(class.into());
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1)?.clone();
                    let superclass_obj = match superclass.as_object_opt() {
                        Some(object) if matches!(object.as_ref(), Object::Class(_)) => object,
                        _ => return Err(VMError::SuperclassMustBeClass),
                    };
                    // Copy-down inheritance: the subclass gets a snapshot of
                    // the parent's methods and is unaffected by later
                    // changes to the parent.
                    let mut subclass_obj = self.peek(0)?.as_object();
                    let methods = superclass_obj.as_class().methods.clone();
                    subclass_obj.as_class_mut().methods.extend(methods);
                    self.pop()?; // Subclass; the superclass stays in its hidden local.
                }
                OpCode::Method => {
                    let name = self.read_string_constant()?;
                    let method = self.peek(0)?.as_object();
                    let mut class_obj = self.peek(1)?.as_object();
                    class_obj
                        .as_class_mut()
                        .methods
                        .insert(name.as_string().clone(), method);
                    self.pop()?; // Method closure.
                }
            }
        }
    }

    /// Dispatches a call to whatever `callee` is; the callee sits below its
    /// `arg_count` arguments on the stack.
    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        let object = match callee.as_object_opt() {
            Some(object) => object,
            None => return Err(VMError::NotCallable),
        };
        match object.as_ref() {
            Object::Closure(_) => self.call(object, arg_count),
            Object::Native(native) => {
                let native_fn = native.fun;
                let callee_index = self.gc.stack.len() - arg_count - 1;
                let result = native_fn(arg_count, &self.gc.stack[callee_index + 1..]);
                self.gc.stack.truncate(callee_index);
                self.push(result);
                Ok(())
            }
            Object::Class(class) => {
                // Calling a class instantiates it; the callee slot becomes
                // slot 0 (the receiver) of the initializer call.
                let callee_index = self.gc.stack.len() - arg_count - 1;
                let instance = self.gc.track_instance(Instance::new(object));
                self.gc.stack[callee_index] = instance.into();

                if let Some(init) = class.methods.get("init") {
                    self.call(*init, arg_count)
                } else if arg_count != 0 {
                    Err(VMError::ArityMismatch {
                        expected: 0,
                        got: arg_count,
                    })
                } else {
                    Ok(())
                }
            }
            Object::BoundMethod(bound) => {
                let method = bound.method;
                let receiver = bound.receiver.clone();
                let callee_index = self.gc.stack.len() - arg_count - 1;
                self.gc.stack[callee_index] = receiver;
                self.call(method, arg_count)
            }
            _ => Err(VMError::NotCallable),
        }
    }

    /// Pushes a frame for a closure call after checking arity and depth.
    fn call(&mut self, closure_obj: Gc<Object>, arg_count: usize) -> Result<()> {
        let arity = closure_obj.as_closure().function().arity;
        if arg_count != arity {
            return Err(VMError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }
        if self.gc.call_frames.len() >= FRAMES_MAX {
            return Err(VMError::StackOverflow);
        }

        let stack_base = self.gc.stack.len() - arg_count - 1;
        self.gc.call_frames.push(CallFrame::new(closure_obj, stack_base));
        Ok(())
    }

    /// Fused property access + call. Fields shadow methods, matching plain
    /// property access followed by a call.
    fn invoke(&mut self, name_obj: Gc<Object>, arg_count: usize) -> Result<()> {
        let receiver = self.peek(arg_count)?.clone();
        let instance_obj = match receiver.as_object_opt() {
            Some(object) if matches!(object.as_ref(), Object::Instance(_)) => object,
            _ => return Err(VMError::OnlyInstancesHaveMethods),
        };

        let name = name_obj.as_string();
        if let Some(field) = instance_obj.as_instance().fields.get(name) {
            let field = field.clone();
            let callee_index = self.gc.stack.len() - arg_count - 1;
            self.gc.stack[callee_index] = field.clone();
            self.call_value(field, arg_count)
        } else {
            self.invoke_from_class(instance_obj.as_instance().class, name, arg_count)
        }
    }

    fn invoke_from_class(
        &mut self,
        class_obj: Gc<Object>,
        name: &str,
        arg_count: usize,
    ) -> Result<()> {
        match class_obj.as_class().methods.get(name) {
            Some(method) => self.call(*method, arg_count),
            None => Err(VMError::UndefinedProperty(name.to_owned())),
        }
    }

    /// Returns the open upvalue for `stack_slot`, creating it if no closure
    /// captured that slot yet. The open list stays sorted by slot.
    fn capture_upvalue(&mut self, stack_slot: usize) -> Gc<Object> {
        let mut index = self.gc.open_upvalues.len();
        while index > 0 {
            let upvalue = self.gc.open_upvalues[index - 1];
            match upvalue.as_upvalue().open_slot() {
                Some(slot) if slot == stack_slot => return upvalue,
                Some(slot) if slot > stack_slot => index -= 1,
                _ => break,
            }
        }

        let upvalue = self.gc.track_upvalue(Upvalue::Open(stack_slot));
        self.gc.open_upvalues.insert(index, upvalue);
        upvalue
    }

    /// Closes every open upvalue pointing at `from_slot` or above, hoisting
    /// the captured values off the stack.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(upvalue) = self.gc.open_upvalues.last().copied() {
            let slot = match upvalue.as_upvalue().open_slot() {
                Some(slot) => slot,
                None => break,
            };
            if slot < from_slot {
                break;
            }

            let value = self.gc.stack[slot].clone();
            let mut upvalue = upvalue;
            upvalue.as_upvalue_mut().close(value);
            self.gc.open_upvalues.pop();
        }
    }

    fn binary(&mut self, op: fn(f64, f64) -> f64) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.push(Value::Number(op(lhs, rhs)));
                Ok(())
            }
            _ => Err(VMError::OperandsMustBeNumbers),
        }
    }

    fn comparison(&mut self, op: fn(f64, f64) -> bool) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.push(Value::Bool(op(lhs, rhs)));
                Ok(())
            }
            _ => Err(VMError::OperandsMustBeNumbers),
        }
    }

    fn frame(&self) -> Result<&CallFrame> {
        self.gc.call_frames.last().ok_or(VMError::NoCallFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame> {
        self.gc.call_frames.last_mut().ok_or(VMError::NoCallFrame)
    }

    fn read_byte(&mut self) -> Result<u8> {
        self.frame_mut()?.next_instruction()
    }

    fn read_jump(&mut self) -> Result<usize> {
        self.frame_mut()?.next_jump_offset()
    }

    fn read_constant(&mut self) -> Result<Value> {
        self.frame_mut()?.next_constant()
    }

    fn read_string_constant(&mut self) -> Result<Gc<Object>> {
        let value = self.read_constant()?;
        match value.as_object_opt() {
            Some(object) if matches!(object.as_ref(), Object::String(_)) => Ok(object),
            _ => Err(VMError::InvalidBytecode),
        }
    }

    fn push(&mut self, value: Value) {
        self.gc.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.gc.stack.pop().ok_or(VMError::EmptyStack)
    }

    fn peek(&self, distance: usize) -> Result<&Value> {
        let len = self.gc.stack.len();
        if distance >= len {
            return Err(VMError::EmptyStack);
        }
        Ok(&self.gc.stack[len - 1 - distance])
    }

    fn print_stack_trace(&self) {
        for frame in self.gc.call_frames.iter().rev() {
            let function = frame.function();
            let line = frame.line();
            match &function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, name.as_string()),
                None => eprintln!("[line {}] in script", line),
            }
        }
    }

    fn reset_stack(&mut self) {
        self.gc.stack.clear();
        self.gc.call_frames.clear();
        self.gc.open_upvalues.clear();
    }

    fn trace_execution(&self) {
        if TRACE_EXECUTION_STACK {
            let stack = self
                .gc
                .stack
                .iter()
                .map(|value| format!("[ {} ]", value))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{}\t{}", "[STACK]".yellow(), stack);
        }
        if TRACE_EXECUTION_INSTR {
            if let Ok(frame) = self.frame() {
                let (text, _) = debug::disassemble_instruction(&frame.function().chunk, frame.ip);
                println!("{}\t{:04}\t{}", "[INSTR]".green(), frame.ip, text);
            }
        }
    }
}

fn native_clock(_arg_count: usize, _args: &[Value]) -> Value {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::chunk::Chunk;
    use crate::memory::Function;

    fn run_capture(source: &str) -> (Result<()>, String) {
        let mut gc = GC::new();
        let mut output = Vec::new();
        let result = {
            let mut vm = VM::with_output(&mut gc, Box::new(&mut output));
            vm.interpret(source)
        };
        (result, String::from_utf8(output).unwrap())
    }

    fn run(source: &str) -> String {
        let (result, output) = run_capture(source);
        result.unwrap();
        output
    }

    #[test]
    fn vm_raw_instructions() {
        let mut chunk = Chunk::new();
        let one = chunk.add_constant(Value::Number(1.0)) as u8;
        chunk.write_index(OpCode::Constant, one, 1);
        let two = chunk.add_constant(Value::Number(2.0)) as u8;
        chunk.write_index(OpCode::Constant, two, 1);
        chunk.write(OpCode::Add, 1);
        let four = chunk.add_constant(Value::Number(4.0)) as u8;
        chunk.write_index(OpCode::Constant, four, 1);
        chunk.write(OpCode::Multiply, 1);
        chunk.write(OpCode::Print, 1);
        chunk.write(OpCode::Nil, 1);
        chunk.write(OpCode::Return, 1);

        let mut function = Function::script();
        function.chunk = chunk;

        let mut gc = GC::new();
        let function = gc.track_function(function);
        let mut output = Vec::new();
        {
            let mut vm = VM::with_output(&mut gc, Box::new(&mut output));
            vm.interpret_function(function).unwrap();
        }
        assert_eq!(String::from_utf8(output).unwrap(), "12\n");
        assert!(gc.stack.is_empty());
        assert!(gc.call_frames.is_empty());
    }

    #[test]
    fn vm_arithmetic() {
        assert_eq!(run("print 3 + (4 * 3) * (1 + (2 + 3));"), "75\n");
        assert_eq!(run("print (-1 + 2) * 3 - -4;"), "7\n");
        assert_eq!(run("print 1 / 2;"), "0.5\n");
    }

    #[test]
    fn vm_comparison_chains() {
        assert_eq!(run("print !(5 - 4 > 3 * 2 == !nil);"), "true\n");
        assert_eq!(run("print 1 <= 1; print 2 >= 3;"), "true\nfalse\n");
    }

    #[test]
    fn vm_equality() {
        let source = r#"
            print 1 == "1";
            print nil == nil;
            print nil == false;
            print "a" == "a";
            print "a" == "b";
        "#;
        assert_eq!(run(source), "false\ntrue\nfalse\ntrue\nfalse\n");
    }

    #[test]
    fn vm_truthiness() {
        let source = r#"
            if (0) print "zero";
            if ("") print "empty";
            if (nil) print "nil"; else print "not nil";
        "#;
        assert_eq!(run(source), "zero\nempty\nnot nil\n");
    }

    #[test]
    fn vm_string_concatenation() {
        assert_eq!(run("print \"st\" + \"ri\" + \"ng\";"), "string\n");
    }

    #[test]
    fn vm_add_type_mismatch() {
        let (result, output) = run_capture("print 1 + 2; print \"a\" + \"b\"; print 1 + \"a\";");
        assert_eq!(output, "3\nab\n");
        assert!(matches!(
            result,
            Err(VMError::OperandsMustBeNumbersOrStrings)
        ));
        assert_eq!(
            result.unwrap_err().to_string(),
            "Operands must be two numbers or two strings."
        );
    }

    #[test]
    fn vm_globals() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        print breakfast;
        "#;
        assert_eq!(run(source), "beignets with cafe au lait\n");
    }

    #[test]
    fn vm_undefined_variable() {
        let (result, _) = run_capture("print missing;");
        match result {
            Err(VMError::UndefinedVariable(name)) => assert_eq!(name, "missing"),
            other => panic!("expected undefined variable error, got {:?}", other),
        }
    }

    #[test]
    fn vm_undefined_assignment() {
        let (result, _) = run_capture("missing = 1;");
        assert!(matches!(result, Err(VMError::UndefinedVariable(_))));
    }

    #[test]
    fn vm_locals() {
        let source = r#"
        {
            var a = 1;
            var b = a + 1;
            {
                var c = a + b;
                print c;
            }
            a = 5;
            print a + b;
        }
        "#;
        assert_eq!(run(source), "3\n7\n");
    }

    #[test]
    fn vm_if_else() {
        let source = r#"
        var a = 1;
        if (a == 1) { print "then"; } else { print "else"; }
        if (a == 2) { print "then"; } else { print "else"; }
        "#;
        assert_eq!(run(source), "then\nelse\n");
    }

    #[test]
    fn vm_and_or() {
        let source = r#"
        print true and false;
        print true or false;
        print nil or "fallback";
        print false and "unreached";
        "#;
        assert_eq!(run(source), "false\ntrue\nfallback\nfalse\n");
    }

    #[test]
    fn vm_while() {
        let source = r#"
        var a = 0;
        while (a < 3) {
            print a;
            a = a + 1;
        }
        "#;
        assert_eq!(run(source), "0\n1\n2\n");
    }

    #[test]
    fn vm_for() {
        let source = r#"
        for (var i = 0; i < 3; i = i + 1) {
            print i;
        }
        "#;
        assert_eq!(run(source), "0\n1\n2\n");
    }

    #[test]
    fn vm_fibonacci() {
        let source = r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 2) + fib(n - 1);
            }
            print fib(10);
        "#;
        assert_eq!(run(source), "55\n");
    }

    #[test]
    fn vm_clock_native() {
        assert_eq!(run("print clock() >= 0;"), "true\n");
    }

    #[test]
    fn vm_arity_mismatch() {
        let (result, _) = run_capture("fun f(a) {} f(1, 2);");
        match result {
            Err(err @ VMError::ArityMismatch { .. }) => {
                assert_eq!(err.to_string(), "Expected 1 arguments but got 2.");
            }
            other => panic!("expected arity error, got {:?}", other),
        }
    }

    #[test]
    fn vm_stack_overflow() {
        let (result, _) = run_capture("fun f() { f(); } f();");
        assert!(matches!(result, Err(VMError::StackOverflow)));
    }

    #[test]
    fn vm_not_callable() {
        let (result, _) = run_capture("var x = 1; x();");
        assert!(matches!(result, Err(VMError::NotCallable)));
    }

    #[test]
    fn vm_closure_counter() {
        let source = r#"
            fun makeCounter() {
                var n = 0;
                fun count() {
                    n = n + 1;
                    return n;
                }
                return count;
            }
            var c = makeCounter();
            print c();
            print c();
            print c();
        "#;
        assert_eq!(run(source), "1\n2\n3\n");
    }

    #[test]
    fn vm_closure_counters_are_independent() {
        let source = r#"
            fun makeCounter() {
                var n = 0;
                fun count() {
                    n = n + 1;
                    return n;
                }
                return count;
            }
            var c1 = makeCounter();
            var c2 = makeCounter();
            c1();
            print c1();
            print c2();
        "#;
        assert_eq!(run(source), "2\n1\n");
    }

    #[test]
    fn vm_closures_share_one_cell() {
        let source = r#"
            var globalSet;
            var globalGet;
            fun main() {
                var a = "initial";
                fun set() { a = "updated"; }
                fun get() { print a; }
                globalSet = set;
                globalGet = get;
            }
            main();
            globalSet();
            globalGet();
        "#;
        assert_eq!(run(source), "updated\n");
    }

    #[test]
    fn vm_close_upvalue_on_scope_exit() {
        let source = r#"
            var f;
            {
                var local = "local";
                fun inner() { print local; }
                f = inner;
            }
            f();
        "#;
        assert_eq!(run(source), "local\n");
    }

    #[test]
    fn vm_nested_closures() {
        let source = r#"
            fun outer() {
                var x = "value";
                fun middle() {
                    fun inner() {
                        print x;
                    }
                    return inner;
                }
                return middle;
            }
            outer()()();
        "#;
        assert_eq!(run(source), "value\n");
    }

    #[test]
    fn vm_class_instance() {
        let source = r#"
            class Brioche {}
            print Brioche;
            print Brioche();
        "#;
        assert_eq!(run(source), "Brioche\nBrioche instance\n");
    }

    #[test]
    fn vm_fields() {
        let source = r#"
            class Pair {}
            var pair = Pair();
            pair.first = 1;
            pair.second = 2;
            print pair.first + pair.second;
        "#;
        assert_eq!(run(source), "3\n");
    }

    #[test]
    fn vm_set_property_leaves_value() {
        let source = r#"
            class Box {}
            var box = Box();
            print box.value = "stored";
        "#;
        assert_eq!(run(source), "stored\n");
    }

    #[test]
    fn vm_methods_and_this() {
        let source = r#"
            class Scone {
                topping(first, second) {
                    print "scone with " + first + " and " + second;
                }
            }
            var scone = Scone();
            scone.topping("berries", "cream");
        "#;
        assert_eq!(run(source), "scone with berries and cream\n");
    }

    #[test]
    fn vm_field_shadows_method() {
        let source = r#"
            class A {
                greet() { return "method"; }
            }
            var a = A();
            print a.greet();
            a.greet = "field";
            print a.greet;
        "#;
        assert_eq!(run(source), "method\nfield\n");
    }

    #[test]
    fn vm_field_closure_shadows_method_on_invoke() {
        let source = r#"
            class A {
                greet() { return "method"; }
            }
            var a = A();
            fun shadow() { return "field fn"; }
            a.greet = shadow;
            print a.greet();
        "#;
        assert_eq!(run(source), "field fn\n");
    }

    #[test]
    fn vm_bound_method_keeps_receiver() {
        let source = r#"
            class Person {
                init(name) { this.name = name; }
                sayName() { print this.name; }
            }
            var jane = Person("Jane");
            var method = jane.sayName;
            method();
        "#;
        assert_eq!(run(source), "Jane\n");
    }

    #[test]
    fn vm_initializer_returns_receiver() {
        let source = r#"
            class P {
                init(x) { this.x = x; }
            }
            var p = P(42);
            print p.x;
        "#;
        assert_eq!(run(source), "42\n");
    }

    #[test]
    fn vm_bare_return_in_initializer_yields_instance() {
        let source = r#"
            class P {
                init() { return; }
            }
            print P();
        "#;
        assert_eq!(run(source), "P instance\n");
    }

    #[test]
    fn vm_initializer_arity_enforced() {
        let (result, _) = run_capture("class P { init(x) {} } P();");
        match result {
            Err(err @ VMError::ArityMismatch { .. }) => {
                assert_eq!(err.to_string(), "Expected 1 arguments but got 0.");
            }
            other => panic!("expected arity error, got {:?}", other),
        }
    }

    #[test]
    fn vm_class_without_initializer_rejects_arguments() {
        let (result, _) = run_capture("class P {} P(1);");
        assert!(matches!(
            result,
            Err(VMError::ArityMismatch {
                expected: 0,
                got: 1
            })
        ));
    }

    #[test]
    fn vm_inheritance_and_super() {
        let source = r#"
            class A { say() { print "A"; } }
            class B < A { say() { super.say(); print "B"; } }
            B().say();
        "#;
        assert_eq!(run(source), "A\nB\n");
    }

    #[test]
    fn vm_inherited_methods() {
        let source = r#"
            class Doughnut {
                cook() { print "fry until golden"; }
            }
            class Cruller < Doughnut {}
            Cruller().cook();
        "#;
        assert_eq!(run(source), "fry until golden\n");
    }

    #[test]
    fn vm_inherited_initializer_keeps_parent_arity() {
        let source = r#"
            class A { init(x) { this.x = x; } }
            class B < A {}
            var b = B(7);
            print b.x;
        "#;
        assert_eq!(run(source), "7\n");
    }

    #[test]
    fn vm_inheritance_is_copy_down() {
        // Methods added to the parent after the subclass was declared are
        // not visible through the subclass.
        let source = r#"
            class A { f() { print "f"; } }
            class B < A {}
            B().f();
        "#;
        assert_eq!(run(source), "f\n");
    }

    #[test]
    fn vm_super_bound_method() {
        let source = r#"
            class A { say() { print "from A"; } }
            class B < A {
                grab() { return super.say; }
            }
            var m = B().grab();
            m();
        "#;
        assert_eq!(run(source), "from A\n");
    }

    #[test]
    fn vm_superclass_must_be_class() {
        let (result, _) = run_capture("var NotClass = 1; class B < NotClass {}");
        assert!(matches!(result, Err(VMError::SuperclassMustBeClass)));
    }

    #[test]
    fn vm_undefined_property() {
        let (result, _) = run_capture("class A {} print A().missing;");
        match result {
            Err(VMError::UndefinedProperty(name)) => assert_eq!(name, "missing"),
            other => panic!("expected undefined property error, got {:?}", other),
        }
    }

    #[test]
    fn vm_property_on_non_instance() {
        let (result, _) = run_capture("print 1.x;");
        assert!(matches!(result, Err(VMError::OnlyInstancesHaveProperties)));
    }

    #[test]
    fn vm_method_on_non_instance() {
        let (result, _) = run_capture("var s = \"str\"; s.f();");
        assert!(matches!(result, Err(VMError::OnlyInstancesHaveMethods)));
    }

    #[test]
    fn vm_comparison_requires_numbers() {
        let (result, _) = run_capture("print 1 < \"a\";");
        assert!(matches!(result, Err(VMError::OperandsMustBeNumbers)));
    }

    #[test]
    fn vm_negate_requires_number() {
        let (result, _) = run_capture("print -\"a\";");
        assert!(matches!(result, Err(VMError::OperandMustBeNumber)));
    }

    #[test]
    fn vm_stacks_empty_after_run() {
        let mut gc = GC::new();
        let mut output = Vec::new();
        {
            let mut vm = VM::with_output(&mut gc, Box::new(&mut output));
            vm.interpret(
                r#"
                fun f(a, b) { return a + b; }
                class C { init() { this.x = f(1, 2); } }
                print C().x;
                "#,
            )
            .unwrap();
        }
        assert_eq!(String::from_utf8(output).unwrap(), "3\n");
        assert!(gc.stack.is_empty());
        assert!(gc.call_frames.is_empty());
        assert!(gc.open_upvalues.is_empty());
    }

    #[test]
    fn vm_runtime_error_resets_stack() {
        let mut gc = GC::new();
        {
            let mut vm = VM::with_output(&mut gc, Box::new(io::sink()));
            assert!(vm.interpret("fun f() { return 1 + \"a\"; } f();").is_err());
        }
        assert!(gc.stack.is_empty());
        assert!(gc.call_frames.is_empty());

        // The VM stays usable afterwards.
        let mut output = Vec::new();
        {
            let mut vm = VM::with_output(&mut gc, Box::new(&mut output));
            vm.interpret("print \"still alive\";").unwrap();
        }
        assert_eq!(String::from_utf8(output).unwrap(), "still alive\n");
    }

    #[test]
    fn vm_globals_survive_across_interpret_calls() {
        let mut gc = GC::new();
        let mut output = Vec::new();
        {
            let mut vm = VM::with_output(&mut gc, Box::new(&mut output));
            vm.interpret("var a = 1;").unwrap();
            vm.interpret("a = a + 1; print a;").unwrap();
        }
        assert_eq!(String::from_utf8(output).unwrap(), "2\n");
    }

    #[test]
    fn vm_gc_string_churn() {
        let mut gc = GC::new();
        let mut output = Vec::new();
        {
            let mut vm = VM::with_output(&mut gc, Box::new(&mut output));
            vm.interpret(
                r#"
                var acc = "";
                for (var i = 0; i < 600; i = i + 1) {
                    acc = acc + "x";
                }
                var keep = "string that stays reachable";
                print keep;
                "#,
            )
            .unwrap();
        }
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "string that stays reachable\n"
        );

        // Everything the loop churned through is garbage now; the interned
        // table must not hold on to any of it.
        let before = gc.bytes_allocated();
        gc.collect();
        assert!(gc.interned_count() < 10);
        assert!(gc.bytes_allocated() < before);
        assert!(gc.stack.is_empty());
        assert!(gc.call_frames.is_empty());
    }

    #[test]
    fn vm_gc_instances_survive_collection() {
        let mut gc = GC::new();
        let mut output = Vec::new();
        {
            let mut vm = VM::with_output(&mut gc, Box::new(&mut output));
            vm.interpret(
                r#"
                class Node { init(value) { this.value = value; } }
                var head = Node("payload");
                var filler = "";
                for (var i = 0; i < 600; i = i + 1) {
                    filler = filler + "y";
                }
                print head.value;
                "#,
            )
            .unwrap();
        }
        assert_eq!(String::from_utf8(output).unwrap(), "payload\n");
    }
}
