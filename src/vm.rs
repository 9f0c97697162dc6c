use std::fmt;
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Instant;

use crate::{
    compile, Error, FnUpvalue, Gc, Heap, HeapObj, NativeFn, ObjBoundMethod, ObjClass, ObjClosure,
    ObjFun, ObjInstance, ObjNative, ObjStr, ObjUpvalue, OpCode, RuntimeError, Table, Value,
    MAX_FRAMES, MAX_STACK,
};

/// The per-call record: which closure is running, where its instruction
/// pointer is, and where its stack window begins. Slot 0 of the window holds
/// the callee, or the receiver for methods.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: Gc<ObjClosure>,
    ip: usize,
    slots: usize,
}

/// A bytecode virtual machine for the Perch programming language.
///
/// Program output (the `print` statement) goes to the writer given at
/// construction; diagnostics go to stderr. Each machine is fully independent:
/// globals, interned strings, and heap all live inside it.
pub struct VM<W> {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Captured stack slots that are still live, sorted by strictly
    /// decreasing slot
    open_upvalues: Vec<Gc<ObjUpvalue>>,
    heap: Heap,
    init_string: Gc<ObjStr>,
    output: W,
}

impl Default for VM<io::Stdout> {
    fn default() -> Self {
        Self::new(io::stdout())
    }
}

impl<W> fmt::Debug for VM<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VM")
            .field("stack", &self.stack)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

impl<W: Write> VM<W> {
    /// Create a virtual machine writing program output to `output`.
    pub fn new(output: W) -> Self {
        let mut heap = Heap::default();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(MAX_STACK),
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: Table::default(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            output,
        };
        vm.define_native("clock", 0, clock_native);
        vm
    }

    /// Compile and run the given source code.
    ///
    /// Globals survive across calls, so a REPL can feed lines one at a time.
    pub fn interpret(&mut self, src: &str) -> Result<(), Error> {
        // Compile-time collections only know the compiler's roots; pin the
        // machine's own for the duration.
        self.pin_roots();
        let compiled = compile(src, &mut self.heap);
        self.heap.clear_pinned();
        let fun = match compiled {
            Ok(fun) => fun,
            Err(errors) => {
                for err in &errors {
                    eprintln!("{err}");
                }
                return Err(Error::Compile);
            }
        };
        let fun = self.alloc(fun);
        let result = match self.prepare(fun) {
            Ok(()) => self.run(),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.report_runtime_error(&err);
            self.reset();
            return Err(Error::Runtime);
        }
        Ok(())
    }

    /// Register a native function under the given name.
    pub fn define_native(&mut self, name: &str, arity: u8, call: NativeFn) {
        let name = self.intern(name);
        let native = self.alloc(ObjNative { name, arity, call });
        let hash = self.heap.get(name).hash;
        self.globals.set(name, hash, Value::NativeFun(native));
    }

    /// Run a collection at every allocation. See [`Heap::set_stress`].
    pub fn enable_gc_stress(&mut self) {
        self.heap.set_stress(true);
    }

    /// Wrap the compiled script in a closure and call it with no arguments.
    fn prepare(&mut self, fun: Gc<ObjFun>) -> Result<(), RuntimeError> {
        // The function must be visible to the collector while the closure is
        // allocated.
        self.push(Value::Fun(fun))?;
        let closure = self.alloc(ObjClosure {
            fun,
            upvalues: Vec::new(),
        });
        self.pop()?;
        self.push(Value::Closure(closure))?;
        self.call_closure(closure, 0)
    }

    /// Run the virtual machine until the top-level frame returns.
    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace")]
            self.trace_instruction();

            match self.next_instruction() {
                OpCode::Constant(id) => {
                    let value = self.read_const(id);
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::GetLocal(slot) => {
                    let value = self.stack[self.frame().slots + usize::from(slot)];
                    self.push(value)?;
                }
                OpCode::SetLocal(slot) => {
                    let value = *self.peek(0)?;
                    let base = self.frame().slots;
                    self.stack[base + usize::from(slot)] = value;
                }
                OpCode::GetGlobal(id) => {
                    let name = self.read_const_str(id);
                    let hash = self.heap.get(name).hash;
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value)?,
                        None => {
                            return Err(RuntimeError::UndefinedVariable(
                                self.heap.get(name).data.clone(),
                            ));
                        }
                    }
                }
                OpCode::DefineGlobal(id) => {
                    let name = self.read_const_str(id);
                    let hash = self.heap.get(name).hash;
                    let value = *self.peek(0)?;
                    self.globals.set(name, hash, value);
                    self.pop()?;
                }
                OpCode::SetGlobal(id) => {
                    let name = self.read_const_str(id);
                    let hash = self.heap.get(name).hash;
                    let value = *self.peek(0)?;
                    if self.globals.set(name, hash, value) {
                        // Assignment must not create globals; undo and report.
                        self.globals.delete(name, hash);
                        return Err(RuntimeError::UndefinedVariable(
                            self.heap.get(name).data.clone(),
                        ));
                    }
                }
                OpCode::GetUpvalue(idx) => {
                    let upvalue = self.heap.get(self.frame().closure).upvalues[usize::from(idx)];
                    let value = match self.heap.get(upvalue) {
                        ObjUpvalue::Open(slot) => self.stack[*slot],
                        ObjUpvalue::Closed(value) => *value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue(idx) => {
                    let value = *self.peek(0)?;
                    let upvalue = self.heap.get(self.frame().closure).upvalues[usize::from(idx)];
                    match self.heap.get_mut(upvalue) {
                        ObjUpvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        closed => *closed = ObjUpvalue::Closed(value),
                    }
                }
                OpCode::GetProperty(id) => self.get_property(id)?,
                OpCode::SetProperty(id) => self.set_property(id)?,
                OpCode::Equal => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    *v1 = Value::Bool(*v1 == v2);
                }
                OpCode::Greater => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    *v1 = v1.gt(&v2)?;
                }
                OpCode::Less => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    *v1 = v1.lt(&v2)?;
                }
                OpCode::Add => self.add()?,
                OpCode::Subtract => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    *v1 = (&*v1 - &v2)?;
                }
                OpCode::Multiply => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    *v1 = (&*v1 * &v2)?;
                }
                OpCode::Divide => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    *v1 = (&*v1 / &v2)?;
                }
                OpCode::Not => {
                    let v = self.peek_mut(0)?;
                    *v = !&*v;
                }
                OpCode::Negate => {
                    let v = self.peek_mut(0)?;
                    *v = (-&*v)?;
                }
                OpCode::Print => {
                    let value = self.pop()?;
                    let text = value.show(&self.heap);
                    writeln!(self.output, "{text}").expect("Program output must be writable.");
                }
                OpCode::Jump(offset) => {
                    self.frame_mut().ip += usize::from(offset);
                }
                OpCode::JumpIfFalse(offset) => {
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut().ip += usize::from(offset);
                    }
                }
                OpCode::Loop(offset) => {
                    self.frame_mut().ip -= usize::from(offset);
                }
                OpCode::Call(argc) => {
                    let callee = *self.peek(usize::from(argc))?;
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure(id, upvalues) => self.make_closure(id, upvalues)?,
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .expect("There is always a frame while running.");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // Discard the script closure; the stack is now empty.
                        self.pop()?;
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result)?;
                }
                OpCode::Class(id) => {
                    let name = self.read_const_str(id);
                    let class = self.alloc(ObjClass::new(name));
                    self.push(Value::Class(class))?;
                }
                OpCode::Method(id) => {
                    let name = self.read_const_str(id);
                    let method = *self.peek(0)?;
                    let class = match *self.peek(1)? {
                        Value::Class(class) => class,
                        _ => unreachable!("The compiler emits METHOD right after CLASS."),
                    };
                    let hash = self.heap.get(name).hash;
                    self.heap.get_mut(class).methods.set(name, hash, method);
                    self.pop()?;
                }
            }
        }
    }

    /// Dispatch a call on any value. Only closures, natives, classes, and
    /// bound methods are callable.
    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::NativeFun(native) => {
                let native = *self.heap.get(native);
                if argc != native.arity {
                    return Err(RuntimeError::ArityMismatch(native.arity, argc));
                }
                let first_arg = self.stack.len() - usize::from(argc);
                let result =
                    (native.call)(&self.stack[first_arg..]).map_err(RuntimeError::Native)?;
                self.stack.truncate(first_arg - 1);
                self.push(result)
            }
            Value::Class(class) => {
                let instance = self.alloc(ObjInstance::new(class));
                let slot = self.stack.len() - usize::from(argc) - 1;
                self.stack[slot] = Value::Instance(instance);
                let init_hash = self.heap.get(self.init_string).hash;
                match self.heap.get(class).methods.get(self.init_string, init_hash) {
                    Some(Value::Closure(init)) => self.call_closure(init, argc),
                    Some(_) => unreachable!("Methods are always closures."),
                    None if argc != 0 => Err(RuntimeError::ArityMismatch(0, argc)),
                    None => Ok(()),
                }
            }
            Value::BoundMethod(bound) => {
                let ObjBoundMethod { receiver, method } = *self.heap.get(bound);
                let slot = self.stack.len() - usize::from(argc) - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(RuntimeError::InvalidCall),
        }
    }

    fn call_closure(&mut self, closure: Gc<ObjClosure>, argc: u8) -> Result<(), RuntimeError> {
        let arity = self.heap.get(self.heap.get(closure).fun).arity;
        if argc != arity {
            return Err(RuntimeError::ArityMismatch(arity, argc));
        }
        if self.frames.len() == MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - usize::from(argc) - 1,
        });
        Ok(())
    }

    fn get_property(&mut self, id: u8) -> Result<(), RuntimeError> {
        let name = self.read_const_str(id);
        let receiver = *self.peek(0)?;
        let instance = match receiver {
            Value::Instance(instance) => instance,
            _ => return Err(RuntimeError::NoProperties),
        };
        let hash = self.heap.get(name).hash;
        if let Some(value) = self.heap.get(instance).fields.get(name, hash) {
            self.pop()?;
            self.push(value)?;
            return Ok(());
        }
        let class = self.heap.get(instance).class;
        match self.heap.get(class).methods.get(name, hash) {
            Some(Value::Closure(method)) => {
                let bound = self.alloc(ObjBoundMethod { receiver, method });
                self.pop()?;
                self.push(Value::BoundMethod(bound))
            }
            Some(_) => unreachable!("Methods are always closures."),
            None => Err(RuntimeError::UndefinedProperty(
                self.heap.get(name).data.clone(),
            )),
        }
    }

    fn set_property(&mut self, id: u8) -> Result<(), RuntimeError> {
        let name = self.read_const_str(id);
        let value = *self.peek(0)?;
        let instance = match *self.peek(1)? {
            Value::Instance(instance) => instance,
            _ => return Err(RuntimeError::NoFields),
        };
        let hash = self.heap.get(name).hash;
        self.heap.get_mut(instance).fields.set(name, hash, value);
        // Remove the instance but leave the assigned value.
        self.pop()?;
        self.pop()?;
        self.push(value)
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let v2 = *self.peek(0)?;
        let v1 = *self.peek(1)?;
        match (v1, v2) {
            (Value::Number(n1), Value::Number(n2)) => {
                self.pop()?;
                let v = self.peek_mut(0)?;
                *v = Value::Number(n1 + n2);
                Ok(())
            }
            (Value::Str(s1), Value::Str(s2)) => {
                let mut data = self.heap.get(s1).data.clone();
                data.push_str(&self.heap.get(s2).data);
                // Interning may collect; the operands stay on the stack until
                // the result exists.
                let result = Value::Str(self.intern(&data));
                self.pop()?;
                self.pop()?;
                self.push(result)
            }
            _ => Err(RuntimeError::InvalidAddOperands),
        }
    }

    fn make_closure(&mut self, id: u8, upvalues: Vec<FnUpvalue>) -> Result<(), RuntimeError> {
        let fun = match self.read_const(id) {
            Value::Fun(fun) => fun,
            _ => unreachable!("The closure's function must have been added."),
        };
        // The closure goes on the stack first so a collection during upvalue
        // capture can see it and everything captured so far.
        let closure = self.alloc(ObjClosure {
            fun,
            upvalues: Vec::with_capacity(upvalues.len()),
        });
        self.push(Value::Closure(closure))?;
        for upvalue in upvalues {
            let captured = if upvalue.is_local {
                let slot = self.frame().slots + usize::from(upvalue.index);
                self.capture_upvalue(slot)
            } else {
                self.heap.get(self.frame().closure).upvalues[usize::from(upvalue.index)]
            };
            self.heap.get_mut(closure).upvalues.push(captured);
        }
        Ok(())
    }

    /// Reuse the open upvalue for the slot if one exists, keeping the list
    /// sorted by decreasing slot; otherwise allocate one and thread it in.
    fn capture_upvalue(&mut self, slot: usize) -> Gc<ObjUpvalue> {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match self.heap.get(upvalue) {
                ObjUpvalue::Open(s) if *s == slot => return upvalue,
                ObjUpvalue::Open(s) if *s < slot => {
                    insert_at = i;
                    break;
                }
                ObjUpvalue::Open(_) => {}
                ObjUpvalue::Closed(_) => unreachable!("The open list only holds open upvalues."),
            }
        }
        let upvalue = self.alloc(ObjUpvalue::Open(slot));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Close every open upvalue pointing at `last` or above: copy the slot's
    /// value into the upvalue and take it off the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match self.heap.get(upvalue) {
                ObjUpvalue::Open(slot) => *slot,
                ObjUpvalue::Closed(_) => unreachable!("The open list only holds open upvalues."),
            };
            if slot < last {
                break;
            }
            *self.heap.get_mut(upvalue) = ObjUpvalue::Closed(self.stack[slot]);
            self.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// The machine's allocation choke point: collect first when the heap asks
    /// for it, with the machine's roots and the pending object's children
    /// marked.
    fn alloc<T: HeapObj>(&mut self, obj: T) -> Gc<T> {
        let kind = obj.into_kind();
        if self.heap.should_collect() {
            self.mark_roots();
            self.heap.mark_children_of(&kind);
            self.heap.collect();
        }
        self.heap.alloc_kind(kind)
    }

    fn intern(&mut self, s: &str) -> Gc<ObjStr> {
        if self.heap.should_collect() {
            self.mark_roots();
            self.heap.collect();
        }
        self.heap.intern(s)
    }

    /// Pin everything the machine can reach, for the compilation window
    /// where it is not the one marking roots. The stack and frames are empty
    /// between programs, so globals and the `init` string are all there is.
    fn pin_roots(&mut self) {
        let mut pinned = vec![self.init_string.index()];
        for (key, value) in self.globals.iter() {
            pinned.push(key.index());
            if let Some(index) = value.object_index() {
                pinned.push(index);
            }
        }
        self.heap.set_pinned(pinned);
    }

    fn mark_roots(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark(upvalue);
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark(key);
            self.heap.mark_value(value);
        }
        self.heap.mark(self.init_string);
    }

    // ------------------------------------------------------------------
    // Stack and frame plumbing
    // ------------------------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == MAX_STACK {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn peek(&self, steps: usize) -> Result<&Value, RuntimeError> {
        self.stack
            .len()
            .checked_sub(1 + steps)
            .and_then(|idx| self.stack.get(idx))
            .ok_or(RuntimeError::StackUnderflow)
    }

    fn peek_mut(&mut self, steps: usize) -> Result<&mut Value, RuntimeError> {
        match self.stack.len().checked_sub(1 + steps) {
            Some(idx) => self.stack.get_mut(idx).ok_or(RuntimeError::StackUnderflow),
            None => Err(RuntimeError::StackUnderflow),
        }
    }

    fn frame(&self) -> &CallFrame {
        self.frames
            .last()
            .expect("There is always a frame while running.")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("There is always a frame while running.")
    }

    /// Read the next instruction of the active frame and advance its
    /// instruction pointer.
    fn next_instruction(&mut self) -> OpCode {
        let frame = self
            .frames
            .last_mut()
            .expect("There is always a frame while running.");
        let fun = self.heap.get(frame.closure).fun;
        let (op, _) = self.heap.get(fun).chunk.read_instruction(frame.ip);
        frame.ip += 1;
        op.clone()
    }

    fn read_const(&self, id: u8) -> Value {
        let fun = self.heap.get(self.frame().closure).fun;
        self.heap.get(fun).chunk.read_const(id)
    }

    fn read_const_str(&self, id: u8) -> Gc<ObjStr> {
        match self.read_const(id) {
            Value::Str(s) => s,
            _ => unreachable!("Constant for the variable name must have been added."),
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Print the error followed by one line per active frame, innermost
    /// first.
    fn report_runtime_error(&self, err: &RuntimeError) {
        eprintln!("{err}");
        for frame in self.frames.iter().rev() {
            let fun = self.heap.get(self.heap.get(frame.closure).fun);
            // The instruction pointer has advanced past the faulting
            // instruction.
            let (_, pos) = fun.chunk.read_instruction(frame.ip.saturating_sub(1));
            match fun.name {
                Some(name) => {
                    eprintln!("[line {}] in {}()", pos.line, self.heap.get(name).data);
                }
                None => eprintln!("[line {}] in script", pos.line),
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    #[cfg(feature = "trace")]
    fn trace_instruction(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", value.show(&self.heap)));
        }
        eprintln!("{line}");
        let frame = self.frame();
        let fun = self.heap.get(self.heap.get(frame.closure).fun);
        let _ = fun
            .chunk
            .disassemble_instruction(frame.ip, &self.heap, &mut io::stderr());
    }
}

/// Seconds elapsed since the first time the clock was read, as a double.
fn clock_native(_args: &[Value]) -> Result<Value, String> {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> (VM<Vec<u8>>, Result<(), Error>) {
        let mut vm = VM::new(Vec::new());
        let result = vm.interpret(src);
        (vm, result)
    }

    fn output(vm: &VM<Vec<u8>>) -> String {
        String::from_utf8(vm.output.clone()).expect("Program output is valid UTF-8.")
    }

    #[test]
    fn stack_is_empty_after_a_normal_exit() {
        let (vm, result) = run("var a = 1 + 2; print a; if (a > 1) { print a * 2; }");
        assert!(result.is_ok());
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert_eq!(output(&vm), "3\n6\n");
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let mut vm = VM::new(Vec::new());
        vm.interpret("var a = 40;").expect("first line runs");
        vm.interpret("print a + 2;").expect("second line runs");
        assert_eq!(output(&vm), "42\n");
    }

    #[test]
    fn runaway_recursion_overflows_the_frames() {
        let (_, result) = run("fun f() { f(); } f();");
        assert!(matches!(result, Err(Error::Runtime)));
    }

    #[test]
    fn frame_budget_boundary() {
        // The script takes one frame, so 63 nested calls fit and 64 do not.
        let (vm, result) = run("fun f(n) { if (n > 1) f(n - 1); } f(63);");
        assert!(result.is_ok());
        assert!(vm.stack.is_empty());
        let (_, result) = run("fun f(n) { if (n > 1) f(n - 1); } f(64);");
        assert!(matches!(result, Err(Error::Runtime)));
    }

    #[test]
    fn open_upvalues_stay_sorted_by_decreasing_slot() {
        let mut vm = VM::new(Vec::new());
        for i in 0..4 {
            vm.push(Value::Number(i as f64)).expect("stack has room");
        }
        let two = vm.capture_upvalue(2);
        vm.capture_upvalue(0);
        vm.capture_upvalue(3);
        vm.capture_upvalue(1);
        // Capturing an already-captured slot reuses the upvalue.
        assert_eq!(vm.capture_upvalue(2), two);

        let slots: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|&uv| match vm.heap.get(uv) {
                ObjUpvalue::Open(slot) => *slot,
                ObjUpvalue::Closed(_) => panic!("open list holds only open upvalues"),
            })
            .collect();
        assert_eq!(slots, vec![3, 2, 1, 0]);
    }

    #[test]
    fn closing_upvalues_copies_the_stack_value() {
        let mut vm = VM::new(Vec::new());
        vm.push(Value::Number(1.0)).expect("stack has room");
        vm.push(Value::Number(2.0)).expect("stack has room");
        let low = vm.capture_upvalue(0);
        let high = vm.capture_upvalue(1);

        vm.close_upvalues(1);
        assert!(matches!(
            vm.heap.get(high),
            ObjUpvalue::Closed(Value::Number(n)) if *n == 2.0,
        ));
        assert!(matches!(vm.heap.get(low), ObjUpvalue::Open(0)));
        assert_eq!(vm.open_upvalues.len(), 1);
    }

    #[test]
    fn clock_native_is_monotone() {
        let (vm, result) = run("var t0 = clock(); var t1 = clock(); print t1 >= t0;");
        assert!(result.is_ok());
        assert_eq!(output(&vm), "true\n");
    }

    #[test]
    fn native_arity_is_checked() {
        let (_, result) = run("clock(1);");
        assert!(matches!(result, Err(Error::Runtime)));
    }

    #[test]
    fn native_errors_become_runtime_errors() {
        fn failing(_args: &[Value]) -> Result<Value, String> {
            Err("the hardware is on fire".to_string())
        }
        let mut vm = VM::new(Vec::new());
        vm.define_native("explode", 0, failing);
        assert!(matches!(vm.interpret("explode();"), Err(Error::Runtime)));
        // The machine is usable afterwards.
        vm.interpret("print 1;").expect("vm recovered");
    }

    #[test]
    fn native_results_replace_callee_and_arguments() {
        fn sum(args: &[Value]) -> Result<Value, String> {
            match (args[0], args[1]) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                _ => Err("expected numbers".to_string()),
            }
        }
        let mut vm = VM::new(Vec::new());
        vm.define_native("sum", 2, sum);
        vm.interpret("print sum(40, 2);").expect("native runs");
        assert!(vm.stack.is_empty());
        assert_eq!(output(&vm), "42\n");
    }

    #[test]
    fn stress_collection_does_not_break_programs() {
        let mut vm = VM::new(Vec::new());
        vm.enable_gc_stress();
        vm.interpret(
            r#"
            fun adder(n) { fun add(m) { return n + m; } return add; }
            var add5 = adder(5);
            class Box { init(v) { this.v = v; } label() { return "box " + this.v; } }
            var b = Box("x" + "y");
            print add5(37);
            print b.label();
            "#,
        )
        .expect("program survives stress collection");
        assert_eq!(output(&vm), "42\nbox xy\n");
    }

    #[test]
    fn collection_frees_garbage_but_keeps_reachable_objects() {
        let mut vm = VM::new(Vec::new());
        vm.interpret(
            r#"
            var keep = "kept string";
            var i = 0;
            while (i < 100) { var s = "temp" + "orary"; i = i + 1; }
            "#,
        )
        .expect("program runs");
        let live_before = vm.heap.object_count();
        vm.mark_roots();
        vm.heap.collect();
        assert!(vm.heap.object_count() <= live_before);
        // The global is still there.
        vm.interpret("print keep;").expect("global survives");
        assert_eq!(output(&vm), "kept string\n");
    }
}
