use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use crate::bytecode::chunk::{BytecodeFunction, Chunk};
use crate::bytecode::op::Op;
use crate::lang::value::{Closure, MapRef, Upvalue, Value};
use crate::runtime::natives;
use crate::runtime::runtime_error::{
    arity_mismatch, division_by_zero, index_out_of_range, internal, module_load_failure,
    type_mismatch, undefined_variable, RuntimeError,
};

/// Module cache shared between a VM and its host loader. The loader seeds a
/// placeholder exports map under the module key before running the module,
/// so cyclic imports terminate (the cycle participant observes a
/// possibly-empty map).
pub type ModuleCache = Rc<RefCell<HashMap<String, MapRef>>>;

/// Host hook that resolves, loads and runs a module, returning its exports
/// map. Called with the raw `IMPORT` operand and the importing module's key.
pub type ModuleLoader =
    Box<dyn FnMut(&str, Option<&str>, &ModuleCache) -> Result<MapRef, RuntimeError>>;

pub struct VmOptions {
    pub current_module_key: Option<String>,
    pub module_loader: Option<ModuleLoader>,
    /// Shared with nested module VMs; a fresh cache when absent.
    pub module_cache: Option<ModuleCache>,
    /// The exports map this VM populates; used by loaders to hand the
    /// pre-seeded placeholder to the module being run.
    pub exports: Option<MapRef>,
    pub stdout: Box<dyn Write>,
    pub debug_out: Box<dyn Write>,
    pub max_frames: usize,
    pub max_stack: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            current_module_key: None,
            module_loader: None,
            module_cache: None,
            exports: None,
            stdout: Box::new(io::stdout()),
            debug_out: Box::new(io::stderr()),
            max_frames: 1000,
            max_stack: 10_000,
        }
    }
}

/// A record for one in-progress call. `stack_offset` is the absolute index
/// of the frame's slot 0; `return_slot` is where the callee itself sat and
/// where the return value must land.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    stack_offset: usize,
    return_slot: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub globals: HashMap<String, Value>,
    /// Open upvalues ordered by descending stack location; at most one
    /// entry per location.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    module_cache: ModuleCache,
    exports: MapRef,
    current_line: Option<u32>,
    options: VmOptions,
}

impl Vm {
    pub fn new(mut options: VmOptions) -> Vm {
        let mut globals = HashMap::new();
        natives::install_default(&mut globals);
        let module_cache = options.module_cache.take().unwrap_or_default();
        let exports = options.exports.take().unwrap_or_default();
        Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
            module_cache,
            exports,
            current_line: None,
            options,
        }
    }

    /// The exports map populated by this VM's `EXPORT` instructions.
    pub fn exports(&self) -> MapRef {
        self.exports.clone()
    }

    /// Execute a main chunk to completion. The chunk is wrapped in a
    /// zero-arity closure and run until `HALT`, a top-level `RETURN`, or an
    /// error. Errors unwind every frame, closing their upvalues.
    pub fn run(&mut self, chunk: Chunk) -> Result<Value, RuntimeError> {
        let function = Rc::new(BytecodeFunction {
            name: "<main>".to_string(),
            arity: 0,
            upvalue_count: 0,
            chunk,
        });
        let closure = Rc::new(Closure {
            function,
            upvalues: Vec::new(),
        });
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            stack_offset: 0,
            return_slot: 0,
        });

        match self.dispatch(0) {
            Ok(value) => {
                self.frames.clear();
                self.stack.clear();
                Ok(value)
            }
            Err(mut err) => {
                if err.line.is_none() {
                    if let Some(line) = self.current_line {
                        err = err.with_line(line);
                    }
                }
                self.unwind();
                Err(err)
            }
        }
    }

    /// Re-enter the VM from a native: call `callable` with `args` and run
    /// until that call returns. This is the only sanctioned re-entrancy.
    pub fn invoke(&mut self, callable: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let stack_base = self.stack.len();
        let frame_base = self.frames.len();
        self.stack.push(callable);
        for arg in args {
            self.stack.push(arg.clone());
        }
        let pushed_frame = self.call_value(args.len())?;
        let result = if pushed_frame {
            self.dispatch(frame_base)?
        } else {
            self.pop()?
        };
        self.stack.truncate(stack_base);
        Ok(result)
    }

    fn unwind(&mut self) {
        while let Some(frame) = self.frames.pop() {
            self.close_upvalues(frame.stack_offset);
        }
        self.stack.clear();
        self.open_upvalues.clear();
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Fetch/decode/execute until the frame stack drops back to `base`
    /// (nested invocation) or execution terminates (`HALT`, or a `RETURN`
    /// that empties the frame stack). Returns the produced value.
    fn dispatch(&mut self, base: usize) -> Result<Value, RuntimeError> {
        loop {
            if self.stack.len() > self.options.max_stack {
                return Err(internal("value stack limit exceeded"));
            }
            {
                let frame = self
                    .frames
                    .last()
                    .ok_or_else(|| internal("dispatch without an active frame"))?;
                self.current_line = frame.closure.function.chunk.line_at(frame.ip);
            }
            let byte = self.read_byte()?;
            let op = Op::from_byte(byte)
                .ok_or_else(|| internal(format!("unknown opcode 0x{:02X}", byte)))?;

            match op {
                Op::PushConst => {
                    let k = self.read_byte()? as usize;
                    let value = self.constant(k)?;
                    self.stack.push(value);
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::Dup => {
                    let top = self.peek()?.clone();
                    self.stack.push(top);
                }

                Op::Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
                        _ if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) => {
                            Value::str(format!("{}{}", a, b))
                        }
                        _ => {
                            return Err(type_mismatch(format!(
                                "cannot add {} and {}",
                                a.type_name(),
                                b.type_name()
                            )))
                        }
                    };
                    self.stack.push(result);
                }
                Op::Sub => {
                    let (a, b) = self.numeric_operands("-")?;
                    self.stack.push(Value::Number(a - b));
                }
                Op::Mul => {
                    let (a, b) = self.numeric_operands("*")?;
                    self.stack.push(Value::Number(a * b));
                }
                Op::Div => {
                    let (a, b) = self.numeric_operands("/")?;
                    if b == 0.0 {
                        return Err(division_by_zero());
                    }
                    self.stack.push(Value::Number(a / b));
                }
                Op::Mod => {
                    let (a, b) = self.numeric_operands("%")?;
                    if b == 0.0 {
                        return Err(division_by_zero());
                    }
                    self.stack.push(Value::Number(a % b));
                }
                Op::Neg => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(n) => self.stack.push(Value::Number(-n)),
                        other => {
                            return Err(type_mismatch(format!(
                                "cannot negate a {}",
                                other.type_name()
                            )))
                        }
                    }
                }

                Op::Eq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Bool(a == b));
                }
                Op::Neq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Bool(a != b));
                }
                Op::Lt => {
                    let (a, b) = self.numeric_operands("<")?;
                    self.stack.push(Value::Bool(a < b));
                }
                Op::Lte => {
                    let (a, b) = self.numeric_operands("<=")?;
                    self.stack.push(Value::Bool(a <= b));
                }
                Op::Gt => {
                    let (a, b) = self.numeric_operands(">")?;
                    self.stack.push(Value::Bool(a > b));
                }
                Op::Gte => {
                    let (a, b) = self.numeric_operands(">=")?;
                    self.stack.push(Value::Bool(a >= b));
                }
                Op::Not => {
                    let value = self.pop()?;
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }

                Op::Load => {
                    let slot = self.read_byte()? as usize;
                    let index = self.frame()?.stack_offset + slot;
                    let value = self
                        .stack
                        .get(index)
                        .cloned()
                        .ok_or_else(|| internal("local slot out of range"))?;
                    self.stack.push(value);
                }
                Op::Store => {
                    let slot = self.read_byte()? as usize;
                    let index = self.frame()?.stack_offset + slot;
                    let value = self.peek()?.clone();
                    *self
                        .stack
                        .get_mut(index)
                        .ok_or_else(|| internal("local slot out of range"))? = value;
                }
                Op::LoadGlobal => {
                    let k = self.read_byte()? as usize;
                    let name = self.constant_string(k)?;
                    let value = self
                        .globals
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| undefined_variable(&name))?;
                    self.stack.push(value);
                }
                Op::StoreGlobal => {
                    let k = self.read_byte()? as usize;
                    let name = self.constant_string(k)?;
                    let value = self.peek()?.clone();
                    self.globals.insert(name, value);
                }

                Op::Jump => {
                    let offset = self.read_byte()? as usize;
                    self.frame_mut()?.ip += offset;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_byte()? as usize;
                    if !self.peek()?.is_truthy() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                Op::JumpIfTrue => {
                    let offset = self.read_byte()? as usize;
                    if self.peek()?.is_truthy() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                Op::Loop => {
                    let offset = self.read_byte()? as usize;
                    let frame = self.frame_mut()?;
                    frame.ip = frame
                        .ip
                        .checked_sub(offset)
                        .ok_or_else(|| internal("backward jump before chunk start"))?;
                }

                Op::Call => {
                    let argc = self.read_byte()? as usize;
                    self.call_value(argc)?;
                }
                Op::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| internal("return without a frame"))?;
                    self.close_upvalues(frame.stack_offset);
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.stack.truncate(frame.return_slot);
                    self.stack.push(result.clone());
                    if self.frames.len() == base {
                        return Ok(result);
                    }
                }

                Op::MakeClosure => {
                    let k = self.read_byte()? as usize;
                    let function = match self.constant(k)? {
                        Value::Function(f) => f,
                        other => {
                            return Err(internal(format!(
                                "MAKE_CLOSURE operand is a {}",
                                other.type_name()
                            )))
                        }
                    };
                    let count = function.upvalue_count as usize;
                    let mut descriptors = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte()? != 0;
                        let index = self.read_byte()? as usize;
                        descriptors.push((is_local, index));
                    }
                    let stack_offset = self.frame()?.stack_offset;
                    let mut upvalues = Vec::with_capacity(count);
                    for (is_local, index) in descriptors {
                        if is_local {
                            upvalues.push(self.capture_upvalue(stack_offset + index));
                        } else {
                            let upvalue = self
                                .frame()?
                                .closure
                                .upvalues
                                .get(index)
                                .cloned()
                                .ok_or_else(|| internal("upvalue index out of range"))?;
                            upvalues.push(upvalue);
                        }
                    }
                    self.stack
                        .push(Value::Closure(Rc::new(Closure { function, upvalues })));
                }
                Op::GetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let upvalue = self
                        .frame()?
                        .closure
                        .upvalues
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| internal("upvalue slot out of range"))?;
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(location) => self
                            .stack
                            .get(*location)
                            .cloned()
                            .ok_or_else(|| internal("open upvalue past stack top"))?,
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.stack.push(value);
                }
                Op::SetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let value = self.peek()?.clone();
                    let upvalue = self
                        .frame()?
                        .closure
                        .upvalues
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| internal("upvalue slot out of range"))?;
                    let open_location = match &*upvalue.borrow() {
                        Upvalue::Open(location) => Some(*location),
                        Upvalue::Closed(_) => None,
                    };
                    match open_location {
                        Some(location) => {
                            *self
                                .stack
                                .get_mut(location)
                                .ok_or_else(|| internal("open upvalue past stack top"))? = value;
                        }
                        None => *upvalue.borrow_mut() = Upvalue::Closed(value),
                    }
                }
                Op::CloseUpvalue => {
                    let top = self
                        .stack
                        .len()
                        .checked_sub(1)
                        .ok_or_else(|| internal("CLOSE_UPVALUE on empty stack"))?;
                    self.close_upvalues(top);
                    self.pop()?;
                }

                Op::Print => {
                    let value = self.pop()?;
                    let _ = writeln!(self.options.stdout, "{}", value);
                }
                Op::Eyeof => {
                    let value = self.pop()?;
                    let label = self.pop()?;
                    let _ = writeln!(self.options.debug_out, "{}:{}", label, value);
                }

                Op::MakeArray => {
                    let count = self.read_byte()? as usize;
                    if self.stack.len() < count {
                        return Err(internal("MAKE_ARRAY underflow"));
                    }
                    let items = self.stack.split_off(self.stack.len() - count);
                    self.stack.push(Value::array(items));
                }
                Op::MakeObject => {
                    let count = self.read_byte()? as usize;
                    if self.stack.len() < count * 2 {
                        return Err(internal("MAKE_OBJECT underflow"));
                    }
                    let flat = self.stack.split_off(self.stack.len() - count * 2);
                    let mut entries = indexmap::IndexMap::with_capacity(count);
                    for pair in flat.chunks(2) {
                        match &pair[0] {
                            Value::Str(key) => {
                                entries.insert(key.to_string(), pair[1].clone());
                            }
                            other => {
                                return Err(internal(format!(
                                    "map key is a {}",
                                    other.type_name()
                                )))
                            }
                        }
                    }
                    self.stack.push(Value::map(entries));
                }
                Op::IndexGet => {
                    let index = self.pop()?;
                    let object = self.pop()?;
                    let value = index_get(object, index)?;
                    self.stack.push(value);
                }
                Op::IndexSet => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let object = self.pop()?;
                    index_set(object, index, value.clone())?;
                    self.stack.push(value);
                }
                Op::Length => {
                    let value = self.pop()?;
                    let length = match &value {
                        Value::Array(items) => items.borrow().len(),
                        Value::Str(s) => s.chars().count(),
                        other => {
                            return Err(type_mismatch(format!(
                                "cannot take the length of a {}",
                                other.type_name()
                            )))
                        }
                    };
                    self.stack.push(Value::Number(length as f64));
                }
                Op::GetProp => {
                    let k = self.read_byte()? as usize;
                    let name = self.constant_string(k)?;
                    let object = self.pop()?;
                    let value = match &object {
                        Value::Map(entries) => {
                            entries.borrow().get(&name).cloned().unwrap_or(Value::Null)
                        }
                        other => {
                            return Err(type_mismatch(format!(
                                "cannot read property '{}' of a {}",
                                name,
                                other.type_name()
                            )))
                        }
                    };
                    self.stack.push(value);
                }
                Op::SetProp => {
                    let k = self.read_byte()? as usize;
                    let name = self.constant_string(k)?;
                    let value = self.pop()?;
                    let object = self.pop()?;
                    match &object {
                        Value::Map(entries) => {
                            entries.borrow_mut().insert(name, value.clone());
                        }
                        other => {
                            return Err(type_mismatch(format!(
                                "cannot set property '{}' on a {}",
                                name,
                                other.type_name()
                            )))
                        }
                    }
                    self.stack.push(value);
                }

                Op::Import => {
                    let k = self.read_byte()? as usize;
                    let key = self.constant_string(k)?;
                    let cached = self.module_cache.borrow().get(&key).cloned();
                    let exports = match cached {
                        Some(exports) => exports,
                        None => {
                            let mut loader =
                                self.options.module_loader.take().ok_or_else(|| {
                                    module_load_failure(format!(
                                        "no module loader installed (importing '{}')",
                                        key
                                    ))
                                })?;
                            let current = self.options.current_module_key.clone();
                            let cache = self.module_cache.clone();
                            let result = loader(&key, current.as_deref(), &cache);
                            self.options.module_loader = Some(loader);
                            let exports = result?;
                            self.module_cache
                                .borrow_mut()
                                .entry(key)
                                .or_insert_with(|| exports.clone());
                            exports
                        }
                    };
                    self.stack.push(Value::Map(exports));
                }
                Op::Export => {
                    let k = self.read_byte()? as usize;
                    let name = self.constant_string(k)?;
                    let value = self.pop()?;
                    self.exports.borrow_mut().insert(name, value);
                }

                Op::Halt => return Ok(Value::Null),
            }
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call the value sitting below `argc` arguments. Closures get a new
    /// frame (returns `true`); natives run synchronously and leave their
    /// result on the stack (returns `false`).
    fn call_value(&mut self, argc: usize) -> Result<bool, RuntimeError> {
        let callee_index = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| internal("call underflow"))?;
        let callee = self.stack[callee_index].clone();
        match callee {
            Value::Closure(closure) => {
                let arity = closure.function.arity as usize;
                if argc != arity {
                    return Err(arity_mismatch(&closure.function.name, arity, argc));
                }
                if self.frames.len() >= self.options.max_frames {
                    return Err(internal("frame depth limit exceeded"));
                }
                self.frames.push(CallFrame {
                    closure,
                    ip: 0,
                    stack_offset: self.stack.len() - argc,
                    return_slot: callee_index,
                });
                Ok(true)
            }
            Value::Native(native) => {
                if native.arity >= 0 && native.arity as usize != argc {
                    return Err(arity_mismatch(&native.name, native.arity as usize, argc));
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                self.stack.pop();
                let result = (native.func)(self, &args)?;
                self.stack.push(result);
                Ok(false)
            }
            other => Err(type_mismatch(format!(
                "cannot call a {}",
                other.type_name()
            ))),
        }
    }

    // =========================================================================
    // Upvalues
    // =========================================================================

    /// Find or create the open upvalue for a stack location. The list is
    /// kept ordered by descending location so closing can stop early.
    fn capture_upvalue(&mut self, location: usize) -> Rc<RefCell<Upvalue>> {
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate() {
            if let Upvalue::Open(existing) = &*upvalue.borrow() {
                if *existing == location {
                    return upvalue.clone();
                }
                if *existing < location {
                    insert_at = i;
                    break;
                }
            }
        }
        let created = Rc::new(RefCell::new(Upvalue::Open(location)));
        self.open_upvalues.insert(insert_at, created.clone());
        created
    }

    /// Close every open upvalue at or above `threshold`, copying the stack
    /// value into the upvalue's own cell. Sharers observe the close
    /// atomically because they hold the same cell.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(head) = self.open_upvalues.first() {
            let location = match &*head.borrow() {
                Upvalue::Open(location) => *location,
                Upvalue::Closed(_) => break,
            };
            if location < threshold {
                break;
            }
            let value = self.stack.get(location).cloned().unwrap_or(Value::Null);
            let head = self.open_upvalues.remove(0);
            *head.borrow_mut() = Upvalue::Closed(value);
        }
    }

    // =========================================================================
    // Fetch helpers
    // =========================================================================

    fn frame(&self) -> Result<&CallFrame, RuntimeError> {
        self.frames
            .last()
            .ok_or_else(|| internal("no active frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| internal("no active frame"))
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let frame = self.frame_mut()?;
        let byte = *frame
            .closure
            .function
            .chunk
            .code
            .get(frame.ip)
            .ok_or_else(|| internal("instruction pointer past end of code"))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn constant(&self, k: usize) -> Result<Value, RuntimeError> {
        self.frame()?
            .closure
            .function
            .chunk
            .constants
            .get(k)
            .cloned()
            .ok_or_else(|| internal("constant index out of range"))
    }

    fn constant_string(&self, k: usize) -> Result<String, RuntimeError> {
        match self.constant(k)? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(internal(format!(
                "expected a string constant, found a {}",
                other.type_name()
            ))),
        }
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| internal("value stack underflow"))
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack
            .last()
            .ok_or_else(|| internal("value stack underflow"))
    }

    fn numeric_operands(&mut self, op: &str) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => Ok((*x, *y)),
            _ => Err(type_mismatch(format!(
                "'{}' needs numbers, got {} and {}",
                op,
                a.type_name(),
                b.type_name()
            ))),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new(VmOptions::default())
    }
}

/// Read `object[index]`. Integer indexes past either end of an array or
/// string yield null rather than failing; fractional indexes are errors.
fn index_get(object: Value, index: Value) -> Result<Value, RuntimeError> {
    match &object {
        Value::Array(items) => {
            let items = items.borrow();
            Ok(match integer_index(&index, "array")? {
                Some(i) if i < items.len() => items[i].clone(),
                _ => Value::Null,
            })
        }
        Value::Str(s) => Ok(match integer_index(&index, "string")? {
            Some(i) => s
                .chars()
                .nth(i)
                .map(|c| Value::str(c.to_string()))
                .unwrap_or(Value::Null),
            None => Value::Null,
        }),
        Value::Map(entries) => match &index {
            Value::Str(key) => Ok(entries
                .borrow()
                .get(key.as_ref())
                .cloned()
                .unwrap_or(Value::Null)),
            other => Err(type_mismatch(format!(
                "map key must be a string, got {}",
                other.type_name()
            ))),
        },
        other => Err(type_mismatch(format!(
            "cannot index a {}",
            other.type_name()
        ))),
    }
}

fn index_set(object: Value, index: Value, value: Value) -> Result<(), RuntimeError> {
    match &object {
        Value::Array(items) => {
            let mut items = items.borrow_mut();
            match integer_index(&index, "array")? {
                Some(i) if i < items.len() => {
                    items[i] = value;
                    Ok(())
                }
                _ => Err(index_out_of_range(format!(
                    "array write at {} is out of bounds (length {})",
                    index,
                    items.len()
                ))),
            }
        }
        Value::Map(entries) => match &index {
            Value::Str(key) => {
                entries.borrow_mut().insert(key.to_string(), value);
                Ok(())
            }
            other => Err(type_mismatch(format!(
                "map key must be a string, got {}",
                other.type_name()
            ))),
        },
        other => Err(type_mismatch(format!(
            "cannot index-assign a {}",
            other.type_name()
        ))),
    }
}

fn integer_index(index: &Value, what: &str) -> Result<Option<usize>, RuntimeError> {
    match index {
        Value::Number(n) => {
            if n.fract() != 0.0 {
                return Err(index_out_of_range(format!(
                    "{} index must be an integer, got {}",
                    what, n
                )));
            }
            if *n < 0.0 {
                return Ok(None);
            }
            Ok(Some(*n as usize))
        }
        other => Err(type_mismatch(format!(
            "{} index must be a number, got {}",
            what,
            other.type_name()
        ))),
    }
}
