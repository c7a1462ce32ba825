//! The stack-based virtual machine.
//!
//! One value stack shared between operands and local slots: a frame's
//! locals live at `base..base+var_count`, so a call's arguments become the
//! callee's first locals with no copying. A 4-way scope dispatch
//! (local/free/global/const) backs every load, store and fused
//! super-instruction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use strand_bytecode::{Op, ScopeKind, Slot};
use tracing::trace;

use crate::compiler::CompiledProgram;
use crate::error::{VmError, VmResult};
use crate::executor::Executor;
use crate::registry::Registry;
use crate::value::{FunctionProto, Unit, Value};

const MAX_STACK: usize = 16 * 1024;
const MAX_FRAMES: usize = 1024;
/// The fetch loop polls the stop flag once per this many instructions, so
/// a cancelled fiber stops promptly even inside a hot loop.
const CANCEL_CHECK_INTERVAL: u32 = 64;

/// A runtime activation record.
pub(crate) struct Frame {
    proto: Arc<FunctionProto>,
    unit: Arc<Unit>,
    free: Vec<Value>,
    ip: usize,
    /// First local slot in the shared value stack.
    base: usize,
    /// Stack slot that receives the return value.
    ret_slot: usize,
    /// Return control to the host instead of continuing the fetch loop.
    halt_after: bool,
    has_try: bool,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    running: Arc<AtomicBool>,
    registry: Arc<Registry>,
    executor: Weak<Executor>,
}

impl Vm {
    pub fn new(registry: Arc<Registry>, executor: Weak<Executor>) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            running: Arc::new(AtomicBool::new(true)),
            registry,
            executor,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn executor(&self) -> Option<Arc<Executor>> {
        self.executor.upgrade()
    }

    /// The flag a task handle flips to cancel this VM's run.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Source path of the currently executing function, for relative
    /// imports.
    pub fn current_path(&self) -> Option<std::path::PathBuf> {
        self.frames.last().and_then(|f| f.proto.path.clone())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Reset a pooled VM for its next task.
    pub fn resurrect(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.running = Arc::new(AtomicBool::new(true));
    }

    /// Run a compiled top-level program. Its locals occupy the bottom of
    /// the stack, which is what makes global-scope slots absolute indices.
    pub fn run_program(&mut self, program: &CompiledProgram) -> VmResult<Value> {
        let frame = Frame {
            proto: program.entry.clone(),
            unit: program.unit.clone(),
            free: Vec::new(),
            ip: 0,
            base: 0,
            ret_slot: 0,
            halt_after: true,
            has_try: false,
        };
        self.push_frame(frame)?;
        self.execute()
    }

    /// Host-initiated call into a function value; re-entrant, so native
    /// builtins can call back into interpreted code.
    pub fn run_function(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        match callee {
            Value::Function(closure) => {
                let ret_slot = self.stack.len();
                self.stack.push(Value::Nil);
                for arg in args {
                    self.stack.push(arg.clone());
                }
                let frame = Frame {
                    proto: closure.proto.clone(),
                    unit: closure.unit.clone(),
                    free: closure.free.clone(),
                    ip: 0,
                    base: ret_slot + 1,
                    ret_slot,
                    halt_after: true,
                    has_try: false,
                };
                self.push_frame(frame)?;
                let result = self.execute();
                if result.is_ok() {
                    // Ret left the value at ret_slot; drop the call region.
                    self.stack.truncate(ret_slot);
                }
                result
            }
            Value::Native(nf) => (nf.func)(self, args),
            other => Err(VmError::fault(format!(
                "illegal callee type {}",
                other.type_name()
            ))),
        }
    }

    fn push_frame(&mut self, frame: Frame) -> VmResult<()> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::fault("call stack overflow"));
        }
        let needed = frame.base + frame.proto.var_count;
        if needed > MAX_STACK {
            return Err(VmError::fault("value stack overflow"));
        }
        // Arguments already occupy the leading slots; the rest start nil.
        while self.stack.len() < needed {
            self.stack.push(Value::Nil);
        }
        self.frames.push(frame);
        Ok(())
    }

    fn frame(&self) -> VmResult<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| VmError::fault("frame stack empty"))
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack empty")
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::fault("value stack underflow"))
    }

    fn abs_index(&self, slot: Slot) -> VmResult<usize> {
        let index = slot.index as usize;
        match slot.scope {
            ScopeKind::Global => Ok(index),
            ScopeKind::Local => Ok(self.frame()?.base + index),
            _ => Err(VmError::fault("slot has no stack address")),
        }
    }

    /// Scope-dispatched, ref-dereferencing read. Shared by `Load` and all
    /// fused super-instructions.
    fn read_slot(&self, slot: Slot) -> VmResult<Value> {
        let frame = self.frame()?;
        let index = slot.index as usize;
        let value = match slot.scope {
            ScopeKind::Local => self.stack.get(frame.base + index),
            ScopeKind::Global => self.stack.get(index),
            ScopeKind::Free => frame.free.get(index),
            ScopeKind::Const => frame.unit.constants.get(index),
        };
        value
            .map(Value::deref)
            .ok_or_else(|| VmError::fault(format!("slot {} out of range", slot)))
    }

    /// Scope-dispatched write; `is_ref` writes through the slot's cell so
    /// every closure sharing the capture observes the store.
    fn write_slot(&mut self, slot: Slot, is_ref: bool, value: Value) -> VmResult<()> {
        let index = slot.index as usize;
        let target: &mut Value = match slot.scope {
            ScopeKind::Local => {
                let base = self.frame()?.base;
                self.stack
                    .get_mut(base + index)
                    .ok_or_else(|| VmError::fault(format!("slot {} out of range", slot)))?
            }
            ScopeKind::Global => self
                .stack
                .get_mut(index)
                .ok_or_else(|| VmError::fault(format!("slot {} out of range", slot)))?,
            ScopeKind::Free => self
                .frames
                .last_mut()
                .expect("frame stack empty")
                .free
                .get_mut(index)
                .ok_or_else(|| VmError::fault(format!("slot {} out of range", slot)))?,
            ScopeKind::Const => {
                return Err(VmError::fault("cannot store into a constant"));
            }
        };

        if is_ref {
            if let Value::Ref(cell) = target {
                *cell.write() = value;
                return Ok(());
            }
        }
        *target = value;
        Ok(())
    }

    /// Ensure the slot holds a shared ref cell and return the cell. Runs
    /// at closure creation for every captured variable.
    fn upgrade_ref(&mut self, slot: Slot) -> VmResult<Value> {
        let index = slot.index as usize;
        let target: &mut Value = match slot.scope {
            ScopeKind::Local | ScopeKind::Global => {
                let abs = self.abs_index(slot)?;
                self.stack
                    .get_mut(abs)
                    .ok_or_else(|| VmError::fault(format!("slot {} out of range", slot)))?
            }
            ScopeKind::Free => self
                .frames
                .last_mut()
                .expect("frame stack empty")
                .free
                .get_mut(index)
                .ok_or_else(|| VmError::fault(format!("slot {} out of range", slot)))?,
            ScopeKind::Const => {
                return Err(VmError::fault("cannot capture a constant by reference"));
            }
        };

        if !matches!(target, Value::Ref(_)) {
            let plain = std::mem::replace(target, Value::Nil);
            *target = Value::Ref(Arc::new(RwLock::new(plain)));
        }
        Ok(target.clone())
    }

    /// Route a raised error value: a `try` in the current frame receives
    /// it as the expression result, otherwise it unwinds.
    fn deliver_error(&mut self, error: Value) -> VmResult<()> {
        if self.frames.last().map(|f| f.has_try).unwrap_or(false) {
            self.stack.push(error);
            return Ok(());
        }
        self.raise(error)
    }

    /// Unwind frames until a caller with the try flag catches the error,
    /// depositing it where the call's result would have gone. Unwinding
    /// past a host boundary hands the error back to the host.
    fn raise(&mut self, error: Value) -> VmResult<()> {
        loop {
            let Some(current) = self.frames.pop() else {
                return Err(VmError::Raise(error));
            };
            if current.halt_after {
                self.stack.truncate(current.ret_slot);
                return Err(VmError::Raise(error));
            }
            if let Some(parent) = self.frames.last() {
                if parent.has_try {
                    self.stack.truncate(current.ret_slot);
                    self.stack.push(error);
                    return Ok(());
                }
            }
        }
    }

    /// The fetch-decode-execute loop. Returns when the innermost
    /// `halt_after` frame returns (or the program halts), when an error
    /// unwinds past it, or on a fault.
    fn execute(&mut self) -> VmResult<Value> {
        let mut cancel_countdown = CANCEL_CHECK_INTERVAL;

        loop {
            cancel_countdown -= 1;
            if cancel_countdown == 0 {
                cancel_countdown = CANCEL_CHECK_INTERVAL;
                if !self.running.load(Ordering::Relaxed) {
                    trace!("run cancelled");
                    return Ok(Value::Nil);
                }
            }

            let frame = self.frame()?;
            let Some(&op) = frame.proto.ops.get(frame.ip) else {
                return Err(VmError::fault("instruction pointer out of range"));
            };
            self.frame_mut().ip += 1;

            match op {
                Op::Label(_) => {}

                Op::Load(slot) => {
                    let value = self.read_slot(slot)?;
                    self.stack.push(value);
                }

                Op::UpgradeRef(slot) => {
                    let cell = self.upgrade_ref(slot)?;
                    self.stack.push(cell);
                }

                Op::Store(slot, is_ref) => {
                    let value = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| VmError::fault("value stack underflow"))?;
                    self.write_slot(slot, is_ref, value)?;
                }

                Op::Let(slot, is_ref) => {
                    let value = self.pop()?;
                    self.write_slot(slot, is_ref, value)?;
                }

                Op::LoadLet(src, dst, is_ref) => {
                    let value = self.read_slot(src)?;
                    self.write_slot(dst, is_ref, value)?;
                }

                Op::Pop => {
                    self.pop()?;
                }

                Op::Bin(bin) => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    match Value::binary(bin, &left, &right) {
                        Ok(value) => self.stack.push(value),
                        Err(VmError::Raise(e)) => self.deliver_error(e)?,
                        Err(fault) => return Err(fault),
                    }
                }

                Op::LoadLoadBin(bin, a, b) => {
                    let left = self.read_slot(a)?;
                    let right = self.read_slot(b)?;
                    match Value::binary(bin, &left, &right) {
                        Ok(value) => self.stack.push(value),
                        Err(VmError::Raise(e)) => self.deliver_error(e)?,
                        Err(fault) => return Err(fault),
                    }
                }

                Op::LoadBin(bin, a) => {
                    let right = self.read_slot(a)?;
                    let left = self.pop()?;
                    match Value::binary(bin, &left, &right) {
                        Ok(value) => self.stack.push(value),
                        Err(VmError::Raise(e)) => self.deliver_error(e)?,
                        Err(fault) => return Err(fault),
                    }
                }

                Op::Not => {
                    let value = self.pop()?;
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }

                Op::Neg => {
                    let value = self.pop()?;
                    self.stack.push(value.negate()?);
                }

                Op::Array => {
                    self.stack.push(Value::array(Vec::new()));
                }

                Op::ArrayPush => {
                    let value = self.pop()?;
                    match self.stack.last() {
                        Some(Value::Array(items)) => items.write().push(value),
                        _ => return Err(VmError::fault("apush target is not an array")),
                    }
                }

                Op::Object => {
                    self.stack.push(Value::object(Default::default()));
                }

                Op::ObjectPush => {
                    let key = self.pop()?;
                    let value = self.pop()?;
                    let Value::String(key) = key else {
                        return Err(VmError::fault("object key is not a string"));
                    };
                    match self.stack.last() {
                        Some(Value::Object(map)) => {
                            map.write().insert(key.to_string(), value);
                        }
                        _ => return Err(VmError::fault("opush target is not an object")),
                    }
                }

                Op::Index => {
                    let index = self.pop()?;
                    let target = self.pop()?;
                    self.stack.push(target.index(&index));
                }

                Op::StoreIndex => {
                    let index = self.pop()?;
                    let target = self.pop()?;
                    let value = self.pop()?;
                    match target.set_index(&index, value) {
                        Ok(()) => self.stack.push(target),
                        Err(VmError::Raise(e)) => self.deliver_error(e)?,
                        Err(fault) => return Err(fault),
                    }
                }

                Op::Func { constant, captured } => {
                    let mut free = Vec::with_capacity(captured as usize);
                    for _ in 0..captured {
                        free.push(self.pop()?);
                    }
                    let frame = self.frame()?;
                    let proto = frame
                        .unit
                        .protos
                        .get(constant as usize)
                        .ok_or_else(|| VmError::fault("function constant out of range"))?
                        .clone();
                    let unit = frame.unit.clone();
                    self.stack.push(Value::Function(Arc::new(
                        crate::value::Closure { proto, unit, free },
                    )));
                }

                Op::Call(argc) => self.call(argc as usize)?,

                Op::Ret => {
                    let value = self.pop()?;
                    let finished = self.frames.pop().expect("ret without a frame");
                    self.stack.truncate(finished.ret_slot);
                    self.stack.push(value.clone());
                    if finished.halt_after {
                        return Ok(value);
                    }
                }

                Op::Jump(target) => {
                    self.frame_mut().ip = target as usize;
                }

                Op::PJumpF(target) => {
                    let value = self.pop()?;
                    if !value.is_truthy() {
                        self.frame_mut().ip = target as usize;
                    }
                }

                Op::PJumpT(target) => {
                    let value = self.pop()?;
                    if value.is_truthy() {
                        self.frame_mut().ip = target as usize;
                    }
                }

                Op::JumpF(target) => {
                    let truthy = self
                        .stack
                        .last()
                        .map(Value::is_truthy)
                        .ok_or_else(|| VmError::fault("value stack underflow"))?;
                    if !truthy {
                        self.frame_mut().ip = target as usize;
                    }
                }

                Op::JumpT(target) => {
                    let truthy = self
                        .stack
                        .last()
                        .map(Value::is_truthy)
                        .ok_or_else(|| VmError::fault("value stack underflow"))?;
                    if truthy {
                        self.frame_mut().ip = target as usize;
                    }
                }

                Op::Try => {
                    let frame = self.frame_mut();
                    frame.has_try = !frame.has_try;
                }

                Op::Raise => {
                    let value = self.pop()?;
                    self.raise(value)?;
                }

                Op::Halt => {
                    let finished = self.frames.pop().expect("halt without a frame");
                    self.stack.truncate(finished.ret_slot);
                    return Ok(Value::Nil);
                }
            }
        }
    }

    fn call(&mut self, argc: usize) -> VmResult<()> {
        let callee_idx = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| VmError::fault("value stack underflow"))?;
        let callee = self.stack[callee_idx].clone();

        match callee {
            Value::Function(closure) => {
                let frame = Frame {
                    proto: closure.proto.clone(),
                    unit: closure.unit.clone(),
                    free: closure.free.clone(),
                    ip: 0,
                    base: callee_idx + 1,
                    ret_slot: callee_idx,
                    halt_after: false,
                    has_try: false,
                };
                self.push_frame(frame)
            }
            Value::Native(nf) => {
                let args = self.stack.split_off(callee_idx + 1);
                self.stack.pop();
                match (nf.func)(self, &args) {
                    Ok(value) => {
                        self.stack.push(value);
                        Ok(())
                    }
                    Err(VmError::Raise(e)) => self.deliver_error(e),
                    Err(fault) => Err(fault),
                }
            }
            other => Err(VmError::fault(format!(
                "illegal callee type {}",
                other.type_name()
            ))),
        }
    }
}
