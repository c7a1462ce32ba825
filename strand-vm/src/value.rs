//! Runtime value representation: a closed sum type with scalar variants
//! inline and reference variants behind shared ownership handles.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use strand_bytecode::{BinOp, Op};

use crate::concurrent::{ChannelValue, LockValue, TaskHandle};
use crate::error::{VmError, VmResult};
use crate::vm::Vm;

/// A compiled function body. Shared between every closure instantiated
/// from the same literal.
#[derive(Debug)]
pub struct FunctionProto {
    pub ops: Vec<Op>,
    /// Local slot count, parameters included.
    pub var_count: usize,
    pub param_count: usize,
    /// Source file this function was compiled from, for relative imports.
    pub path: Option<PathBuf>,
}

/// One compilation unit: the flat constant pool shared by every function
/// in the unit, plus the compiled function bodies.
///
/// Function constants live in their own table beside the scalar pool; this
/// keeps the ownership graph acyclic (protos never point back at the pool).
#[derive(Debug, Default)]
pub struct Unit {
    pub constants: Vec<Value>,
    pub protos: Vec<Arc<FunctionProto>>,
}

/// An instantiated closure: proto + the captured cell values.
#[derive(Debug)]
pub struct Closure {
    pub proto: Arc<FunctionProto>,
    pub unit: Arc<Unit>,
    pub free: Vec<Value>,
}

pub type NativeFn = Arc<dyn Fn(&mut Vm, &[Value]) -> VmResult<Value> + Send + Sync>;

/// A host-implemented callable. Receives the invoking VM so it can call
/// back into interpreted functions.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Arc<str>,
    pub func: NativeFn,
}

impl NativeFunction {
    pub fn new(
        name: &str,
        func: impl Fn(&mut Vm, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An error value: the only recoverable error channel for programs.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub message: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(Arc<str>),
    Array(Arc<RwLock<Vec<Value>>>),
    Object(Arc<RwLock<FxHashMap<String, Value>>>),
    Function(Arc<Closure>),
    Native(NativeFunction),
    Error(Arc<ErrorValue>),
    Task(Arc<TaskHandle>),
    Channel(Arc<ChannelValue>),
    Lock(Arc<LockValue>),
    /// Transparent indirection cell for captured bindings; every accessor
    /// dereferences automatically.
    Ref(Arc<RwLock<Value>>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn object(map: FxHashMap<String, Value>) -> Value {
        Value::Object(Arc::new(RwLock::new(map)))
    }

    pub fn error(message: impl Into<String>, data: Value) -> Value {
        Value::Error(Arc::new(ErrorValue {
            message: message.into(),
            data,
        }))
    }

    pub fn native(
        name: &str,
        func: impl Fn(&mut Vm, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    ) -> Value {
        Value::Native(NativeFunction::new(name, func))
    }

    /// Resolve a ref cell to the value it holds.
    pub fn deref(&self) -> Value {
        match self {
            Value::Ref(cell) => cell.read().clone(),
            other => other.clone(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Native(_) => "native function",
            Value::Error(_) => "error",
            Value::Task(_) => "task",
            Value::Channel(_) => "channel",
            Value::Lock(_) => "lock",
            Value::Ref(cell) => cell.read().type_name(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Nil => false,
            Value::Error(_) => false,
            Value::Ref(cell) => cell.read().is_truthy(),
            _ => true,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Language equality. Scalars compare by value (ints and floats
    /// cross-compare), strings by content, arrays and functions by
    /// identity; everything else is unequal.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn negate(&self) -> VmResult<Value> {
        match self {
            Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
            Value::Float(v) => Ok(Value::Float(-v)),
            other => Err(VmError::fault(format!(
                "illegal operation -{}",
                other.type_name()
            ))),
        }
    }

    /// Apply a binary operator. This single dispatch backs the plain `Bin`
    /// opcode and every fused super-instruction.
    pub fn binary(op: BinOp, left: &Value, right: &Value) -> VmResult<Value> {
        use Value::*;
        match op {
            BinOp::Add => match (left, right) {
                (Int(a), Int(b)) => Ok(Int(a.wrapping_add(*b))),
                (String(a), String(b)) => {
                    let mut s = std::string::String::with_capacity(a.len() + b.len());
                    s.push_str(a);
                    s.push_str(b);
                    Ok(Value::string(s))
                }
                _ => numeric(op, left, right, |a, b| a + b),
            },
            BinOp::Sub => match (left, right) {
                (Int(a), Int(b)) => Ok(Int(a.wrapping_sub(*b))),
                _ => numeric(op, left, right, |a, b| a - b),
            },
            BinOp::Mul => match (left, right) {
                (Int(a), Int(b)) => Ok(Int(a.wrapping_mul(*b))),
                _ => numeric(op, left, right, |a, b| a * b),
            },
            BinOp::Div => match (left, right) {
                (Int(_), Int(0)) => Err(VmError::raise("division by zero")),
                (Int(a), Int(b)) => Ok(Int(a.wrapping_div(*b))),
                _ => numeric(op, left, right, |a, b| a / b),
            },
            BinOp::Mod => match (left, right) {
                (Int(_), Int(0)) => Err(VmError::raise("division by zero")),
                (Int(a), Int(b)) => Ok(Int(a.wrapping_rem(*b))),
                _ => Err(illegal(op, left, right)),
            },
            BinOp::Eq => Ok(Bool(left.equals(right))),
            BinOp::Ne => Ok(Bool(!left.equals(right))),
            BinOp::Lt => compare(op, left, right, |o| o == std::cmp::Ordering::Less),
            BinOp::Le => compare(op, left, right, |o| o != std::cmp::Ordering::Greater),
            BinOp::Gt => compare(op, left, right, |o| o == std::cmp::Ordering::Greater),
            BinOp::Ge => compare(op, left, right, |o| o != std::cmp::Ordering::Less),
        }
    }

    /// Index get. Out-of-bounds array access yields an error value, a
    /// missing object key yields nil; both are ordinary results, never
    /// faults.
    pub fn index(&self, idx: &Value) -> Value {
        match (self, idx) {
            (Value::Array(items), Value::Int(i)) => {
                let items = items.read();
                if *i >= 0 && (*i as usize) < items.len() {
                    items[*i as usize].clone()
                } else {
                    Value::error(
                        format!("array index {} out of bounds (len {})", i, items.len()),
                        Value::Nil,
                    )
                }
            }
            (Value::Object(map), Value::String(key)) => {
                map.read().get(key.as_ref()).cloned().unwrap_or(Value::Nil)
            }
            (Value::Error(err), Value::String(key)) => match key.as_ref() {
                "msg" => Value::string(&err.message),
                "data" => err.data.clone(),
                _ => Value::Nil,
            },
            (Value::Lock(lock), Value::String(key)) => match key.as_ref() {
                "lock" => LockValue::lock_fn(lock.clone()),
                "unlock" => LockValue::unlock_fn(lock.clone()),
                _ => Value::Nil,
            },
            _ => Value::Nil,
        }
    }

    /// Index set. Out-of-range array writes raise; a wrong index type is a
    /// contract fault.
    pub fn set_index(&self, idx: &Value, val: Value) -> VmResult<()> {
        match (self, idx) {
            (Value::Array(items), Value::Int(i)) => {
                let mut items = items.write();
                if *i >= 0 && (*i as usize) < items.len() {
                    items[*i as usize] = val;
                    Ok(())
                } else {
                    Err(VmError::raise(format!(
                        "array index {} out of bounds (len {})",
                        i,
                        items.len()
                    )))
                }
            }
            (Value::Array(_), other) => Err(VmError::fault(format!(
                "invalid array index type {}",
                other.type_name()
            ))),
            (Value::Object(map), Value::String(key)) => {
                map.write().insert(key.to_string(), val);
                Ok(())
            }
            (Value::Object(_), other) => Err(VmError::fault(format!(
                "invalid object index type {}",
                other.type_name()
            ))),
            (target, _) => Err(VmError::fault(format!(
                "cannot assign into {}",
                target.type_name()
            ))),
        }
    }
}

fn numeric(op: BinOp, left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> VmResult<Value> {
    match (as_float(left), as_float(right)) {
        (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
        _ => Err(illegal(op, left, right)),
    }
}

fn compare(
    op: BinOp,
    left: &Value,
    right: &Value,
    f: impl Fn(std::cmp::Ordering) -> bool,
) -> VmResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        return Ok(Value::Bool(f(a.cmp(b))));
    }
    match (as_float(left), as_float(right)) {
        (Some(a), Some(b)) => Ok(Value::Bool(a
            .partial_cmp(&b)
            .map(&f)
            .unwrap_or(false))),
        _ => Err(illegal(op, left, right)),
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(v) => Some(*v as f64),
        Value::Float(v) => Some(*v),
        _ => None,
    }
}

fn illegal(op: BinOp, left: &Value, right: &Value) -> VmError {
    VmError::fault(format!(
        "illegal operation {} {} {}",
        left.type_name(),
        op,
        right.type_name()
    ))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl Value {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Array(items) => {
                writeln!(f, "[")?;
                for item in items.read().iter() {
                    write!(f, "{}  ", pad)?;
                    item.write_indented(f, depth + 1)?;
                    writeln!(f)?;
                }
                write!(f, "{}]", pad)
            }
            Value::Object(map) => {
                writeln!(f, "{{")?;
                for (key, value) in map.read().iter() {
                    write!(f, "{}  {}: ", pad, key)?;
                    value.write_indented(f, depth + 1)?;
                    writeln!(f)?;
                }
                write!(f, "{}}}", pad)
            }
            Value::Function(_) => write!(f, "function"),
            Value::Native(nf) => write!(f, "native function {}", nf.name),
            Value::Error(err) => {
                if matches!(err.data, Value::Nil) {
                    write!(f, "error({})", err.message)
                } else {
                    write!(f, "error({}, {})", err.message, err.data)
                }
            }
            Value::Task(_) => write!(f, "task"),
            Value::Channel(_) => write!(f, "channel"),
            Value::Lock(_) => write!(f, "lock"),
            Value::Ref(cell) => cell.read().write_indented(f, depth),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_promotes_ints_to_floats() {
        let v = Value::binary(BinOp::Add, &Value::Int(1), &Value::Float(2.5)).unwrap();
        assert!(matches!(v, Value::Float(x) if x == 3.5));

        let v = Value::binary(BinOp::Add, &Value::Int(1), &Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Int(3)));
    }

    #[test]
    fn integer_division_truncates() {
        let v = Value::binary(BinOp::Div, &Value::Int(7), &Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Int(3)));
    }

    #[test]
    fn division_by_zero_raises() {
        let err = Value::binary(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(matches!(err, VmError::Raise(_)));
    }

    #[test]
    fn illegal_operand_types_fault() {
        let err = Value::binary(BinOp::Add, &Value::Int(1), &Value::Bool(true)).unwrap_err();
        assert!(matches!(err, VmError::Fault(_)));
    }

    #[test]
    fn string_concat() {
        let v = Value::binary(BinOp::Add, &Value::string("a"), &Value::string("b")).unwrap();
        assert!(matches!(v, Value::String(s) if s.as_ref() == "ab"));
    }

    #[test]
    fn arrays_compare_by_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert!(a.equals(&a.clone()));
        assert!(!a.equals(&b));
    }

    #[test]
    fn out_of_bounds_get_is_an_error_value() {
        let a = Value::array(vec![Value::Int(1)]);
        assert!(a.index(&Value::Int(5)).is_error());
        assert!(a.index(&Value::Int(-1)).is_error());
    }

    #[test]
    fn missing_object_key_is_nil() {
        let o = Value::object(FxHashMap::default());
        assert!(matches!(o.index(&Value::string("missing")), Value::Nil));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::error("e", Value::Nil).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::string("").is_truthy());
    }

    #[test]
    fn refs_are_transparent() {
        let cell = Value::Ref(Arc::new(RwLock::new(Value::Int(3))));
        assert_eq!(cell.type_name(), "int");
        assert!(matches!(cell.deref(), Value::Int(3)));
    }
}
