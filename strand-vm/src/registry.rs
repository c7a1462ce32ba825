//! Native function and builtin module registry.
//!
//! Built once at startup and threaded explicitly through lowering (name
//! set), bytecode compilation (constant resolution) and the executor; no
//! process-wide singleton.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{VmError, VmResult};
use crate::value::{NativeFunction, Value};
use crate::vm::Vm;

/// A builtin module is either a finished value map or a zero-arg factory
/// for modules that need fresh per-resolve state.
#[derive(Clone)]
pub enum ModuleDef {
    Static(Value),
    Factory(Arc<dyn Fn() -> Value + Send + Sync>),
}

#[derive(Default)]
pub struct RegistryBuilder {
    funcs: FxHashMap<String, Value>,
    modules: FxHashMap<String, ModuleDef>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_func(
        &mut self,
        name: &str,
        func: impl Fn(&mut Vm, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    ) -> &mut Self {
        self.funcs
            .insert(name.to_string(), Value::Native(NativeFunction::new(name, func)));
        self
    }

    pub fn register_static_module(&mut self, name: &str, value: Value) -> &mut Self {
        self.modules
            .insert(name.to_string(), ModuleDef::Static(value));
        self
    }

    pub fn register_module(
        &mut self,
        name: &str,
        factory: impl Fn() -> Value + Send + Sync + 'static,
    ) -> &mut Self {
        self.modules
            .insert(name.to_string(), ModuleDef::Factory(Arc::new(factory)));
        self
    }

    pub fn build(self) -> Registry {
        let names = self
            .funcs
            .keys()
            .chain(self.modules.keys())
            .cloned()
            .collect();
        Registry {
            funcs: self.funcs,
            modules: self.modules,
            names,
        }
    }
}

pub struct Registry {
    funcs: FxHashMap<String, Value>,
    modules: FxHashMap<String, ModuleDef>,
    names: FxHashSet<String>,
}

impl Registry {
    pub fn resolve_func(&self, name: &str) -> Option<Value> {
        self.funcs.get(name).cloned()
    }

    /// Resolve a builtin module, invoking its factory if it has one.
    pub fn resolve_module(&self, name: &str) -> Option<Value> {
        match self.modules.get(name)? {
            ModuleDef::Static(value) => Some(value.clone()),
            ModuleDef::Factory(factory) => Some(factory()),
        }
    }

    /// Every name the registry can resolve; this is what lowering treats
    /// as the known-builtin set.
    pub fn names(&self) -> &FxHashSet<String> {
        &self.names
    }
}

/// Argument accessor for native functions. Missing arguments and type
/// mismatches raise error values, mirroring how scripts see them.
pub struct Args<'a>(pub &'a [Value]);

impl<'a> Args<'a> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, i: usize) -> VmResult<&'a Value> {
        self.0
            .get(i)
            .ok_or_else(|| VmError::raise("invalid number of arguments"))
    }

    pub fn string(&self, i: usize) -> VmResult<Arc<str>> {
        match self.get(i)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(self.type_error(other, "string")),
        }
    }

    pub fn int(&self, i: usize) -> VmResult<i64> {
        match self.get(i)? {
            Value::Int(v) => Ok(*v),
            other => Err(self.type_error(other, "int")),
        }
    }

    /// Accepts int or float.
    pub fn number(&self, i: usize) -> VmResult<f64> {
        match self.get(i)? {
            Value::Int(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            other => Err(self.type_error(other, "number")),
        }
    }

    pub fn array(&self, i: usize) -> VmResult<Arc<parking_lot::RwLock<Vec<Value>>>> {
        match self.get(i)? {
            Value::Array(items) => Ok(items.clone()),
            other => Err(self.type_error(other, "array")),
        }
    }

    pub fn function(&self, i: usize) -> VmResult<Value> {
        match self.get(i)? {
            f @ (Value::Function(_) | Value::Native(_)) => Ok(f.clone()),
            other => Err(self.type_error(other, "function")),
        }
    }

    pub fn channel(&self, i: usize) -> VmResult<Arc<crate::concurrent::ChannelValue>> {
        match self.get(i)? {
            Value::Channel(ch) => Ok(ch.clone()),
            other => Err(self.type_error(other, "channel")),
        }
    }

    pub fn task(&self, i: usize) -> VmResult<Arc<crate::concurrent::TaskHandle>> {
        match self.get(i)? {
            Value::Task(task) => Ok(task.clone()),
            other => Err(self.type_error(other, "task")),
        }
    }

    fn type_error(&self, got: &Value, expected: &str) -> VmError {
        VmError::raise(format!(
            "invalid argument type {}, expected {}",
            got.type_name(),
            expected
        ))
    }
}
