//! The fiber executor: pooled VM instances dispatched onto native worker
//! threads, with once-guarded task completion.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use crate::compiler::CompiledProgram;
use crate::concurrent::TaskHandle;
use crate::error::{VmError, VmResult};
use crate::registry::Registry;
use crate::value::Value;
use crate::vm::Vm;

pub struct Executor {
    registry: Arc<Registry>,
    /// Idle VM instances, reused to avoid reallocating stacks per task.
    pool: Mutex<Vec<Vm>>,
}

impl Executor {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pool: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn acquire(self: &Arc<Self>) -> Vm {
        let vm = self.pool.lock().pop();
        match vm {
            Some(mut vm) => {
                vm.resurrect();
                vm
            }
            None => Vm::new(self.registry.clone(), Arc::downgrade(self)),
        }
    }

    fn release(&self, vm: Vm) {
        self.pool.lock().push(vm);
    }

    /// Run a top-level program on a pooled VM.
    pub fn run_main(self: &Arc<Self>, program: &CompiledProgram) -> VmResult<Value> {
        let mut vm = self.acquire();
        vm.resurrect();
        let result = vm.run_program(program);
        self.release(vm);
        result
    }

    /// Run a function concurrently, returning its task value immediately.
    /// A fault terminates only this fiber and becomes the task's result.
    pub fn spawn(self: &Arc<Self>, callee: Value, args: Vec<Value>) -> VmResult<Value> {
        if !matches!(callee, Value::Function(_) | Value::Native(_)) {
            return Err(VmError::raise(format!(
                "invalid argument type {}, expected function",
                callee.type_name()
            )));
        }

        let mut vm = self.acquire();
        let task = Arc::new(TaskHandle::new(vm.running_flag()));

        let executor = self.clone();
        let worker_task = task.clone();
        thread::Builder::new()
            .name("strand-fiber".to_string())
            .spawn(move || {
                let outcome = vm.run_function(callee, &args);
                let value = match outcome {
                    Ok(value) => value,
                    Err(VmError::Raise(error)) => error,
                    Err(VmError::Fault(msg)) => {
                        debug!(%msg, "fiber faulted");
                        Value::error(format!("fault: {}", msg), Value::Nil)
                    }
                };
                // A cancelled task already resolved; completion loses.
                worker_task.complete(value);
                executor.release(vm);
            })
            .map_err(|e| VmError::fault(format!("failed to spawn fiber: {}", e)))?;

        Ok(Value::Task(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompilerOptions};
    use crate::stdlib::std_registry;
    use strand_ir::lower;
    use strand_syntax::parse;

    fn program(src: &str) -> (Arc<Executor>, CompiledProgram) {
        let registry = Arc::new(std_registry());
        let ast = parse(src).unwrap();
        let ir = lower(&ast, registry.names()).unwrap();
        let compiled = compile(&ir, &registry, CompilerOptions::default(), None).unwrap();
        (Executor::new(registry), compiled)
    }

    #[test]
    fn vms_are_pooled_across_runs() {
        let (executor, compiled) = program("x := 1");
        executor.run_main(&compiled).unwrap();
        assert_eq!(executor.pool.lock().len(), 1);
        executor.run_main(&compiled).unwrap();
        assert_eq!(executor.pool.lock().len(), 1);
    }

    #[test]
    fn spawn_rejects_non_functions() {
        let (executor, _) = program("x := 1");
        assert!(executor.spawn(Value::Int(1), vec![]).is_err());
    }
}
