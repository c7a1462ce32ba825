//! The fiber module: concurrent task spawning, channels and locks.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::concurrent::{ChannelValue, LockValue};
use crate::error::{VmError, VmResult};
use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;
use crate::vm::Vm;

fn executor_of(vm: &Vm) -> VmResult<Arc<crate::executor::Executor>> {
    vm.executor()
        .ok_or_else(|| VmError::fault("no executor attached to this VM"))
}

pub fn register(builder: &mut RegistryBuilder) {
    let mut module: FxHashMap<String, Value> = FxHashMap::default();

    module.insert(
        "run".to_string(),
        Value::native("run", |vm, args| {
            let func = Args(args).function(0)?;
            executor_of(vm)?.spawn(func, args[1..].to_vec())
        }),
    );

    module.insert(
        "wait".to_string(),
        Value::native("wait", |_vm, args| {
            let args = Args(args);
            match args.get(0)? {
                Value::Task(task) => Ok(task.wait()),
                Value::Array(tasks) => {
                    let tasks: Vec<Value> = tasks.read().clone();
                    let mut out = Vec::with_capacity(tasks.len());
                    for task in tasks {
                        match task {
                            Value::Task(task) => out.push(task.wait()),
                            other => {
                                return Err(VmError::raise(format!(
                                    "invalid argument type {}, expected task",
                                    other.type_name()
                                )))
                            }
                        }
                    }
                    Ok(Value::array(out))
                }
                other => Err(VmError::raise(format!(
                    "invalid argument type {}, expected task or array",
                    other.type_name()
                ))),
            }
        }),
    );

    module.insert(
        "cancel".to_string(),
        Value::native("cancel", |_vm, args| {
            Args(args).task(0)?.cancel();
            Ok(Value::Nil)
        }),
    );

    module.insert(
        "newChannel".to_string(),
        Value::native("newChannel", |_vm, args| {
            let args = Args(args);
            let capacity = if args.is_empty() {
                0
            } else {
                let n = args.int(0)?;
                if n < 0 {
                    return Err(VmError::raise("channel capacity must be non-negative"));
                }
                n as usize
            };
            Ok(Value::Channel(Arc::new(ChannelValue::new(capacity))))
        }),
    );

    module.insert(
        "newLock".to_string(),
        Value::native("newLock", |_vm, _args| {
            Ok(Value::Lock(Arc::new(LockValue::new())))
        }),
    );

    module.insert(
        "send".to_string(),
        Value::native("send", |_vm, args| {
            let args = Args(args);
            let channel = args.channel(0)?;
            let value = args.get(1)?.clone();
            channel.send(value.clone())?;
            Ok(value)
        }),
    );

    module.insert(
        "recv".to_string(),
        Value::native("recv", |_vm, args| Ok(Args(args).channel(0)?.recv())),
    );

    module.insert(
        "close".to_string(),
        Value::native("close", |_vm, args| {
            Args(args).channel(0)?.close();
            Ok(Value::Nil)
        }),
    );

    module.insert(
        "onRecv".to_string(),
        Value::native("onRecv", |vm, args| {
            let args = Args(args);
            let channel = args.channel(0)?;
            let func = args.function(1)?;
            while let Some(value) = channel.recv_open() {
                vm.run_function(func.clone(), &[value])?;
            }
            Ok(Value::Nil)
        }),
    );

    builder.register_static_module("fiber", Value::object(module));
}
