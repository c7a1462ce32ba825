//! Array builtins. The higher-order ones call back into interpreted
//! closures through the invoking VM.

use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_func("push", |_vm, args| {
        let args = Args(args);
        let items = args.array(0)?;
        let value = args.get(1)?.clone();
        items.write().push(value);
        Ok(args.get(0)?.clone())
    });

    builder.register_func("map", |vm, args| {
        let args = Args(args);
        let items = args.array(0)?;
        let func = args.function(1)?;

        // Snapshot before calling back in, so a callback that mutates the
        // array cannot deadlock against the held lock.
        let snapshot: Vec<Value> = items.read().clone();
        let mut out = Vec::with_capacity(snapshot.len());
        for item in snapshot {
            out.push(vm.run_function(func.clone(), &[item])?);
        }
        Ok(Value::array(out))
    });

    builder.register_func("filter", |vm, args| {
        let args = Args(args);
        let items = args.array(0)?;
        let func = args.function(1)?;

        let snapshot: Vec<Value> = items.read().clone();
        let mut out = Vec::new();
        for item in snapshot {
            if vm.run_function(func.clone(), &[item.clone()])?.is_truthy() {
                out.push(item);
            }
        }
        Ok(Value::array(out))
    });

    builder.register_func("contains", |vm, args| {
        let args = Args(args);
        let items = args.array(0)?;
        let needle = args.get(1)?;

        let snapshot: Vec<Value> = items.read().clone();
        match needle {
            predicate @ (Value::Function(_) | Value::Native(_)) => {
                for item in snapshot {
                    if vm
                        .run_function(predicate.clone(), &[item])?
                        .is_truthy()
                    {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            value => Ok(Value::Bool(snapshot.iter().any(|i| i.equals(value)))),
        }
    });

    builder.register_func("keys", |_vm, args| {
        let map = match Args(args).get(0)? {
            Value::Object(map) => map.clone(),
            other => {
                return Err(crate::error::VmError::raise(format!(
                    "invalid argument type {}, expected object",
                    other.type_name()
                )))
            }
        };
        let mut keys: Vec<String> = map.read().keys().cloned().collect();
        keys.sort();
        Ok(Value::array(keys.into_iter().map(Value::string).collect()))
    });
}
