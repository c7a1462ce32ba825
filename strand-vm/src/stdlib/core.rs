//! Core builtin functions, available without an import.

use crate::error::VmError;
use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_func("error", |_vm, args| {
        let args = Args(args);
        let message = args.string(0)?;
        let data = if args.len() > 1 {
            args.get(1)?.clone()
        } else {
            Value::Nil
        };
        Ok(Value::error(message.as_ref(), data))
    });

    builder.register_func("isError", |_vm, args| {
        Ok(Value::Bool(Args(args).get(0)?.is_error()))
    });

    builder.register_func("assert", |_vm, args| {
        let value = Args(args).get(0)?;
        if !value.is_truthy() {
            return Err(VmError::raise("assertion failed"));
        }
        Ok(Value::Nil)
    });

    builder.register_func("echo", |_vm, args| {
        let value = Args(args).get(0)?;
        println!("{}", value);
        Ok(Value::Nil)
    });

    builder.register_func("type", |_vm, args| {
        Ok(Value::string(Args(args).get(0)?.type_name()))
    });

    builder.register_func("len", |_vm, args| {
        let value = Args(args).get(0)?;
        let len = match value {
            Value::Array(items) => items.read().len(),
            Value::String(s) => s.len(),
            Value::Object(map) => map.read().len(),
            other => {
                return Err(VmError::raise(format!(
                    "invalid type {} for len()",
                    other.type_name()
                )))
            }
        };
        Ok(Value::Int(len as i64))
    });

    builder.register_func("string", |_vm, args| {
        Ok(Value::string(Args(args).get(0)?.to_string()))
    });

    builder.register_func("int", |_vm, args| {
        match Args(args).get(0)? {
            Value::Int(v) => Ok(Value::Int(*v)),
            Value::Float(v) => Ok(Value::Int(*v as i64)),
            other => Err(VmError::raise(format!(
                "invalid type {} for int()",
                other.type_name()
            ))),
        }
    });

    builder.register_func("float", |_vm, args| {
        Ok(Value::Float(Args(args).number(0)?))
    });

    builder.register_func("number", |_vm, args| {
        let s = Args(args).string(0)?;
        s.trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| VmError::raise(e.to_string()))
    });

    builder.register_func("rand", |_vm, _args| Ok(Value::Float(fastrand::f64())));

    builder.register_func("sleep", |_vm, args| {
        let millis = Args(args).number(0)?;
        if millis > 0.0 {
            std::thread::sleep(std::time::Duration::from_micros((millis * 1000.0) as u64));
        }
        Ok(Value::Nil)
    });
}

#[cfg(test)]
mod tests {
    use super::super::std_registry;
    use crate::value::Value;

    #[test]
    fn registry_knows_the_core_names() {
        let registry = std_registry();
        for name in ["error", "assert", "type", "len", "import", "fiber"] {
            assert!(registry.names().contains(name), "missing {name}");
        }
    }

    #[test]
    fn modules_resolve_to_objects() {
        let registry = std_registry();
        for name in ["math", "strings", "time", "io", "json", "fiber"] {
            let module = registry.resolve_module(name).expect(name);
            assert!(matches!(module, Value::Object(_)), "{name} is not a map");
        }
    }
}
