//! Math module.

use rustc_hash::FxHashMap;

use crate::error::VmError;
use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_module("math", || {
        let mut module: FxHashMap<String, Value> = FxHashMap::default();

        module.insert("pi".to_string(), Value::Float(std::f64::consts::PI));
        module.insert("e".to_string(), Value::Float(std::f64::consts::E));

        module.insert(
            "abs".to_string(),
            Value::native("abs", |_vm, args| match Args(args).get(0)? {
                Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
                Value::Float(v) => Ok(Value::Float(v.abs())),
                other => Err(VmError::raise(format!(
                    "invalid argument type {}, expected number",
                    other.type_name()
                ))),
            }),
        );

        module.insert(
            "floor".to_string(),
            Value::native("floor", |_vm, args| {
                Ok(Value::Int(Args(args).number(0)?.floor() as i64))
            }),
        );

        module.insert(
            "ceil".to_string(),
            Value::native("ceil", |_vm, args| {
                Ok(Value::Int(Args(args).number(0)?.ceil() as i64))
            }),
        );

        module.insert(
            "sqrt".to_string(),
            Value::native("sqrt", |_vm, args| {
                Ok(Value::Float(Args(args).number(0)?.sqrt()))
            }),
        );

        module.insert(
            "pow".to_string(),
            Value::native("pow", |_vm, args| {
                let args = Args(args);
                Ok(Value::Float(args.number(0)?.powf(args.number(1)?)))
            }),
        );

        module.insert(
            "min".to_string(),
            Value::native("min", |_vm, args| {
                let args = Args(args);
                Ok(Value::Float(args.number(0)?.min(args.number(1)?)))
            }),
        );

        module.insert(
            "max".to_string(),
            Value::native("max", |_vm, args| {
                let args = Args(args);
                Ok(Value::Float(args.number(0)?.max(args.number(1)?)))
            }),
        );

        Value::object(module)
    });
}
