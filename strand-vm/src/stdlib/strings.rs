//! String module.

use rustc_hash::FxHashMap;

use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_module("strings", || {
        let mut module: FxHashMap<String, Value> = FxHashMap::default();

        module.insert(
            "upper".to_string(),
            Value::native("upper", |_vm, args| {
                Ok(Value::string(Args(args).string(0)?.to_uppercase()))
            }),
        );

        module.insert(
            "lower".to_string(),
            Value::native("lower", |_vm, args| {
                Ok(Value::string(Args(args).string(0)?.to_lowercase()))
            }),
        );

        module.insert(
            "trim".to_string(),
            Value::native("trim", |_vm, args| {
                Ok(Value::string(Args(args).string(0)?.trim()))
            }),
        );

        module.insert(
            "split".to_string(),
            Value::native("split", |_vm, args| {
                let args = Args(args);
                let s = args.string(0)?;
                let sep = args.string(1)?;
                let parts = s.split(sep.as_ref()).map(Value::string).collect();
                Ok(Value::array(parts))
            }),
        );

        module.insert(
            "join".to_string(),
            Value::native("join", |_vm, args| {
                let args = Args(args);
                let items = args.array(0)?;
                let sep = args.string(1)?;
                let parts: Vec<String> = items.read().iter().map(|v| v.to_string()).collect();
                Ok(Value::string(parts.join(sep.as_ref())))
            }),
        );

        module.insert(
            "contains".to_string(),
            Value::native("contains", |_vm, args| {
                let args = Args(args);
                let s = args.string(0)?;
                let needle = args.string(1)?;
                Ok(Value::Bool(s.contains(needle.as_ref())))
            }),
        );

        module.insert(
            "replace".to_string(),
            Value::native("replace", |_vm, args| {
                let args = Args(args);
                let s = args.string(0)?;
                let from = args.string(1)?;
                let to = args.string(2)?;
                Ok(Value::string(s.replace(from.as_ref(), to.as_ref())))
            }),
        );

        Value::object(module)
    });
}
