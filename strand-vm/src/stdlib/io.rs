//! IO module.

use rustc_hash::FxHashMap;

use crate::error::VmError;
use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_module("io", || {
        let mut module: FxHashMap<String, Value> = FxHashMap::default();

        module.insert(
            "print".to_string(),
            Value::native("print", |_vm, args| {
                print!("{}", Args(args).get(0)?);
                Ok(Value::Nil)
            }),
        );

        module.insert(
            "println".to_string(),
            Value::native("println", |_vm, args| {
                println!("{}", Args(args).get(0)?);
                Ok(Value::Nil)
            }),
        );

        module.insert(
            "readFile".to_string(),
            Value::native("readFile", |_vm, args| {
                let path = Args(args).string(0)?;
                std::fs::read_to_string(path.as_ref())
                    .map(Value::string)
                    .map_err(|e| VmError::raise(e.to_string()))
            }),
        );

        module.insert(
            "writeFile".to_string(),
            Value::native("writeFile", |_vm, args| {
                let args = Args(args);
                let path = args.string(0)?;
                let content = args.string(1)?;
                std::fs::write(path.as_ref(), content.as_bytes())
                    .map(|_| Value::Nil)
                    .map_err(|e| VmError::raise(e.to_string()))
            }),
        );

        Value::object(module)
    });
}
