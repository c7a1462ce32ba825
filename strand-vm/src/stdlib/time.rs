//! Time module: seconds-since-epoch as floats.

use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;

use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_module("time", || {
        let mut module: FxHashMap<String, Value> = FxHashMap::default();

        module.insert(
            "now".to_string(),
            Value::native("now", |_vm, _args| Ok(Value::Float(now_seconds()))),
        );

        module.insert(
            "since".to_string(),
            Value::native("since", |_vm, args| {
                let start = Args(args).number(0)?;
                Ok(Value::Float(now_seconds() - start))
            }),
        );

        Value::object(module)
    });
}
