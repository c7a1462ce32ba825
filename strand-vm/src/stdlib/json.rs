//! JSON module: conversion between language values and JSON text.

use rustc_hash::FxHashMap;
use serde_json as sj;

use crate::error::{VmError, VmResult};
use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;

fn from_json(json: &sj::Value) -> Value {
    match json {
        sj::Value::Null => Value::Nil,
        sj::Value::Bool(b) => Value::Bool(*b),
        sj::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        sj::Value::String(s) => Value::string(s),
        sj::Value::Array(items) => Value::array(items.iter().map(from_json).collect()),
        sj::Value::Object(map) => {
            let mut out = FxHashMap::default();
            for (key, value) in map {
                out.insert(key.clone(), from_json(value));
            }
            Value::object(out)
        }
    }
}

fn to_json(value: &Value) -> VmResult<sj::Value> {
    Ok(match value {
        Value::Nil => sj::Value::Null,
        Value::Bool(b) => sj::Value::Bool(*b),
        Value::Int(i) => sj::Value::Number((*i).into()),
        Value::Float(f) => sj::Number::from_f64(*f)
            .map(sj::Value::Number)
            .unwrap_or(sj::Value::Null),
        Value::String(s) => sj::Value::String(s.to_string()),
        Value::Array(items) => {
            let items = items.read().clone();
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(to_json(item)?);
            }
            sj::Value::Array(out)
        }
        Value::Object(map) => {
            let entries: Vec<(String, Value)> = map
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let mut out = sj::Map::new();
            for (key, value) in entries {
                out.insert(key, to_json(&value)?);
            }
            sj::Value::Object(out)
        }
        Value::Ref(cell) => to_json(&cell.read().clone())?,
        other => {
            return Err(VmError::raise(format!(
                "cannot serialize {} to json",
                other.type_name()
            )))
        }
    })
}

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_module("json", || {
        let mut module: FxHashMap<String, Value> = FxHashMap::default();

        module.insert(
            "parse".to_string(),
            Value::native("parse", |_vm, args| {
                let text = Args(args).string(0)?;
                sj::from_str::<sj::Value>(&text)
                    .map(|v| from_json(&v))
                    .map_err(|e| VmError::raise(e.to_string()))
            }),
        );

        module.insert(
            "stringify".to_string(),
            Value::native("stringify", |_vm, args| {
                let json = to_json(Args(args).get(0)?)?;
                sj::to_string(&json)
                    .map(Value::string)
                    .map_err(|e| VmError::raise(e.to_string()))
            }),
        );

        Value::object(module)
    });
}
