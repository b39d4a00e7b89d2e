//! Default host functions and the registration entry point.
//!
//! The catalogue here is intentionally small; the VM↔native calling
//! protocol is the contract, not the set. Higher-order natives (`map`,
//! `filter`) re-enter the VM through [`Vm::invoke`].

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::lang::value::{NativeFn, NativeImpl, Value};
use crate::runtime::runtime_error::{type_mismatch, RuntimeError};
use crate::runtime::vm::Vm;

/// Expose a host function under `name`. `arity` of `-1` disables the
/// argument-count check.
pub fn register_native(
    globals: &mut HashMap<String, Value>,
    name: &str,
    arity: i16,
    func: NativeImpl,
) {
    globals.insert(
        name.to_string(),
        Value::Native(Rc::new(NativeFn {
            name: name.to_string(),
            arity,
            func,
        })),
    );
}

pub fn install_default(globals: &mut HashMap<String, Value>) {
    register_native(globals, "clock", 0, native_clock);
    register_native(globals, "str", 1, native_str);
    register_native(globals, "num", 1, native_num);
    register_native(globals, "floor", 1, native_floor);
    register_native(globals, "push", 2, native_push);
    register_native(globals, "pop", 1, native_pop);
    register_native(globals, "keys", 1, native_keys);
    register_native(globals, "range", 2, native_range);
    register_native(globals, "map", 2, native_map);
    register_native(globals, "filter", 2, native_filter);
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, RuntimeError> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(seconds))
}

fn native_str(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::str(args[0].to_string()))
}

/// Parse a string to a number; numbers pass through; anything else is null.
fn native_num(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match &args[0] {
        Value::Number(n) => Value::Number(*n),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    })
}

fn native_floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Number(n) => Ok(Value::Number(n.floor())),
        other => Err(type_mismatch(format!(
            "floor needs a number, got {}",
            other.type_name()
        ))),
    }
}

fn native_push(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Array(items) => {
            items.borrow_mut().push(args[1].clone());
            Ok(args[0].clone())
        }
        other => Err(type_mismatch(format!(
            "push needs an array, got {}",
            other.type_name()
        ))),
    }
}

fn native_pop(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Array(items) => Ok(items.borrow_mut().pop().unwrap_or(Value::Null)),
        other => Err(type_mismatch(format!(
            "pop needs an array, got {}",
            other.type_name()
        ))),
    }
}

fn native_keys(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Map(entries) => Ok(Value::array(
            entries.borrow().keys().map(|k| Value::str(k.clone())).collect(),
        )),
        other => Err(type_mismatch(format!(
            "keys needs a map, got {}",
            other.type_name()
        ))),
    }
}

/// Half-open numeric range `[start, end)` in steps of one.
fn native_range(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    match (&args[0], &args[1]) {
        (Value::Number(start), Value::Number(end)) => {
            let mut items = Vec::new();
            let mut n = *start;
            while n < *end {
                items.push(Value::Number(n));
                n += 1.0;
            }
            Ok(Value::array(items))
        }
        _ => Err(type_mismatch("range needs two numbers")),
    }
}

fn native_map(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let items = match &args[0] {
        Value::Array(items) => items.borrow().clone(),
        other => {
            return Err(type_mismatch(format!(
                "map needs an array, got {}",
                other.type_name()
            )))
        }
    };
    let mut mapped = Vec::with_capacity(items.len());
    for item in items {
        mapped.push(vm.invoke(args[1].clone(), &[item])?);
    }
    Ok(Value::array(mapped))
}

fn native_filter(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let items = match &args[0] {
        Value::Array(items) => items.borrow().clone(),
        other => {
            return Err(type_mismatch(format!(
                "filter needs an array, got {}",
                other.type_name()
            )))
        }
    };
    let mut kept = Vec::new();
    for item in items {
        if vm.invoke(args[1].clone(), &[item.clone()])?.is_truthy() {
            kept.push(item);
        }
    }
    Ok(Value::array(kept))
}
