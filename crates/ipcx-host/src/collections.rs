//! Demo collections served by the host.

use ipcx::{ClientId, Collection, Function, FunctionError, FunctionResult, Value, ValueType};

pub fn all() -> Vec<Collection> {
    vec![math(), sys()]
}

/// Wrap a checked integer operation as a `(int64, int64) -> int64` function.
fn int_op(
    name: &'static str,
    op: fn(i64, i64) -> Option<i64>,
    failure: &'static str,
) -> Function {
    Function::new(
        name,
        vec![ValueType::Int64, ValueType::Int64],
        vec![ValueType::Int64],
        move |_: ClientId, args: &[Value]| -> FunctionResult {
            let (a, b) = match (args[0].as_i64(), args[1].as_i64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(FunctionError::new("integer arguments required")),
            };
            op(a, b)
                .map(|v| vec![Value::Int64(v)])
                .ok_or_else(|| FunctionError::new(failure))
        },
    )
}

pub fn math() -> Collection {
    Collection::new("math")
        .with_function(int_op("add", i64::checked_add, "integer overflow"))
        .with_function(int_op("sub", i64::checked_sub, "integer overflow"))
        .with_function(int_op("mul", i64::checked_mul, "integer overflow"))
        .with_function(int_op(
            "div",
            i64::checked_div,
            "division by zero or overflow",
        ))
}

pub fn sys() -> Collection {
    Collection::new("sys")
        .with_function(Function::new(
            "echo",
            vec![ValueType::Any],
            vec![ValueType::Any],
            |_, args| Ok(args.to_vec()),
        ))
        .with_function(Function::new(
            "ping",
            vec![],
            vec![ValueType::String],
            |_, _| Ok(vec![Value::from("pong")]),
        ))
        .with_function(Function::new(
            "whoami",
            vec![],
            vec![ValueType::UInt64],
            |client, _| Ok(vec![Value::UInt64(client.0)]),
        ))
}
