// Statement walker for the restricted language.
//
// Walks statements in order against a flat environment. Every call is
// dispatched through the host; the most recent call result is tracked
// whether or not it was assigned, and becomes the program result.

use std::collections::HashMap;

use crate::ast::{Arg, Call, Program, RValue, Stmt};
use crate::error::EvalError;
use crate::host::CallHost;
use crate::values::Value;

pub async fn run_program<H>(program: &Program, host: &H) -> Result<Value, EvalError<H::Error>>
where
    H: CallHost + Sync,
{
    let mut env: HashMap<String, Value> = HashMap::new();
    let mut last_call_result: Option<Value> = None;

    for stmt in &program.statements {
        match stmt {
            Stmt::Assign { name, value } => {
                let v = eval_rvalue(value, &env, &mut last_call_result, host).await?;
                env.insert(name.clone(), v);
            }
            Stmt::Expr(rvalue) => {
                eval_rvalue(rvalue, &env, &mut last_call_result, host).await?;
            }
        }
    }

    last_call_result.ok_or(EvalError::NoCalls)
}

async fn eval_rvalue<H>(
    rvalue: &RValue,
    env: &HashMap<String, Value>,
    last_call_result: &mut Option<Value>,
    host: &H,
) -> Result<Value, EvalError<H::Error>>
where
    H: CallHost + Sync,
{
    match rvalue {
        RValue::Literal(v) => Ok(v.clone()),
        RValue::Name(name) => lookup(env, name),
        RValue::Call(call) => {
            let result = eval_call(call, env, host).await?;
            *last_call_result = Some(result.clone());
            Ok(result)
        }
    }
}

async fn eval_call<H>(
    call: &Call,
    env: &HashMap<String, Value>,
    host: &H,
) -> Result<Value, EvalError<H::Error>>
where
    H: CallHost + Sync,
{
    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(resolve_arg(env, arg)?);
    }
    let mut kwargs = HashMap::with_capacity(call.kwargs.len());
    for (key, arg) in &call.kwargs {
        kwargs.insert(key.clone(), resolve_arg(env, arg)?);
    }

    host.invoke(&call.function, args, kwargs)
        .await
        .map_err(EvalError::Host)
}

fn resolve_arg<E>(env: &HashMap<String, Value>, arg: &Arg) -> Result<Value, EvalError<E>> {
    match arg {
        Arg::Literal(v) => Ok(v.clone()),
        Arg::Name(name) => lookup(env, name),
    }
}

fn lookup<E>(env: &HashMap<String, Value>, name: &str) -> Result<Value, EvalError<E>> {
    env.get(name)
        .cloned()
        .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))
}
