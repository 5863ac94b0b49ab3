//! Built-in execution functions.

use std::time::Duration;

use brine_storage::Job;
use serde_json::{json, Value};
use thiserror::Error;

const DELIM: char = ':';

/// Every function this minion answers, in `sys.list_functions` order.
pub const FUNCTIONS: &[&str] = &[
    "grains.get",
    "grains.items",
    "pillar.get",
    "pillar.items",
    "saltutil.find_job",
    "saltutil.running",
    "sys.list_functions",
    "test.arg",
    "test.echo",
    "test.ping",
    "test.sleep",
    "test.version",
];

#[derive(Debug, Error, PartialEq)]
pub enum ExecError {
    #[error("'{0}' is not available.")]
    NotAvailable(String),
    #[error("{fun}: {message}")]
    BadArgs { fun: String, message: String },
}

/// What a function may look at while it runs.
pub struct ExecContext<'a> {
    pub grains: &'a Value,
    pub pillar: &'a Value,
    pub running: &'a [Job],
}

fn bad_args(fun: &str, message: impl Into<String>) -> ExecError {
    ExecError::BadArgs {
        fun: fun.to_string(),
        message: message.into(),
    }
}

fn string_arg<'a>(fun: &str, args: &'a [Value], idx: usize) -> Result<&'a str, ExecError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_args(fun, format!("argument {} must be a string", idx + 1)))
}

/// Walk `a:b:c` through nested maps. Numeric segments index lists.
pub fn traverse<'a>(data: &'a Value, key: &str) -> Option<&'a Value> {
    key.split(DELIM).try_fold(data, |node, part| match node {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup(fun: &str, data: &Value, args: &[Value]) -> Result<Value, ExecError> {
    let key = string_arg(fun, args, 0)?;
    let default = args.get(1).cloned().unwrap_or_else(|| json!(""));
    Ok(traverse(data, key).cloned().unwrap_or(default))
}

fn job_summary(job: &Job) -> Value {
    json!({
        "jid": job.jid,
        "fun": job.fun,
        "arg": job.args,
        "tgt": job.target.expr,
        "tgt_type": job.target.kind.as_str(),
        "user": job.user,
    })
}

pub async fn execute(ctx: &ExecContext<'_>, fun: &str, args: &[Value]) -> Result<Value, ExecError> {
    match fun {
        "test.ping" => Ok(Value::Bool(true)),
        "test.echo" => Ok(Value::String(string_arg(fun, args, 0)?.to_string())),
        "test.arg" => Ok(json!({ "args": args })),
        "test.version" => Ok(json!(env!("CARGO_PKG_VERSION"))),
        "test.sleep" => {
            let secs = args
                .first()
                .and_then(Value::as_f64)
                .filter(|s| s.is_finite() && *s >= 0.0)
                .ok_or_else(|| bad_args(fun, "length must be a non-negative number"))?;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            Ok(Value::Bool(true))
        }
        "grains.items" => Ok(ctx.grains.clone()),
        "grains.get" => lookup(fun, ctx.grains, args),
        "pillar.items" => Ok(ctx.pillar.clone()),
        "pillar.get" => lookup(fun, ctx.pillar, args),
        "saltutil.running" => Ok(Value::Array(ctx.running.iter().map(job_summary).collect())),
        "saltutil.find_job" => {
            let jid = string_arg(fun, args, 0)?;
            Ok(ctx
                .running
                .iter()
                .find(|job| job.jid.as_str() == jid)
                .map(job_summary)
                .unwrap_or_else(|| json!({})))
        }
        "sys.list_functions" => Ok(json!(FUNCTIONS)),
        other => Err(ExecError::NotAvailable(other.to_string())),
    }
}
