//! Call command - invoke one exported function with typed arguments

use super::{init_registry, Target};
use anyhow::{anyhow, bail, Context, Result};
use dynacall_config::EngineConfig;
use dynacall_runtime::{loader, ParamKind, Signature, Value};
use serde_json::json;

/// Arguments of `dynacall call`
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub library: String,
    pub symbol: String,
    /// `kind:value` pairs
    pub args: Vec<String>,
    pub ret: Option<String>,
    pub json: bool,
}

pub fn run(engine: EngineConfig, call: CallArgs) -> Result<()> {
    let (params, values): (Vec<ParamKind>, Vec<Value>) = call
        .args
        .iter()
        .map(|arg| parse_arg(arg))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();
    let ret = call.ret.as_deref().map(parse_kind).transpose()?;
    let signature = Signature::new(params, ret);

    init_registry(engine)?;
    let target = Target::open(&call.library)?;

    // Safety: the command line declares the signature; a wrong one is the
    // caller's responsibility, exactly as with a C prototype.
    let callable = unsafe { loader::bind_symbol(target.handle(), &call.symbol, signature) }
        .with_context(|| format!("Failed to bind {}", call.symbol))?;
    let result = callable
        .call(&values)
        .with_context(|| format!("Call to {} failed", call.symbol))?;

    if call.json {
        let output = json!({
            "symbol": call.symbol,
            "address": format!("{:#x}", callable.address()),
            "signature": callable.signature().to_string(),
            "result": value_to_json(&result),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if result != Value::Void {
        println!("{}", result);
    }

    drop(target);
    Ok(())
}

/// Parse a kind name such as `i32`, `ptr` or `str`
pub fn parse_kind(kind: &str) -> Result<ParamKind> {
    kind.parse::<ParamKind>().map_err(|e| anyhow!(e))
}

/// Parse one `kind:value` argument
///
/// Everything after the first colon is the value, so strings may contain
/// colons.
pub fn parse_arg(arg: &str) -> Result<(ParamKind, Value)> {
    let (kind, raw) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("Argument '{}' is not of the form kind:value", arg))?;
    let kind = parse_kind(kind)?;
    let value = parse_value(&kind, raw)
        .with_context(|| format!("Invalid {} value '{}'", kind, raw))?;
    Ok((kind, value))
}

fn parse_value(kind: &ParamKind, raw: &str) -> Result<Value> {
    let value = match kind {
        ParamKind::Int(_) => Value::Int(raw.trim().parse::<i64>()?),
        ParamKind::UInt(_) => Value::UInt(parse_unsigned(raw)?),
        ParamKind::Pointer => Value::Pointer(parse_unsigned(raw)? as usize),
        ParamKind::Bool => match raw.trim() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            other => bail!("expected true or false, got '{}'", other),
        },
        ParamKind::F32 => Value::F32(raw.trim().parse::<f32>()?),
        ParamKind::F64 => Value::F64(raw.trim().parse::<f64>()?),
        ParamKind::NativeString => Value::String(raw.to_string()),
        ParamKind::Struct(_) | ParamKind::Callback(_) => {
            bail!("{} arguments cannot be given on the command line", kind)
        }
    };
    Ok(value)
}

fn parse_unsigned(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => raw.parse::<u64>()?,
    };
    Ok(parsed)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Void => serde_json::Value::Null,
        Value::Int(v) => json!(v),
        Value::UInt(v) => json!(v),
        Value::Bool(v) => json!(v),
        Value::F32(v) => json!(v),
        Value::F64(v) => json!(v),
        Value::String(s) => json!(s),
        Value::Struct(items) | Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        other => json!(other.to_string()),
    }
}
