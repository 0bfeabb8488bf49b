//! Pre-audited method surface of the safe primitive types.
//!
//! The table is fixed at build time. Every entry is a pure function of its
//! receiver and arguments; nothing here exposes introspection, attribute
//! access or reflection. Names starting with `_` are never listed.

use crate::error::{KernelError, KernelResult};
use crate::value::{Value, ValueKind};

pub type PrimitiveMethod = fn(&Value, &[Value]) -> KernelResult<Value>;

pub const SAFE_PRIMITIVE_KINDS: &[ValueKind] = &[
    ValueKind::Bool,
    ValueKind::Int,
    ValueKind::Float,
    ValueKind::Str,
    ValueKind::Bytes,
    ValueKind::List,
    ValueKind::Tuple,
    ValueKind::Map,
];

const SURFACE: &[(ValueKind, &str, PrimitiveMethod)] = &[
    (ValueKind::Str, "len", str_len),
    (ValueKind::Str, "upper", str_upper),
    (ValueKind::Str, "lower", str_lower),
    (ValueKind::Str, "strip", str_strip),
    (ValueKind::Str, "split", str_split),
    (ValueKind::Str, "startswith", str_startswith),
    (ValueKind::Str, "endswith", str_endswith),
    (ValueKind::Str, "replace", str_replace),
    (ValueKind::Str, "contains", str_contains),
    (ValueKind::Bytes, "len", bytes_len),
    (ValueKind::List, "len", seq_len),
    (ValueKind::List, "get", seq_get),
    (ValueKind::List, "contains", seq_contains),
    (ValueKind::List, "append", list_append),
    (ValueKind::List, "reverse", list_reverse),
    (ValueKind::Tuple, "len", seq_len),
    (ValueKind::Tuple, "get", seq_get),
    (ValueKind::Map, "len", map_len),
    (ValueKind::Map, "get", map_get),
    (ValueKind::Map, "keys", map_keys),
    (ValueKind::Map, "contains", map_contains),
    (ValueKind::Int, "abs", int_abs),
    (ValueKind::Int, "to_str", to_str),
    (ValueKind::Float, "abs", float_abs),
    (ValueKind::Float, "round", float_round),
    (ValueKind::Float, "to_str", to_str),
    (ValueKind::Bool, "to_str", to_str),
];

pub fn is_safe_primitive(kind: ValueKind) -> bool {
    SAFE_PRIMITIVE_KINDS.contains(&kind)
}

/// Vetted method for `kind`, if any.
pub fn lookup(kind: ValueKind, name: &str) -> Option<PrimitiveMethod> {
    if name.starts_with('_') {
        return None;
    }
    SURFACE
        .iter()
        .find(|(k, n, _)| *k == kind && *n == name)
        .map(|(_, _, method)| *method)
}

fn arity(name: &str, args: &[Value], expected: usize) -> KernelResult<()> {
    if args.len() != expected {
        return Err(KernelError::type_error(format!(
            "{name}() takes {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn str_arg<'a>(name: &str, args: &'a [Value], idx: usize) -> KernelResult<&'a str> {
    args.get(idx).and_then(Value::as_str).ok_or_else(|| {
        KernelError::type_error(format!("{name}() argument {idx} must be str"))
    })
}

fn int_arg(name: &str, args: &[Value], idx: usize) -> KernelResult<i64> {
    args.get(idx).and_then(Value::as_int).ok_or_else(|| {
        KernelError::type_error(format!("{name}() argument {idx} must be int"))
    })
}

fn len_value(len: usize) -> Value {
    Value::Int(i64::try_from(len).unwrap_or(i64::MAX))
}

fn receiver_str(recv: &Value) -> KernelResult<&str> {
    recv.as_str()
        .ok_or_else(|| KernelError::type_error("receiver must be str"))
}

fn receiver_seq(recv: &Value) -> KernelResult<&[Value]> {
    match recv {
        Value::List(items) | Value::Tuple(items) => Ok(items),
        _ => Err(KernelError::type_error("receiver must be list or tuple")),
    }
}

fn receiver_map(recv: &Value) -> KernelResult<&std::collections::BTreeMap<String, Value>> {
    match recv {
        Value::Map(map) => Ok(map),
        _ => Err(KernelError::type_error("receiver must be map")),
    }
}

fn str_len(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("len", args, 0)?;
    Ok(len_value(receiver_str(recv)?.chars().count()))
}

fn str_upper(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("upper", args, 0)?;
    Ok(Value::Str(receiver_str(recv)?.to_uppercase()))
}

fn str_lower(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("lower", args, 0)?;
    Ok(Value::Str(receiver_str(recv)?.to_lowercase()))
}

fn str_strip(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("strip", args, 0)?;
    Ok(Value::str(receiver_str(recv)?.trim()))
}

fn str_split(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    let s = receiver_str(recv)?;
    let parts: Vec<Value> = match args.len() {
        0 => s.split_whitespace().map(Value::str).collect(),
        1 => {
            let sep = str_arg("split", args, 0)?;
            if sep.is_empty() {
                return Err(KernelError::failed("split(): empty separator"));
            }
            s.split(sep).map(Value::str).collect()
        }
        n => {
            return Err(KernelError::type_error(format!(
                "split() takes at most 1 argument, got {n}"
            )))
        }
    };
    Ok(Value::List(parts))
}

fn str_startswith(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("startswith", args, 1)?;
    let prefix = str_arg("startswith", args, 0)?;
    Ok(Value::Bool(receiver_str(recv)?.starts_with(prefix)))
}

fn str_endswith(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("endswith", args, 1)?;
    let suffix = str_arg("endswith", args, 0)?;
    Ok(Value::Bool(receiver_str(recv)?.ends_with(suffix)))
}

fn str_replace(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("replace", args, 2)?;
    let from = str_arg("replace", args, 0)?;
    let to = str_arg("replace", args, 1)?;
    Ok(Value::Str(receiver_str(recv)?.replace(from, to)))
}

fn str_contains(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("contains", args, 1)?;
    let needle = str_arg("contains", args, 0)?;
    Ok(Value::Bool(receiver_str(recv)?.contains(needle)))
}

fn bytes_len(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("len", args, 0)?;
    match recv {
        Value::Bytes(b) => Ok(len_value(b.len())),
        _ => Err(KernelError::type_error("receiver must be bytes")),
    }
}

fn seq_len(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("len", args, 0)?;
    Ok(len_value(receiver_seq(recv)?.len()))
}

fn seq_get(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("get", args, 1)?;
    let items = receiver_seq(recv)?;
    let idx = int_arg("get", args, 0)?;
    usize::try_from(idx)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| KernelError::failed(format!("index {idx} out of range")))
}

fn seq_contains(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("contains", args, 1)?;
    Ok(Value::Bool(receiver_seq(recv)?.contains(&args[0])))
}

fn list_append(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("append", args, 1)?;
    let mut items = receiver_seq(recv)?.to_vec();
    items.push(args[0].clone());
    Ok(Value::List(items))
}

fn list_reverse(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("reverse", args, 0)?;
    let mut items = receiver_seq(recv)?.to_vec();
    items.reverse();
    Ok(Value::List(items))
}

fn map_len(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("len", args, 0)?;
    Ok(len_value(receiver_map(recv)?.len()))
}

fn map_get(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("get", args, 1)?;
    let key = str_arg("get", args, 0)?;
    Ok(receiver_map(recv)?.get(key).cloned().unwrap_or(Value::Unit))
}

fn map_keys(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("keys", args, 0)?;
    Ok(Value::List(
        receiver_map(recv)?.keys().map(Value::str).collect(),
    ))
}

fn map_contains(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("contains", args, 1)?;
    let key = str_arg("contains", args, 0)?;
    Ok(Value::Bool(receiver_map(recv)?.contains_key(key)))
}

fn int_abs(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("abs", args, 0)?;
    match recv {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| KernelError::failed("abs(): integer overflow")),
        _ => Err(KernelError::type_error("receiver must be int")),
    }
}

fn float_abs(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("abs", args, 0)?;
    match recv {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        _ => Err(KernelError::type_error("receiver must be float")),
    }
}

fn float_round(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("round", args, 0)?;
    match recv {
        Value::Float(f) => Ok(Value::Float(f.round())),
        _ => Err(KernelError::type_error("receiver must be float")),
    }
}

fn to_str(recv: &Value, args: &[Value]) -> KernelResult<Value> {
    arity("to_str", args, 0)?;
    match recv {
        Value::Int(i) => Ok(Value::Str(i.to_string())),
        Value::Float(f) => Ok(Value::Str(f.to_string())),
        Value::Bool(b) => Ok(Value::Str(b.to_string())),
        other => Err(KernelError::type_error(format!(
            "to_str() unsupported for {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscore_names_are_never_exposed() {
        assert!(lookup(ValueKind::Str, "__class__").is_none());
        assert!(lookup(ValueKind::List, "_private").is_none());
    }

    #[test]
    fn objects_and_callables_are_not_safe_primitives() {
        assert!(is_safe_primitive(ValueKind::Str));
        assert!(is_safe_primitive(ValueKind::Map));
        assert!(!is_safe_primitive(ValueKind::Object));
        assert!(!is_safe_primitive(ValueKind::Function));
        assert!(!is_safe_primitive(ValueKind::Unit));
    }

    #[test]
    fn str_methods_behave() {
        let upper = lookup(ValueKind::Str, "upper").unwrap();
        assert_eq!(upper(&Value::str("abc"), &[]).unwrap(), Value::str("ABC"));

        let split = lookup(ValueKind::Str, "split").unwrap();
        assert_eq!(
            split(&Value::str("a,b"), &[Value::str(",")]).unwrap(),
            Value::List(vec![Value::str("a"), Value::str("b")])
        );
    }

    #[test]
    fn append_returns_new_list() {
        let append = lookup(ValueKind::List, "append").unwrap();
        let list = Value::List(vec![Value::Int(1)]);
        let out = append(&list, &[Value::Int(2)]).unwrap();
        assert_eq!(out, Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(list, Value::List(vec![Value::Int(1)]));
    }

    #[test]
    fn wrong_arity_is_a_type_error() {
        let upper = lookup(ValueKind::Str, "upper").unwrap();
        let err = upper(&Value::str("a"), &[Value::Int(1)]).unwrap_err();
        assert!(matches!(err, KernelError::Type { .. }));
    }

    #[test]
    fn out_of_range_get_fails() {
        let get = lookup(ValueKind::Tuple, "get").unwrap();
        let err = get(&Value::Tuple(vec![]), &[Value::Int(3)]).unwrap_err();
        assert!(matches!(err, KernelError::Failed { .. }));
    }
}
