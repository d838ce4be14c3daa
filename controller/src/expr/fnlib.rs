//! Core function library available to workflow expressions as
//! `{"$fn.<name>": [args...]}` invocations.

use pulldown_cmark::{html, Parser};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FunctionError {
    pub message: String,
}

fn err<T>(message: impl Into<String>) -> Result<T, FunctionError> {
    Err(FunctionError {
        message: message.into(),
    })
}

type Invoke = fn(Vec<Value>) -> Result<Value, FunctionError>;

/// Looks up a function by name. Returns `None` for names outside the
/// library so callers can distinguish unknown functions from invocation
/// failures.
pub fn descriptor(name: &str) -> Option<Invoke> {
    match name {
        "append" => Some(append),
        "concat" => Some(concat),
        "convertMarkdown" => Some(convert_markdown),
        "equals" => Some(equals),
        "jsonUnmarshal" => Some(json_unmarshal),
        "merge" => Some(merge),
        "notEquals" => Some(not_equals),
        _ => None,
    }
}

fn append(args: Vec<Value>) -> Result<Value, FunctionError> {
    let mut args = args.into_iter();
    let base = match args.next() {
        Some(Value::Array(items)) => items,
        Some(other) => return err(format!("append: first argument must be an array, got {other}")),
        None => return err("append: expected at least one argument"),
    };

    let mut out = base;
    out.extend(args);
    Ok(Value::Array(out))
}

fn concat(args: Vec<Value>) -> Result<Value, FunctionError> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Value::String(s) => out.push_str(&s),
            other => return err(format!("concat: arguments must be strings, got {other}")),
        }
    }
    Ok(Value::String(out))
}

fn convert_markdown(args: Vec<Value>) -> Result<Value, FunctionError> {
    let [arg] = <[Value; 1]>::try_from(args)
        .map_err(|_| FunctionError {
            message: "convertMarkdown: expected exactly one argument".to_owned(),
        })?;

    let Value::String(source) = arg else {
        return err("convertMarkdown: argument must be a string");
    };

    let mut out = String::new();
    html::push_html(&mut out, Parser::new(&source));
    Ok(Value::String(out))
}

fn equals(args: Vec<Value>) -> Result<Value, FunctionError> {
    match <[Value; 2]>::try_from(args) {
        Ok([a, b]) => Ok(Value::Bool(a == b)),
        Err(_) => err("equals: expected exactly two arguments"),
    }
}

fn not_equals(args: Vec<Value>) -> Result<Value, FunctionError> {
    match equals(args)? {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        _ => unreachable!(),
    }
}

fn json_unmarshal(args: Vec<Value>) -> Result<Value, FunctionError> {
    let [arg] = <[Value; 1]>::try_from(args)
        .map_err(|_| FunctionError {
            message: "jsonUnmarshal: expected exactly one argument".to_owned(),
        })?;

    let Value::String(source) = arg else {
        return err("jsonUnmarshal: argument must be a string");
    };

    serde_json::from_str(&source)
        .map_err(|e| FunctionError {
            message: format!("jsonUnmarshal: {e}"),
        })
}

fn merge(args: Vec<Value>) -> Result<Value, FunctionError> {
    let mut out = Map::new();
    for arg in args {
        match arg {
            Value::Object(map) => out.extend(map),
            other => return err(format!("merge: arguments must be objects, got {other}")),
        }
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append() {
        let out = append(vec![json!([1, 2]), json!(3), json!("x")]).unwrap();
        assert_eq!(out, json!([1, 2, 3, "x"]));

        assert!(append(vec![json!("nope")]).is_err());
    }

    #[test]
    fn test_concat() {
        let out = concat(vec![json!("a"), json!("b"), json!("c")]).unwrap();
        assert_eq!(out, json!("abc"));
    }

    #[test]
    fn test_equals_and_not_equals() {
        assert_eq!(equals(vec![json!(1), json!(2)]).unwrap(), json!(false));
        assert_eq!(equals(vec![json!("x"), json!("x")]).unwrap(), json!(true));
        assert_eq!(not_equals(vec![json!(1), json!(2)]).unwrap(), json!(true));
        assert!(equals(vec![json!(1)]).is_err());
    }

    #[test]
    fn test_json_unmarshal() {
        let out = json_unmarshal(vec![json!(r#"{"a": [1, 2]}"#)]).unwrap();
        assert_eq!(out, json!({"a": [1, 2]}));
        assert!(json_unmarshal(vec![json!("{")]).is_err());
    }

    #[test]
    fn test_merge() {
        let out = merge(vec![json!({"a": 1, "b": 1}), json!({"b": 2})]).unwrap();
        assert_eq!(out, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_convert_markdown() {
        let out = convert_markdown(vec![json!("# Title")]).unwrap();
        assert!(out.as_str().unwrap().contains("<h1>Title</h1>"));
    }

    #[test]
    fn test_unknown_function() {
        assert!(descriptor("definitelyNotAFunction").is_none());
    }
}
