//! Depth-first, leaves-first evaluation of reference trees.
//!
//! A reference tree is ordinary JSON; objects carrying a `$type` field are
//! data references (Parameter, Secret, Connection, Output) and single-key
//! objects of the form `{"$fn.<name>": args}` are function invocations.
//! Unresolved references do not fail evaluation: the offending subtree is
//! left in place as a typed placeholder and the result is marked incomplete.

use super::fnlib;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Parameter { name: String },
    Secret { name: String },
    Connection { kind: String, name: String },
    Output { from: String, name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),

    #[error("malformed {kind} reference: missing field {field:?}")]
    MalformedReference { kind: &'static str, field: &'static str },

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("function {name:?} failed: {source}")]
    Function {
        name: String,
        #[source]
        source: fnlib::FunctionError,
    },
}

/// Resolution callbacks supplied by the caller. Returning `Ok(None)` leaves
/// the reference unresolved (incomplete result); returning `Err` aborts
/// evaluation.
pub trait Resolve {
    fn parameter(&self, name: &str) -> Result<Option<Value>, EvaluationError>;
    fn secret(&self, name: &str) -> Result<Option<Value>, EvaluationError>;
    fn connection(&self, kind: &str, name: &str) -> Result<Option<Value>, EvaluationError>;
    fn output(&self, from: &str, name: &str) -> Result<Option<Value>, EvaluationError>;
}

/// Map-backed [`Resolve`] implementation. Callers pre-fetch whatever data
/// their references need (asynchronously, through the managers) and then
/// evaluate synchronously against the collected bindings.
#[derive(Debug, Default, Clone)]
pub struct Bindings {
    pub parameters: BTreeMap<String, Value>,
    pub secrets: BTreeMap<String, Value>,
    pub connections: BTreeMap<(String, String), Value>,
    pub outputs: BTreeMap<(String, String), Value>,

    /// When set, a parameter reference with no binding is an error instead
    /// of an incomplete result. The compiler uses this; the metadata API
    /// does not.
    pub strict_parameters: bool,
}

impl Resolve for Bindings {
    fn parameter(&self, name: &str) -> Result<Option<Value>, EvaluationError> {
        match self.parameters.get(name) {
            Some(v) => Ok(Some(v.clone())),
            None if self.strict_parameters => Err(EvaluationError::UnknownParameter(name.to_owned())),
            None => Ok(None),
        }
    }

    fn secret(&self, name: &str) -> Result<Option<Value>, EvaluationError> {
        Ok(self.secrets.get(name).cloned())
    }

    fn connection(&self, kind: &str, name: &str) -> Result<Option<Value>, EvaluationError> {
        Ok(self
            .connections
            .get(&(kind.to_owned(), name.to_owned()))
            .cloned())
    }

    fn output(&self, from: &str, name: &str) -> Result<Option<Value>, EvaluationError> {
        Ok(self
            .outputs
            .get(&(from.to_owned(), name.to_owned()))
            .cloned())
    }
}

/// Result envelope reported to callers (and, for `/spec`, to step pods).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Evaluation {
    pub complete: bool,
    pub value: Value,
}

fn require<'a>(
    map: &'a Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<&'a str, EvaluationError> {
    map.get(field)
        .and_then(Value::as_str)
        .ok_or(EvaluationError::MalformedReference { kind, field })
}

fn as_reference(map: &Map<String, Value>) -> Result<Option<Reference>, EvaluationError> {
    let Some(kind) = map.get("$type").and_then(Value::as_str) else {
        return Ok(None);
    };

    let reference = match kind {
        "Parameter" => Reference::Parameter {
            name: require(map, "Parameter", "name")?.to_owned(),
        },
        "Secret" => Reference::Secret {
            name: require(map, "Secret", "name")?.to_owned(),
        },
        "Connection" => Reference::Connection {
            kind: require(map, "Connection", "type")?.to_owned(),
            name: require(map, "Connection", "name")?.to_owned(),
        },
        "Output" => Reference::Output {
            from: require(map, "Output", "from")?.to_owned(),
            name: require(map, "Output", "name")?.to_owned(),
        },
        // Unknown $type tags pass through untouched as plain data.
        _ => return Ok(None),
    };

    Ok(Some(reference))
}

fn as_invocation(map: &Map<String, Value>) -> Option<(&str, &Value)> {
    if map.len() != 1 {
        return None;
    }

    let (key, args) = map.iter().next()?;
    key.strip_prefix("$fn.").map(|name| (name, args))
}

/// Collects every reference in the tree, including those nested in function
/// arguments, without resolving anything.
pub fn references(tree: &Value) -> Result<Vec<Reference>, EvaluationError> {
    let mut out = Vec::new();
    collect(tree, &mut out)?;
    Ok(out)
}

fn collect(tree: &Value, out: &mut Vec<Reference>) -> Result<(), EvaluationError> {
    match tree {
        Value::Object(map) => {
            if let Some(reference) = as_reference(map)? {
                out.push(reference);
            } else if let Some((_, args)) = as_invocation(map) {
                collect(args, out)?;
            } else {
                for value in map.values() {
                    collect(value, out)?;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        _ => {}
    }

    Ok(())
}

/// Evaluates the tree against the resolver, leaves first.
pub fn evaluate(tree: &Value, resolver: &dyn Resolve) -> Result<Evaluation, EvaluationError> {
    let evaluation = match tree {
        Value::Object(map) => {
            if let Some(reference) = as_reference(map)? {
                let resolved = match &reference {
                    Reference::Parameter { name } => resolver.parameter(name)?,
                    Reference::Secret { name } => resolver.secret(name)?,
                    Reference::Connection { kind, name } => resolver.connection(kind, name)?,
                    Reference::Output { from, name } => resolver.output(from, name)?,
                };

                match resolved {
                    Some(value) => Evaluation {
                        complete: true,
                        value,
                    },
                    None => Evaluation {
                        complete: false,
                        value: tree.clone(),
                    },
                }
            } else if let Some((name, args)) = as_invocation(map) {
                evaluate_invocation(tree, name, args, resolver)?
            } else {
                let mut out = Map::with_capacity(map.len());
                let mut complete = true;
                for (key, value) in map {
                    let child = evaluate(value, resolver)?;
                    complete &= child.complete;
                    out.insert(key.clone(), child.value);
                }

                Evaluation {
                    complete,
                    value: Value::Object(out),
                }
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut complete = true;
            for item in items {
                let child = evaluate(item, resolver)?;
                complete &= child.complete;
                out.push(child.value);
            }

            Evaluation {
                complete,
                value: Value::Array(out),
            }
        }
        scalar => Evaluation {
            complete: true,
            value: scalar.clone(),
        },
    };

    Ok(evaluation)
}

fn evaluate_invocation(
    original: &Value,
    name: &str,
    args: &Value,
    resolver: &dyn Resolve,
) -> Result<Evaluation, EvaluationError> {
    let invoke =
        fnlib::descriptor(name).ok_or_else(|| EvaluationError::UnknownFunction(name.to_owned()))?;

    let evaluated_args = match args {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let child = evaluate(item, resolver)?;
                if !child.complete {
                    // An unresolved argument keeps the whole invocation in
                    // place for a later evaluation pass.
                    return Ok(Evaluation {
                        complete: false,
                        value: original.clone(),
                    });
                }
                out.push(child.value);
            }
            out
        }
        single => {
            let child = evaluate(single, resolver)?;
            if !child.complete {
                return Ok(Evaluation {
                    complete: false,
                    value: original.clone(),
                });
            }
            vec![child.value]
        }
    };

    let value = invoke(evaluated_args).map_err(|source| EvaluationError::Function {
        name: name.to_owned(),
        source,
    })?;

    Ok(Evaluation {
        complete: true,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        let mut b = Bindings::default();
        b.parameters.insert("Hello".to_owned(), json!("World!"));
        b.secrets.insert("foo".to_owned(), json!("Hello"));
        b.connections.insert(
            ("aws".to_owned(), "test".to_owned()),
            json!({"accessKeyID": "AKIA123456789", "secretAccessKey": "very-nice-key"}),
        );
        b.outputs
            .insert(("build".to_owned(), "artifact".to_owned()), json!("a.tgz"));
        b
    }

    #[test]
    fn test_full_resolution() {
        let tree = json!({
            "secret": {"$type": "Secret", "name": "foo"},
            "param": {"$type": "Parameter", "name": "Hello"},
            "connection": {"$type": "Connection", "type": "aws", "name": "test"},
            "artifact": {"$type": "Output", "from": "build", "name": "artifact"},
        });

        let out = evaluate(&tree, &bindings()).unwrap();
        assert!(out.complete);
        assert_eq!(
            out.value,
            json!({
                "secret": "Hello",
                "param": "World!",
                "connection": {"accessKeyID": "AKIA123456789", "secretAccessKey": "very-nice-key"},
                "artifact": "a.tgz",
            })
        );
    }

    #[test]
    fn test_unresolved_reference_is_typed_placeholder() {
        let tree = json!({
            "known": {"$type": "Parameter", "name": "Hello"},
            "unknown": {"$type": "Secret", "name": "missing"},
        });

        let out = evaluate(&tree, &bindings()).unwrap();
        assert!(!out.complete);
        assert_eq!(out.value["known"], json!("World!"));
        assert_eq!(out.value["unknown"], json!({"$type": "Secret", "name": "missing"}));
    }

    #[test]
    fn test_strict_parameters() {
        let tree = json!({"$type": "Parameter", "name": "missing"});

        let mut strict = bindings();
        strict.strict_parameters = true;
        assert!(matches!(
            evaluate(&tree, &strict),
            Err(EvaluationError::UnknownParameter(name)) if name == "missing"
        ));

        // Lenient mode leaves the node in place for runtime evaluation.
        let out = evaluate(&tree, &bindings()).unwrap();
        assert!(!out.complete);
        assert_eq!(out.value, tree);
    }

    #[test]
    fn test_function_invocation() {
        let tree = json!({"$fn.equals": [1, 2]});
        let out = evaluate(&tree, &Bindings::default()).unwrap();
        assert!(out.complete);
        assert_eq!(out.value, json!(false));

        let tree = json!({"$fn.concat": ["a", {"$type": "Parameter", "name": "Hello"}]});
        let out = evaluate(&tree, &bindings()).unwrap();
        assert_eq!(out.value, json!("aWorld!"));
    }

    #[test]
    fn test_incomplete_function_argument_keeps_invocation() {
        let tree = json!({"$fn.concat": ["a", {"$type": "Secret", "name": "missing"}]});
        let out = evaluate(&tree, &bindings()).unwrap();
        assert!(!out.complete);
        assert_eq!(out.value, tree);
    }

    #[test]
    fn test_unknown_function_is_an_error() {
        let tree = json!({"$fn.frobnicate": []});
        assert!(matches!(
            evaluate(&tree, &Bindings::default()),
            Err(EvaluationError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_references_walks_function_arguments() {
        let tree = json!({
            "a": {"$type": "Secret", "name": "foo"},
            "b": {"$fn.concat": [{"$type": "Parameter", "name": "Hello"}, "x"]},
            "c": [{"$type": "Output", "from": "build", "name": "artifact"}],
        });

        let refs = references(&tree).unwrap();
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&Reference::Secret { name: "foo".to_owned() }));
        assert!(refs.contains(&Reference::Parameter { name: "Hello".to_owned() }));
        assert!(refs.contains(&Reference::Output {
            from: "build".to_owned(),
            name: "artifact".to_owned(),
        }));
    }

    #[test]
    fn test_malformed_reference() {
        let tree = json!({"$type": "Connection", "name": "test"});
        assert!(matches!(
            evaluate(&tree, &Bindings::default()),
            Err(EvaluationError::MalformedReference { kind: "Connection", field: "type" })
        ));
    }

    #[test]
    fn test_scalars_and_unknown_tags_pass_through() {
        let tree = json!({"$type": "Mystery", "n": 1, "s": [true, null]});
        let out = evaluate(&tree, &Bindings::default()).unwrap();
        assert!(out.complete);
        assert_eq!(out.value, tree);
    }
}
