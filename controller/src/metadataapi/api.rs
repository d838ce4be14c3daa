//! Endpoint handlers. Each one dispatches to the caller-bound managers and
//! serializes a JSON envelope.

use super::{ApiError, Caller};
use crate::expr::{evaluate, references, Bindings, Evaluation, Reference};
use crate::manager::{ManagerError, Secret};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Resolves every reference in the tree through the managers, tolerating
/// missing data (the evaluator reports it as incomplete).
async fn runtime_bindings(caller: &Caller, tree: &Value) -> Result<Bindings, ApiError> {
    let managers = &caller.0.managers;
    let mut bindings = Bindings::default();

    for reference in references(tree)? {
        match reference {
            Reference::Parameter { name } => match managers.parameters().get(&name).await {
                Ok(value) => {
                    bindings.parameters.insert(name, value);
                }
                Err(ManagerError::NotFound | ManagerError::Rejected) => {}
                Err(e) => return Err(e.into()),
            },
            Reference::Secret { name } => match managers.secrets().get(&name).await {
                Ok(secret) => {
                    bindings.secrets.insert(name, Value::String(secret.value));
                }
                Err(ManagerError::NotFound | ManagerError::Rejected) => {}
                Err(e) => return Err(e.into()),
            },
            Reference::Connection { kind, name } => {
                match managers.connections().get(&kind, &name).await {
                    Ok(connection) => {
                        bindings.connections.insert((kind, name), connection.value);
                    }
                    Err(ManagerError::NotFound | ManagerError::Rejected) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Reference::Output { from, name } => {
                match managers.step_outputs().get(&from, &name).await {
                    Ok(output) => {
                        bindings.outputs.insert((from, name), output.value);
                    }
                    Err(ManagerError::NotFound | ManagerError::Rejected) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Ok(bindings)
}

async fn evaluate_for_caller(caller: &Caller, tree: &Value) -> Result<Evaluation, ApiError> {
    let bindings = runtime_bindings(caller, tree).await?;
    Ok(evaluate(tree, &bindings)?)
}

/// GET /spec — the step's evaluated spec as `{complete, value}`.
pub async fn get_spec(caller: Caller) -> Result<Json<Evaluation>, ApiError> {
    let tree = caller.0.managers.spec().get().await?;
    let evaluation = evaluate_for_caller(&caller, &tree).await?;
    Ok(Json(evaluation))
}

/// GET /environment — the step's evaluated env map.
pub async fn get_environment(caller: Caller) -> Result<Json<Evaluation>, ApiError> {
    let tree = Value::Object(Map::from_iter(caller.0.env.clone()));
    let evaluation = evaluate_for_caller(&caller, &tree).await?;
    Ok(Json(evaluation))
}

/// GET /environment/{name} — one evaluated env entry.
pub async fn get_environment_variable(
    caller: Caller,
    Path(name): Path<String>,
) -> Result<Json<Evaluation>, ApiError> {
    let tree = caller
        .0
        .env
        .get(&name)
        .cloned()
        .ok_or(ApiError::Manager(ManagerError::NotFound))?;

    let evaluation = evaluate_for_caller(&caller, &tree).await?;
    Ok(Json(evaluation))
}

/// GET /conditions — the step's `when` expression, evaluated. Incomplete
/// evaluations return an empty map so the condition poller keeps waiting.
pub async fn get_conditions(caller: Caller) -> Result<Json<Value>, ApiError> {
    let tree = caller.0.managers.conditions().get().await?;
    let evaluation = evaluate_for_caller(&caller, &tree).await?;

    if !evaluation.complete {
        return Ok(Json(json!({})));
    }

    Ok(Json(json!({"success": evaluation.value})))
}

/// GET /secrets/{name} — `{key, value}` with the value base64-URL-encoded.
pub async fn get_secret(
    caller: Caller,
    Path(name): Path<String>,
) -> Result<Json<Secret>, ApiError> {
    let secret = caller.0.managers.secrets().get(&name).await?;

    Ok(Json(Secret {
        key: secret.key,
        value: BASE64_URL.encode(secret.value.as_bytes()),
    }))
}

/// GET /connections/{type}/{name}
pub async fn get_connection(
    caller: Caller,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let connection = caller.0.managers.connections().get(&kind, &name).await?;
    Ok(Json(connection.value))
}

/// GET /state/{step}/{key}
pub async fn get_state(
    caller: Caller,
    Path((step, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let value = caller.0.managers.state().get(&step, &key).await?;
    Ok(Json(value))
}

/// PUT /state/{key}
pub async fn put_state(
    caller: Caller,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> Result<StatusCode, ApiError> {
    caller.0.managers.state().set(&key, value).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /outputs/{step}/{key}
pub async fn get_output(
    caller: Caller,
    Path((step, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let output = caller.0.managers.step_outputs().get(&step, &key).await?;
    Ok(Json(output.value))
}

/// PUT /outputs/{key} — write-once per key; a second write conflicts.
pub async fn put_output(
    caller: Caller,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> Result<StatusCode, ApiError> {
    caller.0.managers.step_outputs().set(&key, value).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// POST /events — appends to the step's ordered event log.
pub async fn post_event(
    caller: Caller,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event = caller
        .0
        .managers
        .events()
        .emit(&request.name, request.data)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(serde_json::to_value(&event).map_err(ManagerError::from)?)))
}
