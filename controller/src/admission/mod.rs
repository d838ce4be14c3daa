//! Pod-mutation admission logic for tool injection.
//!
//! Pods annotated with `controller.relay.sh/volume-claim` get the shared
//! read-only `entrypoint` volume (backed by the named PersistentVolumeClaim)
//! and an `entrypoint -> /data` mount in every container. The JSON patch is
//! computed against the original raw object from the AdmissionReview, never
//! against a re-serialized pod.

use crate::model::{
    ENTRYPOINT_VOLUME_MOUNT_NAME, ENTRYPOINT_VOLUME_MOUNT_PATH,
    RELAY_CONTROLLER_VOLUME_CLAIM_ANNOTATION,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

fn entrypoint_volume(claim: &str) -> Value {
    json!({
        "name": ENTRYPOINT_VOLUME_MOUNT_NAME,
        "persistentVolumeClaim": {
            "claimName": claim,
            "readOnly": true,
        },
    })
}

fn entrypoint_mount() -> Value {
    json!({
        "name": ENTRYPOINT_VOLUME_MOUNT_NAME,
        "mountPath": ENTRYPOINT_VOLUME_MOUNT_PATH,
        "readOnly": true,
    })
}

fn has_named_entry(list: Option<&Value>, name: &str) -> bool {
    list.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .any(|item| item.get("name").and_then(Value::as_str) == Some(name))
        })
        .unwrap_or(false)
}

/// Computes the JSON-patch operations for one pod object. Returns `None`
/// when no mutation is required, which makes re-application a no-op.
pub fn mutate_pod(pod: &Value) -> Option<Vec<Value>> {
    let claim = pod
        .pointer("/metadata/annotations")?
        .get(RELAY_CONTROLLER_VOLUME_CLAIM_ANNOTATION)?
        .as_str()?;

    let mut ops = Vec::new();

    let volumes = pod.pointer("/spec/volumes");
    if !has_named_entry(volumes, ENTRYPOINT_VOLUME_MOUNT_NAME) {
        match volumes.and_then(Value::as_array) {
            Some(_) => ops.push(json!({
                "op": "add",
                "path": "/spec/volumes/-",
                "value": entrypoint_volume(claim),
            })),
            None => ops.push(json!({
                "op": "add",
                "path": "/spec/volumes",
                "value": [entrypoint_volume(claim)],
            })),
        }
    }

    if let Some(containers) = pod.pointer("/spec/containers").and_then(Value::as_array) {
        for (i, container) in containers.iter().enumerate() {
            let mounts = container.get("volumeMounts");
            if has_named_entry(mounts, ENTRYPOINT_VOLUME_MOUNT_NAME) {
                continue;
            }

            match mounts.and_then(Value::as_array) {
                Some(_) => ops.push(json!({
                    "op": "add",
                    "path": format!("/spec/containers/{i}/volumeMounts/-"),
                    "value": entrypoint_mount(),
                })),
                None => ops.push(json!({
                    "op": "add",
                    "path": format!("/spec/containers/{i}/volumeMounts"),
                    "value": [entrypoint_mount()],
                })),
            }
        }
    }

    if ops.is_empty() {
        None
    } else {
        Some(ops)
    }
}

/// Handles a full AdmissionReview document and produces the response
/// envelope. Pods without the annotation (and non-pod objects) are allowed
/// unchanged.
pub fn review(review: &Value) -> Value {
    let uid = review
        .pointer("/request/uid")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut response = json!({
        "uid": uid,
        "allowed": true,
    });

    if let Some(pod) = review.pointer("/request/object") {
        if let Some(ops) = mutate_pod(pod) {
            debug!("admitting pod with {} tool-injection patch op(s)", ops.len());
            let patch = serde_json::to_vec(&Value::Array(ops))
                .unwrap_or_else(|_| b"[]".to_vec());
            response["patchType"] = json!("JSONPatch");
            response["patch"] = json!(BASE64.encode(patch));
        }
    }

    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated_pod() -> Value {
        json!({
            "metadata": {
                "name": "step-pod",
                "annotations": {
                    RELAY_CONTROLLER_VOLUME_CLAIM_ANNOTATION: "my-claim",
                },
            },
            "spec": {
                "containers": [
                    {"name": "step", "image": "alpine:latest"},
                    {
                        "name": "sidecar",
                        "image": "alpine:latest",
                        "volumeMounts": [{"name": "workdir", "mountPath": "/work"}],
                    },
                ],
            },
        })
    }

    fn apply(pod: &Value, ops: &[Value]) -> Value {
        // Minimal JSON-patch apply covering the "add" ops this module emits.
        let mut out = pod.clone();
        for op in ops {
            let path = op["path"].as_str().unwrap();
            let value = op["value"].clone();
            if let Some(parent) = path.strip_suffix("/-") {
                out.pointer_mut(parent)
                    .and_then(Value::as_array_mut)
                    .unwrap()
                    .push(value);
            } else {
                let (parent, key) = path.rsplit_once('/').unwrap();
                let target = if parent.is_empty() {
                    &mut out
                } else {
                    out.pointer_mut(parent).unwrap()
                };
                target[key] = value;
            }
        }
        out
    }

    #[test]
    fn test_injects_volume_and_mounts() {
        let pod = annotated_pod();
        let ops = mutate_pod(&pod).unwrap();

        let mutated = apply(&pod, &ops);
        let volumes = mutated.pointer("/spec/volumes").unwrap().as_array().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0]["name"], "entrypoint");
        assert_eq!(volumes[0]["persistentVolumeClaim"]["claimName"], "my-claim");
        assert_eq!(volumes[0]["persistentVolumeClaim"]["readOnly"], true);

        for container in mutated
            .pointer("/spec/containers")
            .unwrap()
            .as_array()
            .unwrap()
        {
            let mounts = container["volumeMounts"].as_array().unwrap();
            assert!(mounts.iter().any(|m| {
                m["name"] == "entrypoint" && m["mountPath"] == "/data" && m["readOnly"] == true
            }));
        }
    }

    #[test]
    fn test_idempotent_on_second_application() {
        let pod = annotated_pod();
        let mutated = apply(&pod, &mutate_pod(&pod).unwrap());

        assert_eq!(mutate_pod(&mutated), None);
    }

    #[test]
    fn test_missing_annotation_is_allowed_unchanged() {
        let pod = json!({
            "metadata": {"name": "plain-pod"},
            "spec": {"containers": [{"name": "c", "image": "alpine:latest"}]},
        });
        assert_eq!(mutate_pod(&pod), None);
    }

    #[test]
    fn test_existing_volume_only_adds_missing_mounts() {
        let mut pod = annotated_pod();
        pod["spec"]["volumes"] = json!([{
            "name": "entrypoint",
            "persistentVolumeClaim": {"claimName": "my-claim", "readOnly": true},
        }]);

        let ops = mutate_pod(&pod).unwrap();
        assert!(ops
            .iter()
            .all(|op| op["path"].as_str().unwrap().contains("volumeMounts")));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_review_envelope() {
        let doc = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "abc-123",
                "object": annotated_pod(),
            },
        });

        let out = review(&doc);
        assert_eq!(out["response"]["uid"], "abc-123");
        assert_eq!(out["response"]["allowed"], true);
        assert_eq!(out["response"]["patchType"], "JSONPatch");

        let patch = BASE64
            .decode(out["response"]["patch"].as_str().unwrap())
            .unwrap();
        let ops: Vec<Value> = serde_json::from_slice(&patch).unwrap();
        assert!(!ops.is_empty());
    }

    #[test]
    fn test_review_without_annotation_has_no_patch() {
        let doc = json!({
            "request": {
                "uid": "abc-456",
                "object": {"metadata": {"name": "x"}, "spec": {"containers": []}},
            },
        });

        let out = review(&doc);
        assert_eq!(out["response"]["allowed"], true);
        assert!(out["response"].get("patch").is_none());
    }
}
