// Common test utilities for integration tests
//
// Helper fixtures for building AdmissionReview payloads carrying Pod and
// Deployment-template workloads with swappable container images.

use serde_json::{Value, json};

/// Builds a `Pod`-shaped AdmissionReview request body, with one container
/// per entry in `images` and an optional set of `initContainers` images.
pub fn pod_admission_review(uid: &str, namespace: &str, images: &[&str], init_images: &[&str]) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": uid,
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "namespace": namespace,
            "object": {
                "metadata": {"name": "test-pod", "namespace": namespace},
                "spec": {
                    "initContainers": init_images.iter().enumerate().map(|(i, image)| json!({
                        "name": format!("init-{i}"),
                        "image": image,
                    })).collect::<Vec<_>>(),
                    "containers": images.iter().enumerate().map(|(i, image)| json!({
                        "name": format!("app-{i}"),
                        "image": image,
                    })).collect::<Vec<_>>(),
                }
            }
        }
    })
}

/// Builds a `Deployment`-shaped AdmissionReview request body whose pod
/// template carries the given container images.
pub fn deployment_admission_review(uid: &str, namespace: &str, images: &[&str]) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": uid,
            "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
            "namespace": namespace,
            "object": {
                "metadata": {"name": "test-deploy", "namespace": namespace},
                "spec": {
                    "template": {
                        "spec": {
                            "containers": images.iter().enumerate().map(|(i, image)| json!({
                                "name": format!("app-{i}"),
                                "image": image,
                            })).collect::<Vec<_>>(),
                        }
                    }
                }
            }
        }
    })
}

/// Sets the disable label on a Pod/Deployment-shaped admission review body
/// produced by the builders above.
pub fn with_disable_label(mut review: Value, label: &str, value: &str) -> Value {
    let labels = review
        .pointer_mut("/request/object/metadata")
        .and_then(Value::as_object_mut)
        .expect("object metadata present");
    labels
        .entry("labels")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .unwrap()
        .insert(label.to_string(), json!(value));
    review
}
