mod common;

use imageswap::admission;
use imageswap::config::AppConfig;
use imageswap::maps::{RuleTables, RuleTablesHandle};

use std::sync::Mutex;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn test_config() -> AppConfig {
    let _guard = ENV_LOCK.lock().unwrap();
    unsafe {
        std::env::set_var("IMAGESWAP_POD_NAME", "imageswap-test-pod");
    }
    let config = AppConfig::from_env().unwrap();
    unsafe {
        std::env::remove_var("IMAGESWAP_POD_NAME");
    }
    config
}

fn rule_tables_with_default(mirror: &str) -> RuleTablesHandle {
    let mut tables = RuleTables::default();
    tables.prefix.insert("default".to_string(), mirror.to_string());
    RuleTablesHandle::from_tables(tables)
}

#[test]
fn pod_with_init_and_regular_containers_produces_patches_for_both() {
    let config = test_config();
    let rule_tables = rule_tables_with_default("mirror.example.com");

    let review = common::pod_admission_review("req-1", "default", &["nginx:1.25"], &["busybox:1.36"]);
    let response = admission::review(&config, &rule_tables, review);

    assert_eq!(response["response"]["allowed"], true);
    let patch_b64 = response["response"]["patch"].as_str().expect("patch present");
    let patch_bytes = base64_decode(patch_b64);
    let ops: serde_json::Value = serde_json::from_slice(&patch_bytes).unwrap();
    let ops = ops.as_array().unwrap();

    assert_eq!(ops.len(), 2);
    let paths: Vec<&str> = ops.iter().map(|op| op["path"].as_str().unwrap()).collect();
    assert!(paths.contains(&"/spec/containers/0/image"));
    assert!(paths.contains(&"/spec/initContainers/0/image"));
    for op in ops {
        assert_eq!(op["op"], "replace");
        assert!(op["value"].as_str().unwrap().starts_with("mirror.example.com/"));
    }
}

#[test]
fn disabled_pod_is_allowed_with_no_patch() {
    let config = test_config();
    let rule_tables = rule_tables_with_default("mirror.example.com");

    let review = common::pod_admission_review("req-2", "default", &["nginx:1.25"], &[]);
    let review = common::with_disable_label(review, &config.disable_label, "disabled");
    let response = admission::review(&config, &rule_tables, review);

    assert_eq!(response["response"]["allowed"], true);
    assert!(response["response"].get("patch").is_none());
}

#[test]
fn unchanged_images_produce_no_patch_field() {
    let config = test_config();
    let rule_tables = RuleTablesHandle::from_tables(RuleTables::default());

    let review = common::pod_admission_review("req-3", "default", &["quay.io/coreos/flannel:v0.14.0"], &[]);
    let response = admission::review(&config, &rule_tables, review);

    assert_eq!(response["response"]["allowed"], true);
    assert!(response["response"].get("patch").is_none());
}

#[test]
fn deployment_template_containers_are_patched() {
    let config = test_config();
    let rule_tables = rule_tables_with_default("mirror.example.com");

    let review = common::deployment_admission_review("req-4", "default", &["redis:7"]);
    let response = admission::review(&config, &rule_tables, review);

    assert_eq!(response["response"]["allowed"], true);
    let patch_b64 = response["response"]["patch"].as_str().expect("patch present");
    let patch_bytes = base64_decode(patch_b64);
    let ops: serde_json::Value = serde_json::from_slice(&patch_bytes).unwrap();
    let ops = ops.as_array().unwrap();

    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["path"], "/spec/template/spec/containers/0/image");
    assert_eq!(ops[0]["value"], "mirror.example.com/redis:7");
}

fn base64_decode(input: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input).unwrap()
}
