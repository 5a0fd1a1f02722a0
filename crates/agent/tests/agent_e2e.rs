//! End-to-end scenarios driving the watchers against real plans: a local
//! plan directory with position records, and a remote object in an
//! in-memory store with feedback write-back.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_util::sync::CancellationToken;

use sentinel_agent::applier::{Applier, ApplierOptions};
use sentinel_agent::image::{StagerConfig, Utility};
use sentinel_agent::localplan::{LocalWatcher, PlanPosition};
use sentinel_agent::remoteplan::{
    RemoteWatcher, APPLIED_CHECKSUM_KEY, FAILED_CHECKSUM_KEY, FAILURE_COUNT_KEY, PLAN_KEY,
    SUCCESS_COUNT_KEY,
};
use sentinel_agent::store::{MemoryStore, ObjectSnapshot};
use sentinel_common::{checksum, codec, timefmt};

fn applier(tmp: &Path) -> Arc<Applier> {
    Arc::new(Applier::new(
        ApplierOptions {
            work_dir: tmp.join("work"),
            preserve_work_dir: false,
            applied_plan_dir: None,
            interlock_dir: None,
        },
        Arc::new(Utility::new(StagerConfig::default())),
    ))
}

fn read_position(path: &Path) -> PlanPosition {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

fn field(snapshot: &ObjectSnapshot, key: &str) -> String {
    String::from_utf8(snapshot.data.get(key).cloned().unwrap_or_default()).unwrap()
}

/// Wait until the store's object satisfies `predicate` (or panic after a
/// generous deadline).
async fn wait_for(store: &MemoryStore, predicate: impl Fn(&ObjectSnapshot) -> bool) -> ObjectSnapshot {
    for _ in 0..200 {
        if let Some(snapshot) = store.current() {
            if predicate(&snapshot) {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("store never reached the expected state");
}

// S1: a plan with a single file materialises it and records the checksum.
#[tokio::test]
async fn single_file_plan_applies_and_records_checksum() {
    let tmp = tempfile::tempdir().unwrap();
    let plans = tmp.path().join("plans");
    std::fs::create_dir_all(&plans).unwrap();

    let target = tmp.path().join("e2e-test-file.txt");
    let raw = serde_json::to_vec(&serde_json::json!({
        "files": [{
            "path": target.to_str().unwrap(),
            "content": BASE64.encode(b"hello from e2e test"),
            "permissions": "0644",
            "uid": -1,
            "gid": -1
        }]
    }))
    .unwrap();
    std::fs::write(plans.join("file.plan"), &raw).unwrap();

    let watcher = LocalWatcher::new(applier(tmp.path()), vec![plans.clone()]);
    let ctx = CancellationToken::new();
    watcher.scan_base(&ctx, &plans).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "hello from e2e test"
    );
    let position = read_position(&plans.join("file.pos"));
    assert_eq!(position.applied_checksum, checksum(&raw));
}

// S2 + S3: a failing instruction records failure feedback; fixing the plan
// recovers and clears it.
#[tokio::test]
async fn remote_failure_then_recovery() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());

    let failing = serde_json::to_vec(&serde_json::json!({
        "instructions": [{"name": "step", "command": "sh", "args": ["-c", "exit 1"]}]
    }))
    .unwrap();
    store.seed("uid-e2e", {
        let mut data = BTreeMap::new();
        data.insert(PLAN_KEY.to_string(), failing.clone());
        data
    });

    let watcher = RemoteWatcher::new(applier(tmp.path()), store.clone());
    let ctx = CancellationToken::new();
    let handle = tokio::spawn(watcher.run(ctx.clone()));

    // S2: failure feedback appears
    let failed = wait_for(&store, |s| field(s, FAILURE_COUNT_KEY) == "1").await;
    assert_eq!(field(&failed, FAILED_CHECKSUM_KEY), checksum(&failing));
    assert_eq!(field(&failed, APPLIED_CHECKSUM_KEY), "");
    assert_eq!(field(&failed, SUCCESS_COUNT_KEY), "0");

    // S3: the plan is corrected; the new checksum is not in cooldown
    let fixed = serde_json::to_vec(&serde_json::json!({
        "instructions": [{"name": "step", "command": "sh", "args": ["-c", "echo success"]}]
    }))
    .unwrap();
    store.set_field(PLAN_KEY, &fixed);

    let recovered =
        wait_for(&store, |s| field(s, APPLIED_CHECKSUM_KEY) == checksum(&fixed)).await;
    assert_eq!(field(&recovered, FAILURE_COUNT_KEY), "0");
    assert_eq!(field(&recovered, FAILED_CHECKSUM_KEY), "");
    assert_eq!(field(&recovered, SUCCESS_COUNT_KEY), "1");

    ctx.cancel();
    handle.await.unwrap().unwrap();
}

// S4: instructions see the execution directory and attempt number in their
// environment.
#[tokio::test]
async fn environment_injection_is_visible_in_saved_output() {
    let tmp = tempfile::tempdir().unwrap();
    let plans = tmp.path().join("plans");
    std::fs::create_dir_all(&plans).unwrap();

    let raw = serde_json::to_vec(&serde_json::json!({
        "instructions": [{
            "name": "env-echo",
            "command": "sh",
            "args": ["-c", "echo $CATTLE_AGENT_EXECUTION_PWD $CATTLE_AGENT_ATTEMPT_NUMBER"],
            "saveOutput": true
        }]
    }))
    .unwrap();
    std::fs::write(plans.join("env.plan"), &raw).unwrap();

    let watcher = LocalWatcher::new(applier(tmp.path()), vec![plans.clone()]);
    let ctx = CancellationToken::new();
    watcher.scan_base(&ctx, &plans).await.unwrap();

    let position = read_position(&plans.join("env.pos"));
    let outputs = codec::decode_one_time(&position.output).unwrap();
    let text = String::from_utf8(outputs["env-echo"].clone()).unwrap();
    let work_dir = tmp.path().join("work");
    assert!(
        text.contains(work_dir.to_str().unwrap()),
        "output {text:?} should name the execution directory"
    );
    assert!(text.contains(" 1"), "attempt number should be 1");
}

// S5: a periodic instruction runs, records its exit and a UnixDate
// timestamp, and is not re-run inside its period.
#[tokio::test]
async fn periodic_instruction_records_runtime_and_respects_period() {
    let tmp = tempfile::tempdir().unwrap();
    let plans = tmp.path().join("plans");
    std::fs::create_dir_all(&plans).unwrap();

    let raw = serde_json::to_vec(&serde_json::json!({
        "periodicInstructions": [{
            "name": "heartbeat",
            "command": "sh",
            "args": ["-c", "echo periodic-running"],
            "periodSeconds": 3600
        }]
    }))
    .unwrap();
    std::fs::write(plans.join("tick.plan"), &raw).unwrap();

    let watcher = LocalWatcher::new(applier(tmp.path()), vec![plans.clone()]);
    let ctx = CancellationToken::new();
    watcher.scan_base(&ctx, &plans).await.unwrap();

    let position = read_position(&plans.join("tick.pos"));
    let outputs = codec::decode_periodic(&position.periodic_output).unwrap();
    let record = &outputs["heartbeat"];
    assert_eq!(record.exit_code, 0);
    assert_eq!(record.stdout, b"periodic-running\n");
    let first_run = timefmt::parse_unix_date(&record.last_successful_run_time).unwrap();

    // a second pass inside the period leaves the record untouched
    watcher.scan_base(&ctx, &plans).await.unwrap();
    let position = read_position(&plans.join("tick.pos"));
    let outputs = codec::decode_periodic(&position.periodic_output).unwrap();
    assert_eq!(
        timefmt::parse_unix_date(&outputs["heartbeat"].last_successful_run_time).unwrap(),
        first_run
    );
}

// Probe statuses reach the position record and converge on healthy=false
// for an unreachable endpoint.
#[tokio::test]
async fn probe_status_lands_in_position_record() {
    let tmp = tempfile::tempdir().unwrap();
    let plans = tmp.path().join("plans");
    std::fs::create_dir_all(&plans).unwrap();

    let raw = serde_json::to_vec(&serde_json::json!({
        "probes": {
            "unreachable": {
                "httpGet": {"url": "http://192.0.2.1:9/healthz"},
                "timeoutSeconds": 1,
                "failureThreshold": 1
            }
        }
    }))
    .unwrap();
    std::fs::write(plans.join("probe.plan"), &raw).unwrap();

    let watcher = LocalWatcher::new(applier(tmp.path()), vec![plans.clone()]);
    let ctx = CancellationToken::new();
    watcher.scan_base(&ctx, &plans).await.unwrap();

    let position = read_position(&plans.join("probe.pos"));
    let status = position.probe_status.get("unreachable").unwrap();
    assert_eq!(status.failure_count, 1);
    assert!(!status.healthy);
}
