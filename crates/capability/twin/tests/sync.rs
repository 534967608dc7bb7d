use async_trait::async_trait;
use gw_transport::{PropertyReporter, TransportError};
use gw_twin::{ReadyGate, SettingSpec, SettingsMap, TwinSynchronizer};
use serde_json::{Value, json};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct RecordingReporter {
    patches: Mutex<Vec<Value>>,
    fail: bool,
}

#[async_trait]
impl PropertyReporter for RecordingReporter {
    async fn report_properties(&self, patch: &Value) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::NotConnected);
        }
        self.patches.lock().unwrap().push(patch.clone());
        Ok(())
    }
}

fn synchronizer() -> TwinSynchronizer {
    let settings = SettingsMap::new([
        SettingSpec::new("wpDebugTelemetry", json!(false)),
        SettingSpec::new("wpServerNodeDiscoveryRoot", json!("")),
    ]);
    TwinSynchronizer::new("gateway", settings, ReadyGate::new())
}

#[tokio::test]
async fn known_settings_are_applied_and_acknowledged() {
    let sync = synchronizer();
    let reporter = RecordingReporter::default();
    let delta = json!({
        "$version": 4,
        "wpDebugTelemetry": { "value": true },
        "wpServerNodeDiscoveryRoot": "ns=2;s=Plant",
        "wpUnknown": 12
    });

    let outcome = sync.on_desired_properties(&delta, &reporter).await;

    assert_eq!(outcome.ignored, vec!["wpUnknown".to_string()]);
    assert!(sync.settings().get_bool("wpDebugTelemetry"));
    assert_eq!(sync.settings().get_str("wpServerNodeDiscoveryRoot"), "ns=2;s=Plant");
    let patches = reporter.patches.lock().unwrap();
    assert_eq!(patches.len(), 1);
    let patch = &patches[0];
    assert!(patch.get("$version").is_none());
    assert!(patch.get("wpUnknown").is_none());
    assert_eq!(
        patch["wpDebugTelemetry"],
        json!({ "value": true, "ac": 200, "ad": "completed", "av": 4 })
    );
    assert_eq!(patch["wpServerNodeDiscoveryRoot"]["value"], "ns=2;s=Plant");
}

#[tokio::test]
async fn falsy_values_fall_back_to_default() {
    let sync = synchronizer();
    let reporter = RecordingReporter::default();
    sync.on_desired_properties(
        &json!({ "$version": 1, "wpServerNodeDiscoveryRoot": "ns=2;s=Line1" }),
        &reporter,
    )
    .await;

    sync.on_desired_properties(
        &json!({ "$version": 2, "wpServerNodeDiscoveryRoot": null, "wpDebugTelemetry": 0 }),
        &reporter,
    )
    .await;

    assert_eq!(sync.settings().get_str("wpServerNodeDiscoveryRoot"), "");
    assert!(!sync.settings().get_bool("wpDebugTelemetry"));
    let patches = reporter.patches.lock().unwrap();
    assert_eq!(patches[1]["wpDebugTelemetry"]["value"], json!(false));
    assert_eq!(patches[1]["wpServerNodeDiscoveryRoot"]["av"], 2);
}

#[tokio::test]
async fn version_only_snapshot_releases_gate_without_report() {
    let sync = synchronizer();
    let reporter = RecordingReporter::default();
    let gate = sync.gate().clone();
    let waiter = tokio::spawn(async move { gate.wait().await });
    assert!(!sync.gate().is_released());

    let outcome = sync
        .on_desired_properties(&json!({ "$version": 1, "other": "x" }), &reporter)
        .await;

    assert!(outcome.reported.is_none());
    assert!(reporter.patches.lock().unwrap().is_empty());
    assert!(sync.gate().is_released());
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("gate released")
        .expect("waiter");
}

#[tokio::test]
async fn report_failure_still_releases_gate() {
    let sync = synchronizer();
    let reporter = RecordingReporter {
        patches: Mutex::new(Vec::new()),
        fail: true,
    };

    let outcome = sync
        .on_desired_properties(&json!({ "$version": 1, "wpDebugTelemetry": true }), &reporter)
        .await;

    assert_eq!(outcome.applied, vec!["wpDebugTelemetry".to_string()]);
    assert!(outcome.reported.is_none());
    assert!(sync.gate().is_released());
    // 闸门只释放一次
    assert!(!sync.gate().release());
}

#[tokio::test(start_paused = true)]
async fn bounded_wait_gives_up_without_snapshot() {
    let sync = synchronizer();

    assert!(!sync.gate().wait_within(Some(Duration::from_secs(30))).await);

    sync.gate().release();
    assert!(sync.gate().wait_within(Some(Duration::from_secs(30))).await);
    assert!(sync.gate().wait_within(None).await);
}
