//! 孪生期望属性同步。
//!
//! 期望属性增量写入本地设置表，逐项回执；第一次收到期望属性后释放就绪闸门。

mod gate;
mod settings;

pub use gate::ReadyGate;
pub use settings::{SettingSpec, SettingsMap, is_truthy};

use api_contract::PropertyAck;
use gw_transport::PropertyReporter;
use serde_json::{Map, Value};
use tracing::{info, warn};

/// 期望属性中的版本标记。
pub const VERSION_KEY: &str = "$version";

/// 单次增量的处理结果。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredOutcome {
    pub applied: Vec<String>,
    pub ignored: Vec<String>,
    /// 已上报的回执补丁；没有可回执项时为 None。
    pub reported: Option<Value>,
}

/// 期望属性同步器（每个会话一个）。
pub struct TwinSynchronizer {
    label: String,
    settings: SettingsMap,
    gate: ReadyGate,
}

impl TwinSynchronizer {
    pub fn new(label: impl Into<String>, settings: SettingsMap, gate: ReadyGate) -> Self {
        Self {
            label: label.into(),
            settings,
            gate,
        }
    }

    pub fn settings(&self) -> &SettingsMap {
        &self.settings
    }

    pub fn gate(&self) -> &ReadyGate {
        &self.gate
    }

    /// 应用一次期望属性增量。
    ///
    /// 未知设置仅记录日志；回执上报失败不影响闸门释放。
    pub async fn on_desired_properties(
        &self,
        delta: &Value,
        reporter: &dyn PropertyReporter,
    ) -> DesiredOutcome {
        let mut outcome = DesiredOutcome::default();
        let version = delta.get(VERSION_KEY).cloned().unwrap_or(Value::Null);
        let mut patch = Map::new();

        if let Some(entries) = delta.as_object() {
            for (name, raw) in entries {
                if name == VERSION_KEY {
                    continue;
                }
                match self.settings.apply(name, unwrap_value(raw)) {
                    Some(value) => {
                        let ack = PropertyAck::completed(value, version.clone());
                        patch.insert(name.clone(), serde_json::to_value(ack).unwrap_or(Value::Null));
                        outcome.applied.push(name.clone());
                    }
                    None => {
                        warn!(
                            target: "gw.twin",
                            session = %self.label,
                            setting = %name,
                            "desired_property_unknown"
                        );
                        outcome.ignored.push(name.clone());
                    }
                }
            }
        }

        if !patch.is_empty() {
            let patch = Value::Object(patch);
            match reporter.report_properties(&patch).await {
                Ok(()) => {
                    info!(
                        target: "gw.twin",
                        session = %self.label,
                        applied = outcome.applied.len(),
                        "desired_properties_acknowledged"
                    );
                    outcome.reported = Some(patch);
                }
                Err(err) => warn!(
                    target: "gw.twin",
                    session = %self.label,
                    error = %err,
                    "desired_properties_report_failed"
                ),
            }
        }

        if self.gate.release() {
            info!(target: "gw.twin", session = %self.label, "ready_gate_released");
        }
        outcome
    }
}

/// `{ "value": x }` 形式的期望值取出 x。
fn unwrap_value(raw: &Value) -> &Value {
    match raw.as_object() {
        Some(object) if object.len() == 1 => object.get("value").unwrap_or(raw),
        _ => raw,
    }
}
