use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 已知设置项及其默认值。
#[derive(Debug, Clone)]
pub struct SettingSpec {
    pub name: String,
    pub default: Value,
}

impl SettingSpec {
    pub fn new(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }
}

/// 会话级设置表，可克隆共享，仅由同步器写入。
#[derive(Debug, Clone, Default)]
pub struct SettingsMap {
    defaults: Arc<HashMap<String, Value>>,
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl SettingsMap {
    pub fn new(specs: impl IntoIterator<Item = SettingSpec>) -> Self {
        let defaults: HashMap<String, Value> = specs
            .into_iter()
            .map(|spec| (spec.name, spec.default))
            .collect();
        Self {
            values: Arc::new(RwLock::new(defaults.clone())),
            defaults: Arc::new(defaults),
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.defaults.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().ok().and_then(|map| map.get(name).cloned())
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).as_ref().is_some_and(is_truthy)
    }

    pub fn get_str(&self, name: &str) -> String {
        self.get(name)
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.read().map(|map| map.clone()).unwrap_or_default()
    }

    /// 写入已知设置；假值回落到默认值。未知设置返回 None。
    pub(crate) fn apply(&self, name: &str, value: &Value) -> Option<Value> {
        let default = self.defaults.get(name)?;
        let effective = if is_truthy(value) {
            value.clone()
        } else {
            default.clone()
        };
        if let Ok(mut map) = self.values.write() {
            map.insert(name.to_string(), effective.clone());
        }
        Some(effective)
    }
}

/// JSON 值的真值判定：null、false、0、空字符串视为假。
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
