//! Application manifests.
//!
//! One JSON manifest per application in the manifest directory. Integer
//! fields accept decimal numbers or `0x…` hex strings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use tracing::warn;
use vecu_core::phm::SupervisionConfig;

/// Restart behavior after an application exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    Never,
    /// Restart after an abnormal exit, up to the restart cap.
    OnFailure,
}

/// One application's manifest, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Logical application identifier.
    #[serde(default)]
    pub app_id: String,

    /// Path to the executable to spawn.
    #[serde(default)]
    pub executable: PathBuf,

    /// Whether the Execution Manager starts this application at boot.
    #[serde(default)]
    pub start_on_boot: bool,

    /// Restart policy.
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Informational log file path.
    #[serde(default)]
    pub log_file: Option<String>,

    /// App identifiers this application depends on at startup.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Health supervision block.
    #[serde(default)]
    pub phm: Option<PhmConfig>,

    /// Communication block.
    #[serde(default, rename = "com.someip")]
    pub someip: Option<SomeipConfig>,
}

impl AppConfig {
    /// Environment hint listing the events this application subscribes to,
    /// in the `service:instance:event@group` form the binding consumes.
    #[must_use]
    pub fn event_hint(&self) -> Option<String> {
        let com = self.someip.as_ref()?;
        if com.subscribe.is_empty() {
            return None;
        }
        let hints: Vec<String> = com
            .subscribe
            .iter()
            .map(|event| {
                format!(
                    "{:#x}:{:#x}:{:#x}@{:#x}",
                    com.service_id, com.instance_id, event, com.event_group
                )
            })
            .collect();
        Some(hints.join(","))
    }
}

/// PHM block of a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct PhmConfig {
    /// Supervision cycle length in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Unhealthy cycles tolerated before a violation.
    #[serde(default = "default_allowed_missed_cycles")]
    pub allowed_missed_cycles: u32,

    /// Required checkpoints. The literal string `"alive"` is accepted; the
    /// alive beat is required in every supervised cycle regardless.
    #[serde(default)]
    pub required_checkpoints: Vec<CheckpointEntry>,
}

const fn default_period_ms() -> u64 {
    1000
}

const fn default_allowed_missed_cycles() -> u32 {
    3
}

/// One entry of `required_checkpoints`: a number, a hex string, or the
/// literal `"alive"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CheckpointEntry {
    /// Numeric checkpoint id.
    Number(u32),
    /// `"alive"`, a decimal string, or a `0x…` hex string.
    Text(String),
}

impl PhmConfig {
    /// Translate the manifest block into a supervision configuration.
    ///
    /// Unparseable checkpoint entries are logged and skipped. The literal
    /// `"alive"` entry is accepted but adds no checkpoint: the alive beat
    /// is required in every supervised cycle.
    #[must_use]
    pub fn supervision_config(&self) -> SupervisionConfig {
        let mut required_checkpoints = Vec::new();

        for entry in &self.required_checkpoints {
            match entry {
                CheckpointEntry::Number(id) => required_checkpoints.push(*id),
                CheckpointEntry::Text(text) if text == "alive" => {}
                CheckpointEntry::Text(text) => match parse_u32(text) {
                    Some(id) => required_checkpoints.push(id),
                    None => warn!(entry = %text, "unparseable checkpoint entry, skipping"),
                },
            }
        }

        SupervisionConfig {
            supervision_cycle_ms: self.period_ms,
            allowed_missed_cycles: self.allowed_missed_cycles,
            required_checkpoints,
        }
    }
}

/// Communication block of a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct SomeipConfig {
    /// Service this application provides or consumes.
    #[serde(deserialize_with = "de_u16")]
    pub service_id: u16,

    /// Instance of the service.
    #[serde(deserialize_with = "de_u16")]
    pub instance_id: u16,

    /// Default event group.
    #[serde(default = "default_event_group", deserialize_with = "de_u16")]
    pub event_group: u16,

    /// Event ids the application subscribes to.
    #[serde(default, deserialize_with = "de_u16_vec")]
    pub subscribe: Vec<u16>,
}

const fn default_event_group() -> u16 {
    0x0001
}

/// Load every application manifest in `dir`, sorted by file name.
///
/// Entries that fail to parse or lack `app_id`/`executable` are logged and
/// skipped; the persistency manifest is not an application and is ignored.
#[must_use]
pub fn load_manifests(dir: &Path) -> Vec<AppConfig> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read manifest directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .filter(|p| p.file_name().is_some_and(|name| name != "persistency.json"))
        .collect();
    paths.sort();

    let mut apps = Vec::new();
    for path in paths {
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!(manifest = %path.display(), error = %e, "cannot read manifest");
                continue;
            }
        };
        match serde_json::from_str::<AppConfig>(&text) {
            Ok(config) if !config.app_id.is_empty() && !config.executable.as_os_str().is_empty() => {
                apps.push(config);
            }
            Ok(_) => {
                warn!(manifest = %path.display(), "manifest missing app_id or executable, skipping");
            }
            Err(e) => {
                warn!(manifest = %path.display(), error = %e, "invalid manifest, skipping");
            }
        }
    }
    apps
}

pub(crate) fn parse_u16(text: &str) -> Option<u16> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u16::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

pub(crate) fn parse_u32(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(u64),
    Text(String),
}

impl IntOrString {
    fn as_u16<E: serde::de::Error>(&self) -> Result<u16, E> {
        match self {
            Self::Int(v) => {
                u16::try_from(*v).map_err(|_| E::custom(format!("integer out of range: {v}")))
            }
            Self::Text(s) => {
                parse_u16(s).ok_or_else(|| E::custom(format!("invalid integer: {s:?}")))
            }
        }
    }
}

pub(crate) fn de_u16<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    IntOrString::deserialize(deserializer)?.as_u16()
}

fn de_u16_vec<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u16>, D::Error> {
    let raw = Vec::<IntOrString>::deserialize(deserializer)?;
    raw.iter().map(IntOrString::as_u16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config: AppConfig = serde_json::from_str(
            r#"{"app_id":"sensor","executable":"/opt/apps/sensor"}"#,
        )
        .unwrap();

        assert_eq!(config.app_id, "sensor");
        assert!(!config.start_on_boot);
        assert_eq!(config.restart_policy, RestartPolicy::Never);
        assert!(config.dependencies.is_empty());
        assert!(config.phm.is_none());
        assert!(config.someip.is_none());
    }

    #[test]
    fn test_hex_and_decimal_integers() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "app_id": "speed_client",
                "executable": "/opt/apps/speed_client",
                "restart_policy": "on-failure",
                "com.someip": {
                    "service_id": "0x1234",
                    "instance_id": 1,
                    "subscribe": ["0x8001", 32770]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.restart_policy, RestartPolicy::OnFailure);
        let com = config.someip.unwrap();
        assert_eq!(com.service_id, 0x1234);
        assert_eq!(com.instance_id, 1);
        assert_eq!(com.event_group, 0x0001);
        assert_eq!(com.subscribe, vec![0x8001, 0x8002]);
    }

    #[test]
    fn test_phm_block_with_alive_literal() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "app_id": "sensor",
                "executable": "/opt/apps/sensor",
                "phm": {
                    "period_ms": 10,
                    "allowed_missed_cycles": 1,
                    "required_checkpoints": ["alive", "0x3e9", 1002]
                }
            }"#,
        )
        .unwrap();

        let sup = config.phm.unwrap().supervision_config();
        assert_eq!(sup.supervision_cycle_ms, 10);
        assert_eq!(sup.allowed_missed_cycles, 1);
        assert_eq!(sup.required_checkpoints, vec![1001, 1002]);
    }

    #[test]
    fn test_phm_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"app_id":"a","executable":"/bin/a","phm":{}}"#,
        )
        .unwrap();

        let sup = config.phm.unwrap().supervision_config();
        assert_eq!(sup.supervision_cycle_ms, 1000);
        assert_eq!(sup.allowed_missed_cycles, 3);
        assert!(sup.required_checkpoints.is_empty());
    }

    #[test]
    fn test_event_hint_format() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "app_id": "client",
                "executable": "/bin/client",
                "com.someip": {
                    "service_id": "0x1234",
                    "instance_id": "0x1",
                    "event_group": "0x1",
                    "subscribe": ["0x8001"]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.event_hint().unwrap(), "0x1234:0x1:0x8001@0x1");
    }

    #[test]
    fn test_load_manifests_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("10-provider.json"),
            r#"{"app_id":"provider","executable":"/bin/provider","start_on_boot":true}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("20-client.json"),
            r#"{"app_id":"client","executable":"/bin/client","start_on_boot":true,"dependencies":["provider"]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("30-broken.json"), "{oops").unwrap();
        fs::write(dir.path().join("40-anonymous.json"), r#"{"executable":"/bin/x"}"#).unwrap();
        fs::write(dir.path().join("persistency.json"), r#"{"storages":[]}"#).unwrap();
        fs::write(dir.path().join("README.txt"), "not a manifest").unwrap();

        let apps = load_manifests(dir.path());
        let ids: Vec<&str> = apps.iter().map(|a| a.app_id.as_str()).collect();
        assert_eq!(ids, vec!["provider", "client"]);
    }
}
