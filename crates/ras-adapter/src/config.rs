use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Deserializer};

use ras_engine::engine::{EngineConfig, ProcessingMode};

/// Contents of the TOML configuration file.
///
/// ```toml
/// mode = "combined"
/// snapshot = "cluster.json"
/// action-journal = "actions.jsonl"
///
/// [engine]
/// delay-gate = "4s"
/// sweep-interval = "15s"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    pub mode: Option<ProcessingMode>,
    pub snapshot: Option<PathBuf>,
    pub action_journal: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub delay_gate: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub job_expiry_age: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub sweep_interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub backoff_step: Option<Duration>,
    pub backoff_cap: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub reconnect_pause: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub recursion_window: Option<Duration>,
    pub recursion_threshold: Option<u64>,
    pub point_lookup_limit: Option<usize>,
}

fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
        .transpose()
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration file {}", path.display()))?;
        let mut config: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration file {}", path.display()))?;

        // Paths in the file are relative to the file itself
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.snapshot = config.snapshot.map(|snapshot| base.join(snapshot));
        config.action_journal = config.action_journal.map(|journal| base.join(journal));
        Ok(config)
    }

    fn apply(&self, config: &mut EngineConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        let engine = &self.engine;
        if let Some(value) = engine.delay_gate {
            config.delay_gate = value;
        }
        if let Some(value) = engine.job_expiry_age {
            config.job_expiry_age = value;
        }
        if let Some(value) = engine.sweep_interval {
            config.sweep_interval = value;
        }
        if let Some(value) = engine.backoff_step {
            config.backoff_step = value;
        }
        if let Some(value) = engine.backoff_cap {
            config.backoff_cap = value;
        }
        if let Some(value) = engine.reconnect_pause {
            config.reconnect_pause = value;
        }
        if let Some(value) = engine.recursion_window {
            config.recursion_window = value;
        }
        if let Some(value) = engine.recursion_threshold {
            config.recursion_threshold = value;
        }
        if let Some(value) = engine.point_lookup_limit {
            config.point_lookup_limit = value;
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub mode: Option<ProcessingMode>,
    pub snapshot: Option<PathBuf>,
    pub action_journal: Option<PathBuf>,
}

/// Fully resolved settings of the adapter.
#[derive(Debug)]
pub struct AdapterSettings {
    pub engine: EngineConfig,
    pub snapshot: PathBuf,
    pub action_journal: Option<PathBuf>,
}

/// Combines (from the lowest priority) defaults, `RAS_*` environment variables, the
/// configuration file and the command line.
pub fn resolve_settings(
    base: EngineConfig,
    file: Option<ConfigFile>,
    cli: CliOverrides,
) -> anyhow::Result<AdapterSettings> {
    let mut engine = base;
    let file = file.unwrap_or_default();
    file.apply(&mut engine);
    if let Some(mode) = cli.mode {
        engine.mode = mode;
    }
    engine.validate().context("Invalid engine configuration")?;

    let snapshot = cli.snapshot.or(file.snapshot).ok_or_else(|| {
        anyhow!("No cluster snapshot was given, use --snapshot or `snapshot` in the configuration file")
    })?;
    Ok(AdapterSettings {
        engine,
        snapshot,
        action_journal: cli.action_journal.or(file.action_journal),
    })
}

pub fn load_settings(config: Option<&Path>, cli: CliOverrides) -> anyhow::Result<AdapterSettings> {
    let file = config.map(ConfigFile::load).transpose()?;
    resolve_settings(EngineConfig::from_env(), file, cli)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use ras_engine::engine::{EngineConfig, ProcessingMode};

    use crate::config::{CliOverrides, ConfigFile, resolve_settings};

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::with_prefix("ras").unwrap();
        let path = dir.path().join("adapter.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn load_file_with_durations() {
        let (dir, path) = write_config(
            r#"
mode = "control-operations-only"
snapshot = "cluster.json"

[engine]
delay-gate = "2s 500ms"
recursion-window = "10m"
point-lookup-limit = 5
"#,
        );
        let file = ConfigFile::load(&path).unwrap();
        assert_eq!(file.mode, Some(ProcessingMode::ControlOperationsOnly));
        assert_eq!(file.snapshot, Some(dir.path().join("cluster.json")));

        let settings = resolve_settings(EngineConfig::default(), Some(file), CliOverrides::default())
            .unwrap();
        assert_eq!(settings.engine.delay_gate, Duration::from_millis(2500));
        assert_eq!(settings.engine.recursion_window, Duration::from_secs(600));
        assert_eq!(settings.engine.point_lookup_limit, 5);
        assert_eq!(settings.engine.sweep_interval, Duration::from_secs(15));
        assert_eq!(settings.engine.mode, ProcessingMode::ControlOperationsOnly);
    }

    #[test]
    fn command_line_wins() {
        let (_dir, path) = write_config("mode = \"job-ids-only\"\nsnapshot = \"a.json\"\n");
        let file = ConfigFile::load(&path).unwrap();
        let settings = resolve_settings(
            EngineConfig::default(),
            Some(file),
            CliOverrides {
                mode: Some(ProcessingMode::Combined),
                snapshot: Some(PathBuf::from("/tmp/b.json")),
                action_journal: None,
            },
        )
        .unwrap();
        assert_eq!(settings.engine.mode, ProcessingMode::Combined);
        assert_eq!(settings.snapshot, PathBuf::from("/tmp/b.json"));
    }

    #[test]
    fn file_overrides_environment() {
        let (_dir, path) = write_config("snapshot = \"a.json\"\n[engine]\nbackoff-cap = 8\n");
        let mut base = EngineConfig::default();
        base.apply_overrides(|key| match key {
            "RAS_BACKOFF_CAP" => Some("2".to_string()),
            "RAS_SWEEP_INTERVAL_MS" => Some("1000".to_string()),
            _ => None,
        });
        let settings = resolve_settings(
            base,
            Some(ConfigFile::load(&path).unwrap()),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(settings.engine.backoff_cap, 8);
        assert_eq!(settings.engine.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn missing_snapshot_is_an_error() {
        assert!(
            resolve_settings(EngineConfig::default(), None, CliOverrides::default()).is_err()
        );
    }

    #[test]
    fn zero_backoff_is_an_error() {
        for content in [
            "snapshot = \"a.json\"\n[engine]\nbackoff-cap = 0\n",
            "snapshot = \"a.json\"\n[engine]\nbackoff-step = \"0s\"\n",
        ] {
            let (_dir, path) = write_config(content);
            let file = ConfigFile::load(&path).unwrap();
            assert!(
                resolve_settings(EngineConfig::default(), Some(file), CliOverrides::default())
                    .is_err()
            );
        }
    }

    #[test]
    fn reject_unknown_keys_and_bad_durations() {
        let (_dir, path) = write_config("snapshots = \"a.json\"\n");
        assert!(ConfigFile::load(&path).is_err());
        let (_dir, path) = write_config("[engine]\ndelay-gate = \"soon\"\n");
        assert!(ConfigFile::load(&path).is_err());
    }
}
