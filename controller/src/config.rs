//! Controller configuration files.
use mcmot_messages::Stage;
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Topic layout for `controller setup`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SetupConfig {
    pub(crate) pipeline: String,
    pub(crate) bootstrap_servers: Vec<String>,
    /// Partition count per stage topic.
    pub(crate) topics: BTreeMap<Stage, i32>,
}

impl SetupConfig {
    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        load(path)
    }
}

/// Worker fleet layout for `controller start`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PipelineConfig {
    pub(crate) pipeline: String,
    pub(crate) bootstrap_servers: Vec<String>,
    pub(crate) stages: Vec<WorkerConfig>,
}

impl PipelineConfig {
    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        load(path)
    }
}

fn default_replication() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct WorkerConfig {
    pub(crate) name: Stage,
    /// Inline stage configuration: a `module-config` section of
    /// stage-specific options and a `frame-sync` section, both translated
    /// into command line flags for the worker.
    #[serde(default)]
    pub(crate) config: serde_json::Value,
    #[serde(default = "default_replication")]
    pub(crate) replication_factor: u32,
    #[serde(default)]
    pub(crate) observability: bool,
}

impl WorkerConfig {
    /// Effective worker count; unification and analytics never replicate.
    pub(crate) fn replicas(&self) -> u32 {
        if self.name.single_instance() {
            self.replication_factor.min(1)
        } else {
            self.replication_factor
        }
    }
}

/// Flattens the inline config sections into clap-style flags. Booleans
/// become bare switches (omitted when false), arrays become
/// comma-delimited values, and the `frame-sync` `type` key maps to
/// `--sync-type`.
pub(crate) fn args_from_config(config: &serde_json::Value) -> Vec<String> {
    let mut args = Vec::new();
    for section in ["module-config", "frame-sync"] {
        let Some(map) = config.get(section).and_then(|value| value.as_object()) else {
            continue;
        };
        for (key, value) in map {
            let flag = if section == "frame-sync" && key == "type" {
                "--sync-type".to_owned()
            } else {
                format!("--{key}")
            };
            match value {
                serde_json::Value::Bool(true) => args.push(flag),
                serde_json::Value::Bool(false) | serde_json::Value::Null => {}
                serde_json::Value::Array(items) => {
                    args.push(flag);
                    args.push(
                        items
                            .iter()
                            .map(|item| match item {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                }
                serde_json::Value::String(s) => {
                    args.push(flag);
                    args.push(s.clone());
                }
                other => {
                    args.push(flag);
                    args.push(other.to_string());
                }
            }
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_config_parses_the_documented_shape() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("setup.json");
        std::fs::write(
            &path,
            r#"{
                "pipeline": "traffic",
                "bootstrap-servers": ["localhost:9092"],
                "topics": {"capture": 4, "detection": 4, "unification": 1}
            }"#,
        )
        .expect("write");

        let config = SetupConfig::load(&path).expect("loads");
        assert_eq!(config.pipeline, "traffic");
        assert_eq!(config.topics.get(&Stage::Capture), Some(&4));
    }

    #[test]
    fn worker_replicas_are_capped_for_single_instance_stages() {
        let worker: WorkerConfig = serde_json::from_str(
            r#"{"name": "unification", "replication-factor": 4}"#,
        )
        .expect("parses");
        assert_eq!(worker.replicas(), 1);

        let worker: WorkerConfig =
            serde_json::from_str(r#"{"name": "detection", "replication-factor": 4}"#)
                .expect("parses");
        assert_eq!(worker.replicas(), 4);
    }

    #[test]
    fn inline_config_flattens_to_flags() {
        let config: serde_json::Value = serde_json::from_str(
            r#"{
                "module-config": {
                    "confidence-score": 0.6,
                    "classes": ["car", "person"],
                    "prediction": true
                },
                "frame-sync": {
                    "type": "timestamp",
                    "fps": 30,
                    "unify": false
                }
            }"#,
        )
        .expect("parses");

        let args = args_from_config(&config);
        assert!(args.contains(&"--confidence-score".to_owned()));
        assert!(args.contains(&"0.6".to_owned()));
        assert!(args.contains(&"car,person".to_owned()));
        assert!(args.contains(&"--prediction".to_owned()));
        assert!(args.contains(&"--sync-type".to_owned()));
        assert!(args.contains(&"timestamp".to_owned()));
        assert!(!args.contains(&"--unify".to_owned()));
    }
}
