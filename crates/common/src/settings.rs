//! Configuration reader.
//!
//! Settings come from one or more YAML files merged in order (later files
//! override earlier ones). Component options resolve through a two-level
//! chain: the per-instance section `tree.<name>.<key>` wins over the
//! per-type default `data_collection.<TypeName>.<key>`, which wins over the
//! hard default supplied by the caller.

use serde::de::DeserializeOwned;
use serde_yaml::Value as Yaml;
use std::path::Path;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("can not read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config file {path} is not valid YAML: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    root: Yaml,
}

impl Settings {
    pub fn from_yaml_str(raw: &str) -> Result<Self, SettingsError> {
        let root = serde_yaml::from_str(raw).map_err(|source| SettingsError::Parse {
            path: "<inline>".to_owned(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SettingsError> {
        let mut root = Yaml::Null;
        for path in paths {
            let path = path.as_ref();
            let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let layer: Yaml = serde_yaml::from_str(&raw).map_err(|source| SettingsError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            root = merge(root, layer);
        }
        Ok(Self { root })
    }

    fn lookup(&self, path: &[&str]) -> Option<&Yaml> {
        let mut node = &self.root;
        for key in path {
            node = node.get(key)?;
        }
        Some(node)
    }

    /// Typed lookup by path; a present-but-mistyped value counts as absent
    /// and is logged.
    pub fn get<T: DeserializeOwned>(&self, path: &[&str]) -> Option<T> {
        let node = self.lookup(path)?;
        if node.is_null() {
            return None;
        }
        match serde_yaml::from_value(node.clone()) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(key = %path.join("."), %error, "ignoring mistyped config value");
                None
            }
        }
    }

    /// Component option lookup: `tree.<instance>.<key>`, then the type-wide
    /// default under `data_collection.<type>.<key>`.
    pub fn component<T: DeserializeOwned>(
        &self,
        instance: &str,
        type_name: &str,
        key: &str,
    ) -> Option<T> {
        self.get(&["tree", instance, key])
            .or_else(|| self.get(&["data_collection", type_name, key]))
    }

    pub fn component_or<T: DeserializeOwned>(
        &self,
        instance: &str,
        type_name: &str,
        key: &str,
        default: T,
    ) -> T {
        self.component(instance, type_name, key).unwrap_or(default)
    }

    /// Raw subtree as JSON, used for the device tree under
    /// `tree.<adapter>.observatory` and for the published site block.
    pub fn subtree_json(&self, path: &[&str]) -> Option<serde_json::Value> {
        let node = self.lookup(path)?;
        match serde_json::to_value(node) {
            Ok(json) => Some(json),
            Err(error) => {
                warn!(key = %path.join("."), %error, "config subtree is not JSON-representable");
                None
            }
        }
    }

    pub fn nats(&self) -> NatsSettings {
        NatsSettings {
            host: self.get(&["nats", "host"]).unwrap_or_else(|| "localhost".to_owned()),
            port: self.get(&["nats", "port"]).unwrap_or(4222),
            alpaca_config_stream: self
                .get(&["nats", "streams", "alpaca_config"])
                .unwrap_or_else(|| "tic.config.observatory".to_owned()),
            plan_stream: self
                .get(&["nats", "streams", "plan_stream"])
                .unwrap_or_else(|| "tic.status.{}.program.current".to_owned()),
            status_stream: self
                .get(&["nats", "streams", "status_stream"])
                .unwrap_or_else(|| "tic.status.{}.program.state".to_owned()),
        }
    }

    pub fn router(&self, name: &str) -> RouterSettings {
        RouterSettings {
            protocol: self
                .get(&["router", name, "protocol"])
                .unwrap_or_else(|| "tcp".to_owned()),
            url: self
                .get(&["router", name, "url"])
                .unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: self.get(&["router", name, "port"]).unwrap_or(5559),
            ping_enabled: self
                .get(&["router", name, "ping-tasks-enabled"])
                .unwrap_or(true),
            ping_interval: self
                .get(&["router", name, "ping-tasks-interval"])
                .unwrap_or(1.0),
        }
    }
}

fn merge(base: Yaml, layer: Yaml) -> Yaml {
    match (base, layer) {
        (Yaml::Mapping(mut base), Yaml::Mapping(layer)) => {
            for (key, value) in layer {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Yaml::Mapping(base)
        }
        (_, layer) => layer,
    }
}

#[derive(Debug, Clone)]
pub struct NatsSettings {
    pub host: String,
    pub port: u16,
    pub alpaca_config_stream: String,
    /// Subject template, `{}` is replaced with the telescope id.
    pub plan_stream: String,
    pub status_stream: String,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub protocol: String,
    pub url: String,
    pub port: u16,
    pub ping_enabled: bool,
    pub ping_interval: f64,
}
