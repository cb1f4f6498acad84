//! Declarative simulation configuration, loadable from toml/yaml files
//! through the `config` crate.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::services::ServiceConfig;
use crate::sim::{Host, NetworkConfig};
use crate::utils::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    pub platform: Vec<Host>,
    #[serde(default)]
    pub storage: Vec<StorageDef>,
    #[serde(default)]
    pub services: Vec<ServiceDef>,
    #[serde(default)]
    pub workflow: Option<WorkflowDef>,
    #[serde(default = "default_seed")]
    pub seed: String,
}

fn default_seed() -> String {
    "a quiet batch queue".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDef {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    pub capacity: f64,
    pub bandwidth: f64,
}

fn default_mount_point() -> String {
    "/".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceDef {
    Multicore {
        name: String,
        host: String,
        #[serde(default)]
        config: ServiceConfig,
        #[serde(default)]
        default_storage: Option<String>,
    },
    BareMetal {
        name: String,
        hosts: Vec<String>,
        #[serde(default)]
        config: ServiceConfig,
        #[serde(default)]
        default_storage: Option<String>,
    },
    Batch {
        name: String,
        hosts: Vec<String>,
        #[serde(default)]
        config: ServiceConfig,
        #[serde(default)]
        default_storage: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowFormat {
    Dax,
    PegasusJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WmsSchedulerKind {
    #[default]
    Random,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub path: PathBuf,
    pub format: WorkflowFormat,
    /// converts task runtimes (seconds) into simulated flops
    pub reference_flop_rate: f64,
    #[serde(default)]
    pub scheduler: WmsSchedulerKind,
}

/// Load a config file, letting `BATCHSIM_*` environment variables override.
pub fn load(path: impl AsRef<Path>) -> Result<SimConfig> {
    let mut settings = Config::new();
    settings.merge(File::from(path.as_ref().to_path_buf()))?;
    settings.merge(Environment::with_prefix("BATCHSIM").separator("__"))?;
    Ok(settings.try_into()?)
}

pub fn from_str(content: &str, format: config::FileFormat) -> Result<SimConfig> {
    let mut settings = Config::new();
    settings.merge(File::from_str(content, format))?;
    Ok(settings.try_into()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
seed = "stripy zebra"

[network]
latency = 0.0

[[platform]]
name = "head"
cores = 4
flop_rate = 1e9
ram = 16e9

[[platform]]
name = "node1"
cores = 2
flop_rate = 1e9
ram = 16e9

[[storage]]
name = "shared"
host = "head"
capacity = 1e12
bandwidth = 1e9

[[services]]
type = "multicore"
name = "mc"
host = "head"
default_storage = "shared"

[[services]]
type = "batch"
name = "cluster"
hosts = ["node1"]

[services.config]
batch_scheduling_algorithm = "EASY_BF"
"#;

    #[test]
    fn parses_toml() {
        let cfg = from_str(SAMPLE, config::FileFormat::Toml).unwrap();
        assert_eq!(cfg.seed, "stripy zebra");
        assert_eq!(cfg.platform.len(), 2);
        assert_eq!(cfg.storage[0].mount_point, "/");
        assert_eq!(cfg.services.len(), 2);
        match &cfg.services[1] {
            ServiceDef::Batch { name, hosts, config, .. } => {
                assert_eq!(name, "cluster");
                assert_eq!(hosts, &vec!["node1".to_owned()]);
                assert_eq!(
                    config.batch_scheduling_algorithm,
                    crate::services::BatchSchedulingAlgorithm::EasyBf
                );
            }
            other => panic!("unexpected service {:?}", other),
        }
        assert!(cfg.workflow.is_none());
    }
}
