use anyhow::{bail, Context, Result};
use rmig_core::{GatewayStrategy, DEFAULT_JOB_TYPE};
use rmig_interceptors::InterceptorSettings;
use rmig_runtime::RuntimeMigratorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "runtime-migrator.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub migrator: MigratorSection,
    pub mapping: MappingSection,
    pub source: SourceSection,
    pub target: TargetSection,
    pub logging: LoggingSection,
    pub interceptors: Vec<InterceptorSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct MigratorSection {
    pub page_size: usize,
    pub gateway_strategy: GatewayStrategy,
    pub job_type: String,
    pub job_type_validation: bool,
}

impl Default for MigratorSection {
    fn default() -> Self {
        Self {
            page_size: 100,
            gateway_strategy: GatewayStrategy::default(),
            job_type: DEFAULT_JOB_TYPE.to_string(),
            job_type_validation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct MappingSection {
    pub database: PathBuf,
    pub table_prefix: String,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            database: PathBuf::from("runtime-migrator.db"),
            table_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSection {
    pub snapshot: PathBuf,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            snapshot: PathBuf::from("source-snapshot.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetSection {
    pub definitions: PathBuf,
    pub journal: PathBuf,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            definitions: PathBuf::from("target-definitions.json"),
            journal: PathBuf::from("target-journal.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub directory: Option<PathBuf>,
}

impl MigratorConfig {
    /// Missing file means defaults. Relative paths stay relative to the working directory.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.migrator.page_size == 0 {
            bail!("migrator.page-size must be at least 1");
        }
        if self.migrator.job_type.trim().is_empty() {
            bail!("migrator.job-type must not be empty");
        }
        Ok(())
    }

    pub fn runtime(&self) -> RuntimeMigratorConfig {
        RuntimeMigratorConfig {
            page_size: self.migrator.page_size,
            gateway_strategy: self.migrator.gateway_strategy,
            job_type: self.migrator.job_type.trim().to_string(),
            job_type_validation: self.migrator.job_type_validation,
            ..RuntimeMigratorConfig::default()
        }
    }
}
