//! vmgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::types::{SiteType, Technology};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmGridConfig {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Upper bound of appliances sharing one VM.
    #[serde(default = "default_max_appliances_per_vm")]
    pub max_appliances_per_vm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Length of one routine billing period in seconds.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Added to `prepaid_until` when a deployment is created.
    #[serde(default)]
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Timeout applied to every compute-site, monitoring and DNAT call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_billing_interval_secs")]
    pub billing_interval_secs: u64,
    #[serde(default = "default_vm_monitoring_interval_secs")]
    pub vm_monitoring_interval_secs: u64,
    #[serde(default = "default_template_monitoring_interval_secs")]
    pub template_monitoring_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub site_type: SiteType,
    #[serde(default)]
    pub technology: Technology,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("optimizer.max_appliances_per_vm must be at least 1")]
    ZeroMaxAppliances,
    #[error("billing.period_secs must be at least 1")]
    ZeroBillingPeriod,
    #[error("provider.timeout_secs must be at least 1")]
    ZeroProviderTimeout,
    #[error("schedule.{0} must be at least 1")]
    ZeroInterval(&'static str),
    #[error("duplicate compute site id: {0}")]
    DuplicateSite(String),
}

fn default_max_appliances_per_vm() -> u32 {
    5
}

fn default_period_secs() -> u64 {
    3600
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_billing_interval_secs() -> u64 {
    5
}

fn default_vm_monitoring_interval_secs() -> u64 {
    30
}

fn default_template_monitoring_interval_secs() -> u64 {
    60
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_appliances_per_vm: default_max_appliances_per_vm(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            grace_secs: 0,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            billing_interval_secs: default_billing_interval_secs(),
            vm_monitoring_interval_secs: default_vm_monitoring_interval_secs(),
            template_monitoring_interval_secs: default_template_monitoring_interval_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl VmGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: VmGridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.optimizer.max_appliances_per_vm == 0 {
            return Err(ConfigError::ZeroMaxAppliances);
        }
        if self.billing.period_secs == 0 {
            return Err(ConfigError::ZeroBillingPeriod);
        }
        if self.provider.timeout_secs == 0 {
            return Err(ConfigError::ZeroProviderTimeout);
        }
        let intervals = [
            ("billing_interval_secs", self.schedule.billing_interval_secs),
            ("vm_monitoring_interval_secs", self.schedule.vm_monitoring_interval_secs),
            (
                "template_monitoring_interval_secs",
                self.schedule.template_monitoring_interval_secs,
            ),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.id.as_str()) {
                return Err(ConfigError::DuplicateSite(site.id.clone()));
            }
        }
        Ok(())
    }
}
