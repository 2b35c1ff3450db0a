//! Run configuration
//!
//! Collects the knobs that pick a backend, dispatch strategy and stencil
//! variant. Values come from [`RunConfig::default`], the environment
//! ([`RunConfig::from_env`]) and finally command-line flags, in that order.

use crate::error::HeatError;
use crate::solver::{DispatchStrategy, StencilVariant};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable selecting the backend (`auto|cpu|gpu`)
pub const ENV_BACKEND: &str = "HEAT_SIM_BACKEND";
/// Environment variable selecting a GPU adapter by enumeration index
pub const ENV_ADAPTER: &str = "HEAT_SIM_ADAPTER";
/// Environment variable naming a directory that holds `heat_step.wgsl`
pub const ENV_KERNEL_DIR: &str = "HEAT_SIM_KERNEL_DIR";

/// Which compute backend to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    /// GPU when available and large enough, else CPU
    #[default]
    Auto,
    /// Always the rayon CPU backend
    Cpu,
    /// GPU or fail
    Gpu,
}

impl BackendPreference {
    /// Stable lowercase name, matches the CLI spelling
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

impl std::fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => Err(format!("unknown backend '{other}' (auto|cpu|gpu)")),
        }
    }
}

/// Everything needed to set up a stepping run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Backend selection policy
    pub backend: BackendPreference,
    /// How state moves between host and backend
    pub strategy: DispatchStrategy,
    /// Neighbour test used by the kernel
    pub variant: StencilVariant,
    /// GPU adapter index, `None` lets wgpu choose
    pub adapter_index: Option<usize>,
    /// Directory overriding the embedded kernel source
    pub kernel_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Defaults overridden by `HEAT_SIM_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Configuration`] if a variable is set to a value
    /// that does not parse.
    pub fn from_env() -> Result<Self, HeatError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Configuration`] on unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HeatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BACKEND) {
            config.backend = value
                .trim()
                .parse()
                .map_err(|e| HeatError::Configuration(format!("{ENV_BACKEND}: {e}")))?;
        }
        if let Some(value) = lookup(ENV_ADAPTER) {
            let index = value.trim().parse::<usize>().map_err(|e| {
                HeatError::Configuration(format!("{ENV_ADAPTER}: '{value}' is not an index: {e}"))
            })?;
            config.adapter_index = Some(index);
        }
        if let Some(value) = lookup(ENV_KERNEL_DIR).filter(|v| !v.is_empty()) {
            config.kernel_dir = Some(PathBuf::from(value));
        }

        Ok(config)
    }
}
