use crate::core::model::config::MAX_POSITION_EMBEDDINGS;
use crate::core::{Gpt2Error, Result};
use candle_core::Device;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Where tensors are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpec {
    /// CUDA if available, then Metal, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceSpec {
    pub fn device(&self) -> Result<Device> {
        let device = match self {
            DeviceSpec::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0)?
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    Device::Cpu
                }
            }
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(*ordinal)?,
            DeviceSpec::Metal => Device::new_metal(0)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceSpec {
    type Err = Gpt2Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(DeviceSpec::Auto),
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" => Ok(DeviceSpec::Cuda(0)),
            "metal" => Ok(DeviceSpec::Metal),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(DeviceSpec::Cuda)
                .ok_or_else(|| Gpt2Error::InvalidConfig(format!("unknown device {:?}", s))),
        }
    }
}

/// Settings read from `GPT2_*` environment variables.
pub struct EnvConfig {
    pub models_dir: PathBuf,
    pub size: String,
    pub cache_limit: usize,
    pub device: DeviceSpec,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_limit = match lookup("GPT2_CACHE_LIMIT") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                Gpt2Error::InvalidConfig(format!("GPT2_CACHE_LIMIT must be a positive integer, got {:?}", raw))
            })?,
            None => MAX_POSITION_EMBEDDINGS,
        };

        Ok(Self {
            models_dir: expand_home(
                lookup("GPT2_MODELS").unwrap_or_else(|| "~/.gpt2/models".to_string()),
            ),
            size: lookup("GPT2_SIZE").unwrap_or_else(|| "117M".to_string()),
            cache_limit,
            device: lookup("GPT2_DEVICE").as_deref().unwrap_or("auto").parse()?,
        })
    }
}

fn expand_home(path: String) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
