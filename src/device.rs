//! # Device Detection and Selection
//!
//! Resolves device and compute-type preferences to concrete choices for model
//! inference. Accelerator probing is cached for the process lifetime.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Cached accelerator probe results
static CUDA_AVAILABLE: OnceLock<bool> = OnceLock::new();
static METAL_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Device preference supplied by configuration or per-request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// CUDA GPU (falls back to CPU if not available)
    Cuda,
    /// Metal GPU (falls back to CPU if not available)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Resolve the preference to a concrete device kind.
    ///
    /// `Auto` picks an accelerator when one is available, otherwise CPU.
    /// Explicit accelerator preferences degrade to CPU when the hardware is
    /// missing rather than failing the load.
    pub fn resolve(self) -> DeviceKind {
        match self {
            DevicePreference::Auto => {
                if cuda_available() {
                    DeviceKind::Cuda
                } else if metal_available() {
                    DeviceKind::Metal
                } else {
                    DeviceKind::Cpu
                }
            }
            DevicePreference::Cpu => DeviceKind::Cpu,
            DevicePreference::Cuda => {
                if cuda_available() {
                    DeviceKind::Cuda
                } else {
                    info!("CUDA requested but not available, using CPU");
                    DeviceKind::Cpu
                }
            }
            DevicePreference::Metal => {
                if metal_available() {
                    DeviceKind::Metal
                } else {
                    info!("Metal requested but not available, using CPU");
                    DeviceKind::Cpu
                }
            }
        }
    }
}

/// Concrete device a model is resident on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    pub fn is_accelerator(self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Metal => "metal",
        }
    }

    /// Instantiate the candle device for inference.
    pub fn to_candle(self) -> anyhow::Result<Device> {
        match self {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda => Ok(Device::new_cuda(0)?),
            DeviceKind::Metal => Ok(Device::new_metal(0)?),
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compute-type (precision) preference for model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputePreference {
    #[default]
    Auto,
    Int8,
    Float16,
    Float32,
}

impl std::str::FromStr for ComputePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ComputePreference::Auto),
            "int8" => Ok(ComputePreference::Int8),
            "float16" | "fp16" | "half" => Ok(ComputePreference::Float16),
            "float32" | "fp32" => Ok(ComputePreference::Float32),
            _ => Err(format!("Unknown compute type: {}", s)),
        }
    }
}

impl ComputePreference {
    /// Resolve `Auto` against the chosen device: fast half precision on an
    /// accelerator, compact integer math on CPU.
    pub fn resolve(self, device: DeviceKind) -> ComputeType {
        match self {
            ComputePreference::Auto => {
                if device.is_accelerator() {
                    ComputeType::Float16
                } else {
                    ComputeType::Int8
                }
            }
            ComputePreference::Int8 => ComputeType::Int8,
            ComputePreference::Float16 => ComputeType::Float16,
            ComputePreference::Float32 => ComputeType::Float32,
        }
    }
}

/// Resolved compute type a resident model was materialized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    Int8,
    Float16,
    Float32,
}

impl ComputeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ComputeType::Int8 => "int8",
            ComputeType::Float16 => "float16",
            ComputeType::Float32 => "float32",
        }
    }
}

impl std::fmt::Display for ComputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Check CUDA availability (cached).
pub fn cuda_available() -> bool {
    *CUDA_AVAILABLE.get_or_init(|| match Device::new_cuda(0) {
        Ok(_) => {
            debug!("CUDA device 0 available");
            true
        }
        Err(e) => {
            debug!("CUDA not available: {}", e);
            false
        }
    })
}

/// Check Metal availability (cached).
pub fn metal_available() -> bool {
    *METAL_AVAILABLE.get_or_init(|| match Device::new_metal(0) {
        Ok(_) => {
            debug!("Metal device 0 available");
            true
        }
        Err(e) => {
            debug!("Metal not available: {}", e);
            false
        }
    })
}

/// Check if any accelerator is available.
pub fn accelerator_available() -> bool {
    cuda_available() || metal_available()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("cpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("CUDA".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("invalid".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_compute_preference_parsing() {
        assert_eq!("auto".parse::<ComputePreference>().unwrap(), ComputePreference::Auto);
        assert_eq!("fp16".parse::<ComputePreference>().unwrap(), ComputePreference::Float16);
        assert_eq!("int8".parse::<ComputePreference>().unwrap(), ComputePreference::Int8);
        assert!("int4".parse::<ComputePreference>().is_err());
    }

    #[test]
    fn test_auto_compute_resolution() {
        assert_eq!(
            ComputePreference::Auto.resolve(DeviceKind::Cpu),
            ComputeType::Int8
        );
        assert_eq!(
            ComputePreference::Auto.resolve(DeviceKind::Cuda),
            ComputeType::Float16
        );
        assert_eq!(
            ComputePreference::Auto.resolve(DeviceKind::Metal),
            ComputeType::Float16
        );
    }

    #[test]
    fn test_cpu_preference_always_resolves_to_cpu() {
        assert_eq!(DevicePreference::Cpu.resolve(), DeviceKind::Cpu);
    }
}
