use candle_core::Device;
use tracing::info;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// A parsed device request such as `cpu`, `cuda`, `cuda:1` or `metal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn parse(s: &str) -> CoreResult<Self> {
        let lower = s.trim().to_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((k, n)) => {
                let n = n.parse::<usize>().map_err(|_| {
                    CoreError::config("device", format!("invalid device ordinal in '{s}'"))
                })?;
                (k.to_string(), n)
            }
            None => (lower.clone(), 0),
        };
        match kind.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            _ => Err(CoreError::config(
                "device",
                format!("unknown device '{s}'. Valid values: cpu, cuda[:N], metal[:N]"),
            )),
        }
    }
}

/// Resolve a device string to a candle [`Device`].
///
/// GPU requests fall back to CPU with a warning when the binary was built
/// without the matching feature or the device cannot be opened.
#[allow(unused_variables)]
pub fn select_device(spec: &str) -> CoreResult<Device> {
    match DeviceSpec::parse(spec)? {
        DeviceSpec::Cpu => {}
        DeviceSpec::Cuda(ordinal) => {
            #[cfg(feature = "cuda")]
            match Device::new_cuda(ordinal) {
                Ok(dev) => {
                    info!(ordinal, "Using CUDA device");
                    return Ok(dev);
                }
                Err(e) => warn!(error = %e, "CUDA unavailable, falling back to CPU"),
            }
            #[cfg(not(feature = "cuda"))]
            warn!("CUDA requested but distilkit was built without the `cuda` feature");
        }
        DeviceSpec::Metal(ordinal) => {
            #[cfg(feature = "metal")]
            match Device::new_metal(ordinal) {
                Ok(dev) => {
                    info!(ordinal, "Using Metal device");
                    return Ok(dev);
                }
                Err(e) => warn!(error = %e, "Metal unavailable, falling back to CPU"),
            }
            #[cfg(not(feature = "metal"))]
            warn!("Metal requested but distilkit was built without the `metal` feature");
        }
    }

    info!("Using CPU device");
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_specs() {
        assert_eq!(DeviceSpec::parse("cpu").unwrap(), DeviceSpec::Cpu);
        assert_eq!(DeviceSpec::parse("CUDA").unwrap(), DeviceSpec::Cuda(0));
        assert_eq!(DeviceSpec::parse("cuda:2").unwrap(), DeviceSpec::Cuda(2));
        assert_eq!(DeviceSpec::parse("metal").unwrap(), DeviceSpec::Metal(0));
    }

    #[test]
    fn parse_rejects_unknown_device() {
        assert!(DeviceSpec::parse("tpu").is_err());
        assert!(DeviceSpec::parse("cuda:x").is_err());
    }

    #[test]
    fn cpu_request_returns_cpu() {
        let device = select_device("cpu").unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn gpu_request_without_feature_falls_back() {
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            let device = select_device("cuda").unwrap();
            assert!(matches!(device, Device::Cpu));
        }
    }
}
