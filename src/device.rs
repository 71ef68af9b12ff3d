use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The accelerator a model runs on.
///
/// `WebGpu` exists for completeness of the target matrix; the native tensor-VM
/// host rejects it since WebGPU is only reachable through a browser runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Metal,
    Vulkan,
    WebGpu,
}

impl DeviceKind {
    /// The accelerator this build targets by default.
    pub fn auto() -> Self {
        #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
        {
            DeviceKind::Metal
        }
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        {
            DeviceKind::Vulkan
        }
        #[cfg(not(any(
            all(target_arch = "aarch64", target_os = "macos"),
            target_os = "linux",
            target_os = "windows"
        )))]
        {
            DeviceKind::Cpu
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub ordinal: i32,
}

impl Device {
    pub fn new(kind: DeviceKind, ordinal: i32) -> Self {
        Self { kind, ordinal }
    }

    pub fn auto() -> Self {
        Self {
            kind: DeviceKind::auto(),
            ordinal: 0,
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::auto()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            DeviceKind::Cpu,
            DeviceKind::Metal,
            DeviceKind::Vulkan,
            DeviceKind::WebGpu,
        ] {
            assert_eq!(DeviceKind::from_str(&kind.to_string()).unwrap(), kind);
        }
        assert_eq!(DeviceKind::Vulkan.to_string(), "vulkan");
    }
}
