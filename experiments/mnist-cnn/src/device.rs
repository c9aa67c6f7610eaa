use std::fmt;

use burn::{backend::Autodiff, tensor::backend::Backend};

#[cfg(not(feature = "tch"))]
use burn::backend::{ndarray::NdArrayDevice, NdArray};
#[cfg(feature = "tch")]
use burn::backend::{libtorch::LibTorchDevice, LibTorch};

#[cfg(not(feature = "tch"))]
pub type TrainingBackend = Autodiff<NdArray<f32>>;
#[cfg(feature = "tch")]
pub type TrainingBackend = Autodiff<LibTorch<f32>>;

pub type TrainingDevice = <TrainingBackend as Backend>::Device;

/// Probe order: CUDA first, then Apple's Metal (MPS), then the CPU.
pub const PRIORITY: [DeviceKind; 3] = [DeviceKind::Cuda, DeviceKind::Mps, DeviceKind::Cpu];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    Cuda,
    Mps,
    Cpu,
}

impl DeviceKind {
    #[cfg(feature = "tch")]
    fn is_available(self) -> bool {
        match self {
            Self::Cuda => tch::Cuda::is_available(),
            Self::Mps => tch::utils::has_mps(),
            Self::Cpu => true,
        }
    }

    #[cfg(not(feature = "tch"))]
    fn is_available(self) -> bool {
        matches!(self, Self::Cpu)
    }

    #[cfg(feature = "tch")]
    fn device(self) -> TrainingDevice {
        match self {
            Self::Cuda => LibTorchDevice::Cuda(0),
            Self::Mps => LibTorchDevice::Mps,
            Self::Cpu => LibTorchDevice::Cpu,
        }
    }

    #[cfg(not(feature = "tch"))]
    fn device(self) -> TrainingDevice {
        NdArrayDevice::Cpu
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cuda => "cuda",
            Self::Mps => "mps",
            Self::Cpu => "cpu",
        })
    }
}

/// First kind in `order` accepted by `probe`, falling back to the CPU.
pub fn first_available(order: &[DeviceKind], probe: impl Fn(DeviceKind) -> bool) -> DeviceKind {
    order
        .iter()
        .copied()
        .find(|&kind| probe(kind))
        .unwrap_or(DeviceKind::Cpu)
}

pub fn select_device() -> (DeviceKind, TrainingDevice) {
    let kind = first_available(&PRIORITY, DeviceKind::is_available);
    tracing::info!(device = %kind, "selected compute device");
    (kind, kind.device())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_priority_available() {
        let only_mps = |kind| matches!(kind, DeviceKind::Mps | DeviceKind::Cpu);
        assert_eq!(first_available(&PRIORITY, only_mps), DeviceKind::Mps);
        assert_eq!(first_available(&PRIORITY, |_| true), DeviceKind::Cuda);
        assert_eq!(first_available(&PRIORITY, |_| false), DeviceKind::Cpu);
    }

    #[cfg(not(feature = "tch"))]
    #[test]
    fn cpu_backend_selects_cpu() {
        let (kind, device) = select_device();
        assert_eq!(kind, DeviceKind::Cpu);
        assert_eq!(device, NdArrayDevice::Cpu);
    }
}
