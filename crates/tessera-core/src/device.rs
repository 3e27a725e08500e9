use std::fmt;

// Device — Where an array's memory lives and where its kernels run
//
// A Device is a (kind, index) pair, e.g. cpu(0) or gpu(1). The engine keeps
// a set of execution lanes per device; an operation's target device decides
// which lanes may run it.
//
// GPU devices are simulated: their storage is host memory and their kernels
// are the CPU reference kernels, but they are scheduled on their own compute
// and copy lanes exactly as a real stream-based backend would be.

/// The kind of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// A compute device: kind plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    kind: DeviceKind,
    index: usize,
}

impl Device {
    /// The host CPU. There is only ever one CPU device.
    pub const fn cpu() -> Self {
        Device {
            kind: DeviceKind::Cpu,
            index: 0,
        }
    }

    /// The `index`-th GPU.
    pub const fn gpu(index: usize) -> Self {
        Device {
            kind: DeviceKind::Gpu,
            index,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu({})", self.index),
            DeviceKind::Gpu => write!(f, "gpu({})", self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Device::cpu().to_string(), "cpu(0)");
        assert_eq!(Device::gpu(2).to_string(), "gpu(2)");
    }

    #[test]
    fn test_identity() {
        assert!(Device::cpu().is_cpu());
        assert!(!Device::gpu(0).is_cpu());
        assert_ne!(Device::gpu(0), Device::gpu(1));
        assert_eq!(Device::default(), Device::cpu());
    }
}
