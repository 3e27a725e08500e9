use std::env;
use std::str::FromStr;

use tessera_core::{Error, Result};

// EngineConfig — How many lanes, of which kind, and whether to profile
//
// Built with chained setters on top of `Default`, or from the environment:
//
//   let config = EngineConfig::default().cpu_workers(4).gpus(2);
//   let config = EngineConfig::from_env()?;   // TESSERA_* overrides
//
// Environment variables:
//   TESSERA_ENGINE_TYPE     "threaded" | "naive"
//   TESSERA_CPU_WORKERS     CPU pool lanes
//   TESSERA_NUM_GPUS        simulated GPU devices
//   TESSERA_GPU_COPY_LANES  copy lanes per GPU
//   TESSERA_PROFILING       "1"/"true" to record per-op timings

/// Which engine implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Operations run on per-device worker lanes as soon as their
    /// dependencies are satisfied.
    #[default]
    Threaded,
    /// Every operation runs to completion on the submitting thread.
    /// Deterministic; meant for debugging kernels.
    Naive,
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" | "threadedengine" => Ok(EngineKind::Threaded),
            "naive" | "naiveengine" => Ok(EngineKind::Naive),
            other => Err(Error::Config(format!("unknown engine type '{other}'"))),
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Threaded or naive execution.
    pub kind: EngineKind,
    /// Number of lanes in the CPU worker pool.
    pub cpu_workers: usize,
    /// Number of GPU devices (gpu(0) .. gpu(n-1)).
    pub gpus: usize,
    /// Compute lanes per GPU.
    pub gpu_compute_lanes: usize,
    /// Copy lanes per GPU.
    pub gpu_copy_lanes: usize,
    /// Record wall time of every kernel.
    pub profiling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpu_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            kind: EngineKind::Threaded,
            cpu_workers,
            gpus: 0,
            gpu_compute_lanes: 1,
            gpu_copy_lanes: 1,
            profiling: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `TESSERA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(kind) = env_value::<EngineKind>("TESSERA_ENGINE_TYPE")? {
            config.kind = kind;
        }
        if let Some(n) = env_value::<usize>("TESSERA_CPU_WORKERS")? {
            config.cpu_workers = n;
        }
        if let Some(n) = env_value::<usize>("TESSERA_NUM_GPUS")? {
            config.gpus = n;
        }
        if let Some(n) = env_value::<usize>("TESSERA_GPU_COPY_LANES")? {
            config.gpu_copy_lanes = n;
        }
        if let Ok(v) = env::var("TESSERA_PROFILING") {
            config.profiling = parse_flag(&v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn kind(mut self, kind: EngineKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn cpu_workers(mut self, n: usize) -> Self {
        self.cpu_workers = n;
        self
    }

    pub fn gpus(mut self, n: usize) -> Self {
        self.gpus = n;
        self
    }

    pub fn gpu_compute_lanes(mut self, n: usize) -> Self {
        self.gpu_compute_lanes = n;
        self
    }

    pub fn gpu_copy_lanes(mut self, n: usize) -> Self {
        self.gpu_copy_lanes = n;
        self
    }

    pub fn profiling(mut self, on: bool) -> Self {
        self.profiling = on;
        self
    }

    /// Reject configurations that would leave a device without lanes.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_workers == 0 {
            return Err(Error::Config("cpu_workers must be at least 1".into()));
        }
        if self.gpus > 0 && (self.gpu_compute_lanes == 0 || self.gpu_copy_lanes == 0) {
            return Err(Error::Config(
                "every GPU needs at least one compute and one copy lane".into(),
            ));
        }
        Ok(())
    }

    /// Total number of lanes a threaded engine spawns.
    pub fn lane_count(&self) -> usize {
        self.cpu_workers + self.gpus * (self.gpu_compute_lanes + self.gpu_copy_lanes)
    }
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!(
            "TESSERA_PROFILING: cannot parse '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.kind, EngineKind::Threaded);
        assert!(config.cpu_workers >= 1);
        assert_eq!(config.gpus, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_lane_count() {
        let config = EngineConfig::default()
            .cpu_workers(3)
            .gpus(2)
            .gpu_compute_lanes(2)
            .gpu_copy_lanes(1);
        assert_eq!(config.lane_count(), 3 + 2 * 3);
    }

    #[test]
    fn test_validate_rejects_empty_pools() {
        assert!(EngineConfig::default().cpu_workers(0).validate().is_err());
        assert!(EngineConfig::default()
            .gpus(1)
            .gpu_copy_lanes(0)
            .validate()
            .is_err());
        // No GPUs: GPU lane counts are irrelevant
        assert!(EngineConfig::default()
            .gpu_copy_lanes(0)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_parse_engine_kind() {
        assert_eq!("Naive".parse::<EngineKind>().unwrap(), EngineKind::Naive);
        assert_eq!(
            "ThreadedEngine".parse::<EngineKind>().unwrap(),
            EngineKind::Threaded
        );
        assert!("fast".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1").unwrap());
        assert!(parse_flag("True").unwrap());
        assert!(!parse_flag("off").unwrap());
        assert!(parse_flag("maybe").is_err());
    }
}
