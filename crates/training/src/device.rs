use burn::backend::Autodiff;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type TrainAutodiff = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "ndarray")]
    NdArray,
    Wgpu,
}

impl BackendKind {
    pub fn compiled() -> Self {
        if cfg!(feature = "backend-wgpu") {
            BackendKind::Wgpu
        } else {
            BackendKind::NdArray
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::NdArray => "ndarray (cpu)",
            BackendKind::Wgpu => "wgpu",
        }
    }
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
}

/// Host memory as seen by the training process. The NdArray backend allocates here too.
pub fn memory_report() -> MemoryReport {
    let mut sys = System::new();
    sys.refresh_memory();
    MemoryReport {
        total_mb: sys.total_memory() / 1024 / 1024,
        available_mb: sys.available_memory() / 1024 / 1024,
        used_mb: sys.used_memory() / 1024 / 1024,
    }
}

pub fn log_memory_report() -> MemoryReport {
    let report = memory_report();
    tracing::info!(
        backend = BackendKind::compiled().as_str(),
        total_mb = report.total_mb,
        available_mb = report.available_mb,
        used_mb = report.used_mb,
        "device memory"
    );
    report
}
