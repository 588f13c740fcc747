mod adl;
mod amdgpu;

use log::info;

use crate::errors::BackendError;

pub use amdgpu::AmdgpuBackend;

/// One discrete operating point of a device's DVFS table, in the backend's
/// native encoding: the ADL backend stores clocks in 10 kHz units and
/// voltage in mV; the AMDGPU backend does not expose editable levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerformanceLevel {
    pub engine_clock: i32,
    pub memory_clock: i32,
    pub voltage: i32,
}

/// Legal mutation envelope for one device, snapshotted once per invocation.
/// The validator and the apply engine never re-query it.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCaps {
    /// ADL-style: discrete performance levels with driver-reported legal
    /// ranges in physical units (MHz / MHz / V).
    Ranged {
        level_count: i32,
        engine_clock: (f64, f64),
        memory_clock: (f64, f64),
        voltage: (f64, f64),
    },
    /// AMDGPU-style: a single level; clocks may be raised from the base
    /// clock by at most the overdrive limit (20%).
    Envelope { core_clock: u32, memory_clock: u32 },
}

impl DeviceCaps {
    pub fn level_count(&self) -> i32 {
        match self {
            Self::Ranged { level_count, .. } => *level_count,
            Self::Envelope { .. } => 1,
        }
    }
}

/// Telemetry snapshot of one adapter, for the informational display.
/// Fields not reported by a backend stay `None` (or empty) and are omitted
/// from the output.
#[derive(Debug, Clone, Default)]
pub struct AdapterState {
    pub name: String,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
    pub vendor_id: u32,
    pub device_id: Option<u32>,
    /// Current clocks in MHz.
    pub core_clock: f64,
    pub memory_clock: f64,
    /// Current core voltage in V.
    pub voltage: Option<f64>,
    /// Overdrive percentages (AMDGPU).
    pub core_overdrive: Option<u32>,
    pub memory_overdrive: Option<u32>,
    pub gpu_load: Option<u32>,
    /// Degrees Celsius.
    pub temperature: f64,
    pub critical_temperature: Option<f64>,
    /// Percent of the fan's controllable range.
    pub fan_speed: f64,
    /// Whether the fan is under automatic (driver) control.
    pub fan_automatic: Option<bool>,
    pub bus_speed: Option<u32>,
    pub bus_lanes: Option<u32>,
    /// DPM clock tables in MHz (AMDGPU).
    pub core_clocks: Vec<u32>,
    pub memory_clocks: Vec<u32>,
}

/// Capability interface over one hardware backend family. Implemented once
/// per family and selected once at startup; the parse/validate/merge core
/// never branches on the concrete backend outside of [`DeviceCaps`].
pub trait GpuBackend {
    fn device_count(&self) -> usize;

    fn capabilities(&self, device: usize) -> Result<DeviceCaps, BackendError>;

    /// Current (or factory-default) performance levels of a device.
    fn read_performance_levels(
        &self,
        device: usize,
        defaults: bool,
    ) -> Result<Vec<PerformanceLevel>, BackendError>;

    /// Replace the whole level table of a device in one write.
    fn write_performance_levels(
        &self,
        device: usize,
        levels: &[PerformanceLevel],
    ) -> Result<(), BackendError>;

    fn set_fan_speed(&self, device: usize, percent: f64) -> Result<(), BackendError>;

    fn set_fan_speed_to_default(&self, device: usize) -> Result<(), BackendError>;

    fn set_core_overdrive(&self, device: usize, percent: u32) -> Result<(), BackendError>;

    fn set_memory_overdrive(&self, device: usize, percent: u32) -> Result<(), BackendError>;

    fn adapter_state(&self, device: usize) -> Result<AdapterState, BackendError>;
}

/// Pick the backend for this machine: the ADL (Catalyst/Crimson) runtime if
/// its library can be loaded, the AMDGPU sysfs interface otherwise.
pub fn detect() -> Result<Box<dyn GpuBackend>, BackendError> {
    match adl::AdlBackend::open() {
        Ok(backend) => {
            info!("using the ADL (Catalyst) backend");
            Ok(Box::new(backend))
        }
        Err(BackendError::AdlUnavailable) => {
            info!("ADL runtime not found, using the AMDGPU sysfs backend");
            Ok(Box::new(AmdgpuBackend::new()?))
        }
        Err(err) => Err(err),
    }
}
