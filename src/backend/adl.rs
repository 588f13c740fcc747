//! ADL (AMD Display Library) backend for the proprietary Catalyst/Crimson
//! driver, loaded at runtime so the binary also works on machines without
//! the library installed.

use std::mem;
use std::os::raw::{c_char, c_int, c_void};

use libloading::{Library, Symbol};
use log::debug;

use super::{AdapterState, DeviceCaps, GpuBackend, PerformanceLevel};
use crate::errors::BackendError;

const ADL_LIBRARY: &str = "libatiadlxx.so";
const ADL_LIBRARY_FALLBACK: &str = "libatiadlcx.so";

const ADL_OK: c_int = 0;
/// `iSpeedType` selecting percent of maximum in ADLFanSpeedValue.
const ADL_DL_FANCTRL_SPEED_TYPE_PERCENT: c_int = 1;

// ---------------------------------------------------------------------------
// ADL ABI
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
struct AdlAdapterInfo {
    size: c_int,
    adapter_index: c_int,
    udid: [c_char; 256],
    bus_number: c_int,
    device_number: c_int,
    function_number: c_int,
    vendor_id: c_int,
    adapter_name: [c_char; 256],
    display_name: [c_char; 256],
    present: c_int,
    // Linux-only tail of the structure.
    xscreen_num: c_int,
    drv_index: c_int,
    xscreen_config_name: [c_char; 256],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AdlPmActivity {
    size: c_int,
    engine_clock: c_int,
    memory_clock: c_int,
    vddc: c_int,
    activity_percent: c_int,
    current_performance_level: c_int,
    current_bus_speed: c_int,
    current_bus_lanes: c_int,
    maximum_bus_lanes: c_int,
    reserved: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AdlTemperature {
    size: c_int,
    /// Millidegrees Celsius.
    temperature: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AdlFanSpeedValue {
    size: c_int,
    speed_type: c_int,
    fan_speed: c_int,
    flags: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AdlOdParameterRange {
    min: c_int,
    max: c_int,
    step: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AdlOdParameters {
    size: c_int,
    number_of_performance_levels: c_int,
    activity_reporting_supported: c_int,
    discrete_performance_levels: c_int,
    reserved: c_int,
    engine_clock: AdlOdParameterRange,
    memory_clock: AdlOdParameterRange,
    vddc: AdlOdParameterRange,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AdlOdPerformanceLevel {
    engine_clock: c_int,
    memory_clock: c_int,
    vddc: c_int,
}

/// Header of the variable-length ADLODPerformanceLevels structure; the
/// level array follows it in memory.
#[repr(C)]
struct AdlOdPerformanceLevelsHeader {
    size: c_int,
    reserved: c_int,
}

type MainControlCreate =
    unsafe extern "C" fn(extern "C" fn(c_int) -> *mut c_void, c_int) -> c_int;
type MainControlDestroy = unsafe extern "C" fn() -> c_int;
type NumberOfAdaptersGet = unsafe extern "C" fn(*mut c_int) -> c_int;
type AdapterActiveGet = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type AdapterInfoGet = unsafe extern "C" fn(*mut AdlAdapterInfo, c_int) -> c_int;
type CurrentActivityGet = unsafe extern "C" fn(c_int, *mut AdlPmActivity) -> c_int;
type TemperatureGet = unsafe extern "C" fn(c_int, c_int, *mut AdlTemperature) -> c_int;
type FanSpeedGet = unsafe extern "C" fn(c_int, c_int, *mut AdlFanSpeedValue) -> c_int;
type FanSpeedSet = unsafe extern "C" fn(c_int, c_int, *mut AdlFanSpeedValue) -> c_int;
type FanSpeedToDefaultSet = unsafe extern "C" fn(c_int, c_int) -> c_int;
type OdParametersGet = unsafe extern "C" fn(c_int, *mut AdlOdParameters) -> c_int;
type OdPerformanceLevelsGet = unsafe extern "C" fn(c_int, c_int, *mut c_void) -> c_int;
type OdPerformanceLevelsSet = unsafe extern "C" fn(c_int, *mut c_void) -> c_int;

/// Allocation callback handed to ADL_Main_Control_Create; the library frees
/// these buffers itself.
extern "C" fn adl_malloc(size: c_int) -> *mut c_void {
    unsafe { libc::malloc(size as usize) }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// One active adapter, with the fields of its AdapterInfo record we report.
struct AdlAdapter {
    adl_index: c_int,
    name: String,
    bus: u32,
    device: u32,
    function: u32,
    vendor_id: u32,
}

pub struct AdlBackend {
    library: Library,
    adapters: Vec<AdlAdapter>,
}

impl AdlBackend {
    /// Load the ADL runtime and enumerate active adapters. Returns
    /// [`BackendError::AdlUnavailable`] when the library is not installed,
    /// which callers treat as "fall back to sysfs".
    pub fn open() -> Result<Self, BackendError> {
        let library = unsafe {
            Library::new(ADL_LIBRARY)
                .or_else(|_| Library::new(ADL_LIBRARY_FALLBACK))
                .map_err(|_| BackendError::AdlUnavailable)?
        };

        let mut backend = Self {
            library,
            adapters: Vec::new(),
        };

        let create: Symbol<MainControlCreate> = backend.symbol("ADL_Main_Control_Create")?;
        let status = unsafe { create(adl_malloc, 1) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Main_Control_Create", status));
        }

        backend.adapters = backend.enumerate_adapters()?;
        debug!("ADL reports {} active adapter(s)", backend.adapters.len());
        Ok(backend)
    }

    fn symbol<T>(&self, name: &'static str) -> Result<Symbol<'_, T>, BackendError> {
        unsafe {
            self.library
                .get(name.as_bytes())
                .map_err(|_| BackendError::Parse(format!("missing ADL entry point {name}")))
        }
    }

    /// All adapters the driver marks active, in ADL enumeration order.
    fn enumerate_adapters(&self) -> Result<Vec<AdlAdapter>, BackendError> {
        let count_get: Symbol<NumberOfAdaptersGet> =
            self.symbol("ADL_Adapter_NumberOfAdapters_Get")?;
        let active_get: Symbol<AdapterActiveGet> = self.symbol("ADL_Adapter_Active_Get")?;
        let info_get: Symbol<AdapterInfoGet> = self.symbol("ADL_Adapter_AdapterInfo_Get")?;

        let mut count: c_int = 0;
        let status = unsafe { count_get(&mut count) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Adapter_NumberOfAdapters_Get", status));
        }
        if count <= 0 {
            return Ok(Vec::new());
        }

        let mut infos = vec![unsafe { mem::zeroed::<AdlAdapterInfo>() }; count as usize];
        let byte_len = (count as usize * mem::size_of::<AdlAdapterInfo>()) as c_int;
        let status = unsafe { info_get(infos.as_mut_ptr(), byte_len) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Adapter_AdapterInfo_Get", status));
        }

        let mut adapters = Vec::new();
        for (index, info) in infos.iter().enumerate() {
            let mut active: c_int = 0;
            let status = unsafe { active_get(index as c_int, &mut active) };
            if status != ADL_OK {
                return Err(BackendError::Adl("ADL_Adapter_Active_Get", status));
            }
            if active == 0 {
                continue;
            }
            adapters.push(AdlAdapter {
                adl_index: index as c_int,
                name: c_string(&info.adapter_name),
                bus: info.bus_number.max(0) as u32,
                device: info.device_number.max(0) as u32,
                function: info.function_number.max(0) as u32,
                vendor_id: info.vendor_id.max(0) as u32,
            });
        }

        Ok(adapters)
    }

    fn adl_index(&self, device: usize) -> c_int {
        self.adapters[device].adl_index
    }

    fn od_parameters(&self, device: usize) -> Result<AdlOdParameters, BackendError> {
        let get: Symbol<OdParametersGet> = self.symbol("ADL_Overdrive5_ODParameters_Get")?;
        let mut params = AdlOdParameters {
            size: mem::size_of::<AdlOdParameters>() as c_int,
            ..Default::default()
        };
        let status = unsafe { get(self.adl_index(device), &mut params) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Overdrive5_ODParameters_Get", status));
        }
        Ok(params)
    }

    fn activity(&self, device: usize) -> Result<AdlPmActivity, BackendError> {
        let get: Symbol<CurrentActivityGet> =
            self.symbol("ADL_Overdrive5_CurrentActivity_Get")?;
        let mut activity = AdlPmActivity {
            size: mem::size_of::<AdlPmActivity>() as c_int,
            ..Default::default()
        };
        let status = unsafe { get(self.adl_index(device), &mut activity) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Overdrive5_CurrentActivity_Get", status));
        }
        Ok(activity)
    }
}

impl Drop for AdlBackend {
    fn drop(&mut self) {
        if let Ok(destroy) = self.symbol::<MainControlDestroy>("ADL_Main_Control_Destroy") {
            unsafe { destroy() };
        }
    }
}

impl GpuBackend for AdlBackend {
    fn device_count(&self) -> usize {
        self.adapters.len()
    }

    fn capabilities(&self, device: usize) -> Result<DeviceCaps, BackendError> {
        let params = self.od_parameters(device)?;
        Ok(DeviceCaps::Ranged {
            level_count: params.number_of_performance_levels,
            engine_clock: (
                f64::from(params.engine_clock.min) / 100.0,
                f64::from(params.engine_clock.max) / 100.0,
            ),
            memory_clock: (
                f64::from(params.memory_clock.min) / 100.0,
                f64::from(params.memory_clock.max) / 100.0,
            ),
            voltage: (
                f64::from(params.vddc.min) / 1000.0,
                f64::from(params.vddc.max) / 1000.0,
            ),
        })
    }

    fn read_performance_levels(
        &self,
        device: usize,
        defaults: bool,
    ) -> Result<Vec<PerformanceLevel>, BackendError> {
        let level_count = self.od_parameters(device)?.number_of_performance_levels as usize;
        let get: Symbol<OdPerformanceLevelsGet> =
            self.symbol("ADL_Overdrive5_ODPerformanceLevels_Get")?;

        let mut buffer = levels_buffer(level_count);
        let status = unsafe {
            get(
                self.adl_index(device),
                defaults as c_int,
                buffer.as_mut_ptr().cast(),
            )
        };
        if status != ADL_OK {
            return Err(BackendError::Adl(
                "ADL_Overdrive5_ODPerformanceLevels_Get",
                status,
            ));
        }

        let levels = unsafe {
            std::slice::from_raw_parts(
                buffer
                    .as_ptr()
                    .add(mem::size_of::<AdlOdPerformanceLevelsHeader>())
                    .cast::<AdlOdPerformanceLevel>(),
                level_count,
            )
        };
        Ok(levels
            .iter()
            .map(|level| PerformanceLevel {
                engine_clock: level.engine_clock,
                memory_clock: level.memory_clock,
                voltage: level.vddc,
            })
            .collect())
    }

    fn write_performance_levels(
        &self,
        device: usize,
        levels: &[PerformanceLevel],
    ) -> Result<(), BackendError> {
        let set: Symbol<OdPerformanceLevelsSet> =
            self.symbol("ADL_Overdrive5_ODPerformanceLevels_Set")?;

        let mut buffer = levels_buffer(levels.len());
        let records = unsafe {
            std::slice::from_raw_parts_mut(
                buffer
                    .as_mut_ptr()
                    .add(mem::size_of::<AdlOdPerformanceLevelsHeader>())
                    .cast::<AdlOdPerformanceLevel>(),
                levels.len(),
            )
        };
        for (record, level) in records.iter_mut().zip(levels) {
            record.engine_clock = level.engine_clock;
            record.memory_clock = level.memory_clock;
            record.vddc = level.voltage;
        }

        let status = unsafe { set(self.adl_index(device), buffer.as_mut_ptr().cast()) };
        if status != ADL_OK {
            return Err(BackendError::Adl(
                "ADL_Overdrive5_ODPerformanceLevels_Set",
                status,
            ));
        }
        Ok(())
    }

    fn set_fan_speed(&self, device: usize, percent: f64) -> Result<(), BackendError> {
        let set: Symbol<FanSpeedSet> = self.symbol("ADL_Overdrive5_FanSpeed_Set")?;
        let mut value = AdlFanSpeedValue {
            size: mem::size_of::<AdlFanSpeedValue>() as c_int,
            speed_type: ADL_DL_FANCTRL_SPEED_TYPE_PERCENT,
            fan_speed: percent.round() as c_int,
            flags: 0,
        };
        let status = unsafe { set(self.adl_index(device), 0, &mut value) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Overdrive5_FanSpeed_Set", status));
        }
        Ok(())
    }

    fn set_fan_speed_to_default(&self, device: usize) -> Result<(), BackendError> {
        let set: Symbol<FanSpeedToDefaultSet> =
            self.symbol("ADL_Overdrive5_FanSpeedToDefault_Set")?;
        let status = unsafe { set(self.adl_index(device), 0) };
        if status != ADL_OK {
            return Err(BackendError::Adl(
                "ADL_Overdrive5_FanSpeedToDefault_Set",
                status,
            ));
        }
        Ok(())
    }

    fn set_core_overdrive(&self, _device: usize, _percent: u32) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(
            "overdrive percentages are available only with the AMDGPU driver",
        ))
    }

    fn set_memory_overdrive(&self, _device: usize, _percent: u32) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(
            "overdrive percentages are available only with the AMDGPU driver",
        ))
    }

    fn adapter_state(&self, device: usize) -> Result<AdapterState, BackendError> {
        let adapter = &self.adapters[device];
        let activity = self.activity(device)?;

        let temperature_get: Symbol<TemperatureGet> =
            self.symbol("ADL_Overdrive5_Temperature_Get")?;
        let mut temperature = AdlTemperature {
            size: mem::size_of::<AdlTemperature>() as c_int,
            ..Default::default()
        };
        let status = unsafe { temperature_get(adapter.adl_index, 0, &mut temperature) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Overdrive5_Temperature_Get", status));
        }

        let fan_get: Symbol<FanSpeedGet> = self.symbol("ADL_Overdrive5_FanSpeed_Get")?;
        let mut fan = AdlFanSpeedValue {
            size: mem::size_of::<AdlFanSpeedValue>() as c_int,
            speed_type: ADL_DL_FANCTRL_SPEED_TYPE_PERCENT,
            ..Default::default()
        };
        let status = unsafe { fan_get(adapter.adl_index, 0, &mut fan) };
        if status != ADL_OK {
            return Err(BackendError::Adl("ADL_Overdrive5_FanSpeed_Get", status));
        }

        Ok(AdapterState {
            name: adapter.name.clone(),
            bus: adapter.bus,
            device: adapter.device,
            function: adapter.function,
            vendor_id: adapter.vendor_id,
            device_id: None,
            core_clock: f64::from(activity.engine_clock) / 100.0,
            memory_clock: f64::from(activity.memory_clock) / 100.0,
            voltage: Some(f64::from(activity.vddc) / 1000.0),
            core_overdrive: None,
            memory_overdrive: None,
            gpu_load: Some(activity.activity_percent.max(0) as u32),
            temperature: f64::from(temperature.temperature) / 1000.0,
            critical_temperature: None,
            fan_speed: f64::from(fan.fan_speed),
            fan_automatic: None,
            bus_speed: Some(activity.current_bus_speed.max(0) as u32),
            bus_lanes: Some(activity.current_bus_lanes.max(0) as u32),
            core_clocks: Vec::new(),
            memory_clocks: Vec::new(),
        })
    }
}

/// Zeroed backing storage for an ADLODPerformanceLevels record holding
/// `level_count` levels, with its `iSize` field filled in.
fn levels_buffer(level_count: usize) -> Vec<u8> {
    let byte_len = mem::size_of::<AdlOdPerformanceLevelsHeader>()
        + level_count * mem::size_of::<AdlOdPerformanceLevel>();
    let mut buffer = vec![0u8; byte_len];
    // The header is plain-old-data at offset 0.
    unsafe {
        let header = buffer.as_mut_ptr().cast::<AdlOdPerformanceLevelsHeader>();
        (*header).size = byte_len as c_int;
    }
    buffer
}

/// Copy a NUL-terminated fixed C buffer into an owned string.
fn c_string(buffer: &[c_char]) -> String {
    let bytes: Vec<u8> = buffer
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_buffer_sizes_variable_length_record() {
        let buffer = levels_buffer(3);
        let expected = mem::size_of::<AdlOdPerformanceLevelsHeader>()
            + 3 * mem::size_of::<AdlOdPerformanceLevel>();
        assert_eq!(buffer.len(), expected);
        let header = unsafe { &*buffer.as_ptr().cast::<AdlOdPerformanceLevelsHeader>() };
        assert_eq!(header.size, expected as c_int);
    }

    #[test]
    fn c_string_stops_at_nul() {
        let mut raw = [0 as c_char; 8];
        for (slot, byte) in raw.iter_mut().zip(b"Radeon\0x") {
            *slot = *byte as c_char;
        }
        assert_eq!(c_string(&raw), "Radeon");
    }
}
