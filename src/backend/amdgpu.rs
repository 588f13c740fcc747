use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use pciid_parser::Database;

use super::{AdapterState, DeviceCaps, GpuBackend, PerformanceLevel};
use crate::errors::BackendError;

const DRM_BASE: &str = "/sys/class/drm";
const DEBUG_DRI_BASE: &str = "/sys/kernel/debug/dri";
const AMD_VENDOR_ID: u32 = 0x1002;

/// Backend for the AMDGPU kernel driver, backed by sysfs.
///
/// Adapters are the `/sys/class/drm/card<N>` entries with an AMD vendor id,
/// in ascending card order. Clock state comes from the `pp_dpm_*` tables and
/// the `pp_sclk_od`/`pp_mclk_od` overdrive registers; fan control goes
/// through the card's hwmon directory.
pub struct AmdgpuBackend {
    drm_base: PathBuf,
    debug_base: PathBuf,
    /// DRM card number per adapter index.
    cards: Vec<u32>,
    /// Matching hwmon number per adapter index.
    hwmon: Vec<u32>,
    pci_db: Option<Database>,
}

impl AmdgpuBackend {
    pub fn new() -> Result<Self, BackendError> {
        let mut backend = Self::with_bases(PathBuf::from(DRM_BASE), PathBuf::from(DEBUG_DRI_BASE))?;
        backend.pci_db = Database::read().ok();
        Ok(backend)
    }

    /// Create a backend rooted at custom paths (used by tests); the PCI id
    /// database is left unloaded.
    fn with_bases(drm_base: PathBuf, debug_base: PathBuf) -> Result<Self, BackendError> {
        let cards = discover_cards(&drm_base)?;
        let hwmon = cards
            .iter()
            .map(|&card| find_hwmon_number(&drm_base.join(format!("card{card}/device/hwmon"))))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("AMD DRM cards: {cards:?}, hwmon numbers: {hwmon:?}");

        Ok(Self {
            drm_base,
            debug_base,
            cards,
            hwmon,
            pci_db: None,
        })
    }

    fn device_path(&self, device: usize, file: &str) -> PathBuf {
        self.drm_base
            .join(format!("card{}/device/{file}", self.cards[device]))
    }

    fn hwmon_path(&self, device: usize, file: &str) -> PathBuf {
        self.drm_base.join(format!(
            "card{}/device/hwmon/hwmon{}/{file}",
            self.cards[device], self.hwmon[device]
        ))
    }

    /// Base (non-overdriven) core and memory clocks: the top DPM clock with
    /// the currently applied overdrive percentage backed out again.
    fn base_clocks(&self, device: usize) -> Result<(u32, u32), BackendError> {
        let core_od = read_sysfs_value(&self.device_path(device, "pp_sclk_od"))?;
        let memory_od = read_sysfs_value(&self.device_path(device, "pp_mclk_od"))?;

        let (core_table, _) = read_dpm_table(&self.device_path(device, "pp_dpm_sclk"))?;
        let (memory_table, _) = read_dpm_table(&self.device_path(device, "pp_dpm_mclk"))?;

        Ok((
            undo_overdrive(core_table.last().copied(), core_od),
            undo_overdrive(memory_table.last().copied(), memory_od),
        ))
    }

    fn adapter_name(&self, vendor_id: u32, device_id: u32) -> String {
        let name = self.pci_db.as_ref().and_then(|db| {
            db.get_device_info(
                &format!("{vendor_id:04x}"),
                &format!("{device_id:04x}"),
                "",
                "",
            )
            .device_name
            .map(str::to_owned)
        });
        name.unwrap_or_else(|| format!("Unknown AMD GPU ({vendor_id:04x}:{device_id:04x})"))
    }

    /// GPU load percentage from the debugfs pm info file, when readable.
    fn gpu_load(&self, device: usize) -> Option<u32> {
        let path = self
            .debug_base
            .join(format!("{}/amdgpu_pm_info", self.cards[device]));
        let content = fs::read_to_string(path).ok()?;
        content.lines().find_map(|line| {
            let value = line
                .strip_prefix("GPU load: ")
                .or_else(|| line.strip_prefix("GPU Load: "))?;
            value.trim_end_matches('%').trim().parse().ok()
        })
    }
}

impl GpuBackend for AmdgpuBackend {
    fn device_count(&self) -> usize {
        self.cards.len()
    }

    fn capabilities(&self, device: usize) -> Result<DeviceCaps, BackendError> {
        let (core_clock, memory_clock) = self.base_clocks(device)?;
        Ok(DeviceCaps::Envelope {
            core_clock,
            memory_clock,
        })
    }

    fn read_performance_levels(
        &self,
        _device: usize,
        _defaults: bool,
    ) -> Result<Vec<PerformanceLevel>, BackendError> {
        Err(BackendError::Unsupported(
            "AMDGPU exposes overdrive percentages, not editable levels",
        ))
    }

    fn write_performance_levels(
        &self,
        _device: usize,
        _levels: &[PerformanceLevel],
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(
            "AMDGPU exposes overdrive percentages, not editable levels",
        ))
    }

    fn set_fan_speed(&self, device: usize, percent: f64) -> Result<(), BackendError> {
        // Manual PWM mode before writing the duty cycle.
        write_sysfs_value(&self.hwmon_path(device, "pwm1_enable"), 1)?;

        let min = read_sysfs_value(&self.hwmon_path(device, "pwm1_min"))?;
        let max = read_sysfs_value(&self.hwmon_path(device, "pwm1_max"))?;
        let pwm = (percent / 100.0 * f64::from(max - min) + f64::from(min)).round() as u32;

        write_sysfs_value(&self.hwmon_path(device, "pwm1"), pwm)
    }

    fn set_fan_speed_to_default(&self, device: usize) -> Result<(), BackendError> {
        // 2 puts the fan back under automatic driver control.
        write_sysfs_value(&self.hwmon_path(device, "pwm1_enable"), 2)
    }

    fn set_core_overdrive(&self, device: usize, percent: u32) -> Result<(), BackendError> {
        write_sysfs_value(&self.device_path(device, "pp_sclk_od"), percent)
    }

    fn set_memory_overdrive(&self, device: usize, percent: u32) -> Result<(), BackendError> {
        write_sysfs_value(&self.device_path(device, "pp_mclk_od"), percent)
    }

    fn adapter_state(&self, device: usize) -> Result<AdapterState, BackendError> {
        let vendor_id = read_sysfs_value(&self.device_path(device, "vendor"))?;
        let device_id = read_sysfs_value(&self.device_path(device, "device"))?;

        let (bus, pci_device, function) = fs::read_link(
            self.drm_base
                .join(format!("card{}/device", self.cards[device])),
        )
        .ok()
        .and_then(|target| parse_pci_address(&target))
        .unwrap_or_default();

        let (core_clocks, active_core) = read_dpm_table(&self.device_path(device, "pp_dpm_sclk"))?;
        let (memory_clocks, active_memory) =
            read_dpm_table(&self.device_path(device, "pp_dpm_mclk"))?;

        let core_od = read_sysfs_value(&self.device_path(device, "pp_sclk_od"))?;
        let memory_od = read_sysfs_value(&self.device_path(device, "pp_mclk_od"))?;

        let fan_min = read_sysfs_value(&self.hwmon_path(device, "pwm1_min"))?;
        let fan_max = read_sysfs_value(&self.hwmon_path(device, "pwm1_max"))?;
        let fan_pwm = read_sysfs_value(&self.hwmon_path(device, "pwm1"))?;
        let fan_mode = read_sysfs_value(&self.hwmon_path(device, "pwm1_enable"))?;

        let temperature = read_sysfs_value(&self.hwmon_path(device, "temp1_input"))?;
        let critical = read_sysfs_value(&self.hwmon_path(device, "temp1_crit"))?;

        let pcie = fs::read_to_string(
            self.drm_base
                .join(format!("card{}/pp_dpm_pcie", self.cards[device])),
        )
        .ok()
        .and_then(|content| parse_dpm_pcie(&content).ok().flatten());

        Ok(AdapterState {
            name: self.adapter_name(vendor_id, device_id),
            bus,
            device: pci_device,
            function,
            vendor_id,
            device_id: Some(device_id),
            core_clock: active_core
                .and_then(|index| core_clocks.get(index))
                .copied()
                .unwrap_or(0)
                .into(),
            memory_clock: active_memory
                .and_then(|index| memory_clocks.get(index))
                .copied()
                .unwrap_or(0)
                .into(),
            voltage: None,
            core_overdrive: Some(core_od),
            memory_overdrive: Some(memory_od),
            gpu_load: self.gpu_load(device),
            temperature: f64::from(temperature) / 1000.0,
            critical_temperature: Some(f64::from(critical) / 1000.0),
            fan_speed: f64::from(fan_pwm.saturating_sub(fan_min)) / f64::from(fan_max - fan_min)
                * 100.0,
            fan_automatic: Some(fan_mode == 2),
            bus_speed: pcie.map(|(speed, _)| speed),
            bus_lanes: pcie.map(|(_, lanes)| lanes),
            core_clocks,
            memory_clocks,
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// DRM card numbers with an AMD vendor id, ascending.
fn discover_cards(drm_base: &Path) -> Result<Vec<u32>, BackendError> {
    let entries = match fs::read_dir(drm_base) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(map_io_error(error, drm_base)),
    };

    let mut cards: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("card"))
                .and_then(|number| number.parse().ok())
        })
        .collect();
    cards.sort_unstable();

    let mut amd_cards = Vec::new();
    for card in cards {
        let vendor_path = drm_base.join(format!("card{card}/device/vendor"));
        match read_sysfs_value(&vendor_path) {
            Ok(AMD_VENDOR_ID) => amd_cards.push(card),
            Ok(_) => {}
            Err(error) => debug!("skipping card{card}: {error}"),
        }
    }

    Ok(amd_cards)
}

/// Lowest `hwmon<N>` entry of a card's hwmon directory.
fn find_hwmon_number(hwmon_dir: &Path) -> Result<u32, BackendError> {
    let entries = fs::read_dir(hwmon_dir).map_err(|error| map_io_error(error, hwmon_dir))?;

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("hwmon"))
                .and_then(|number| number.parse().ok())
        })
        .min()
        .ok_or_else(|| {
            BackendError::Parse(format!("no hwmon entry under {}", hwmon_dir.display()))
        })
}

/// Back the applied overdrive percentage out of the top DPM clock.
fn undo_overdrive(top_clock: Option<u32>, overdrive: u32) -> u32 {
    match top_clock {
        Some(clock) => (f64::from(clock) / (1.0 + f64::from(overdrive) * 0.01)).ceil() as u32,
        None => 0,
    }
}

fn read_dpm_table(path: &Path) -> Result<(Vec<u32>, Option<usize>), BackendError> {
    let content = fs::read_to_string(path).map_err(|error| map_io_error(error, path))?;
    parse_dpm_table(&content)
        .map_err(|error| BackendError::Parse(format!("{}: {error}", path.display())))
}

/// Parse a `pp_dpm_sclk`/`pp_dpm_mclk` table: one `<index>: <clock>Mhz`
/// line per level, the active level marked with a trailing `*`.
fn parse_dpm_table(content: &str) -> Result<(Vec<u32>, Option<usize>), String> {
    let mut clocks = Vec::new();
    let mut active = None;

    for line in content.lines() {
        if line.is_empty() {
            break;
        }
        let (index_text, rest) = line
            .split_once(": ")
            .ok_or_else(|| format!("malformed DPM line '{line}'"))?;
        let index: usize = index_text
            .parse()
            .map_err(|_| format!("bad DPM index in '{line}'"))?;

        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let clock: u32 = rest[..digits]
            .parse()
            .map_err(|_| format!("bad DPM clock in '{line}'"))?;
        let tail = rest[digits..]
            .strip_prefix("Mhz")
            .ok_or_else(|| format!("bad DPM unit in '{line}'"))?;

        if tail.starts_with(" *") {
            active = Some(index);
        }

        if index >= clocks.len() {
            clocks.resize(index + 1, 0);
        }
        clocks[index] = clock;
    }

    Ok((clocks, active))
}

/// Parse `pp_dpm_pcie` and return `(speed in MB, lanes)` of the active
/// (starred) line, if any. Units other than GB and MB are unspecified in
/// the driver interface and rejected.
fn parse_dpm_pcie(content: &str) -> Result<Option<(u32, u32)>, String> {
    for line in content.lines() {
        if line.is_empty() {
            break;
        }
        let (_, rest) = line
            .split_once(": ")
            .ok_or_else(|| format!("malformed PCIe line '{line}'"))?;

        let unit_start = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing PCIe unit in '{line}'"))?;
        let bandwidth: f64 = rest[..unit_start]
            .parse()
            .map_err(|_| format!("bad PCIe bandwidth in '{line}'"))?;

        let rest = &rest[unit_start..];
        let (speed_mb, rest) = if let Some(tail) = rest.strip_prefix("GB") {
            ((bandwidth * 1000.0) as u32, tail)
        } else if let Some(tail) = rest.strip_prefix("MB") {
            (bandwidth as u32, tail)
        } else {
            return Err(format!("bad PCIe unit in '{line}'"));
        };

        let lanes_text = rest
            .strip_prefix(", x")
            .ok_or_else(|| format!("missing PCIe lanes in '{line}'"))?;
        let digits = lanes_text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(lanes_text.len());
        let lanes: u32 = lanes_text[..digits]
            .parse()
            .map_err(|_| format!("bad PCIe lanes in '{line}'"))?;

        if lanes_text[digits..].starts_with(" *") {
            return Ok(Some((speed_mb, lanes)));
        }
    }

    Ok(None)
}

/// Bus, device and function from a `card<N>/device` symlink target such as
/// `../../../0000:01:00.0`.
fn parse_pci_address(target: &Path) -> Option<(u32, u32, u32)> {
    let name = target.file_name()?.to_str()?;
    let mut parts = name.rsplitn(3, ':');
    let device_function = parts.next()?;
    let bus = u32::from_str_radix(parts.next()?, 16).ok()?;
    let (device, function) = device_function.split_once('.')?;
    Some((
        bus,
        u32::from_str_radix(device, 16).ok()?,
        function.parse().ok()?,
    ))
}

/// Read a sysfs file holding one integer, decimal or `0x`-prefixed hex.
fn read_sysfs_value(path: &Path) -> Result<u32, BackendError> {
    let content = fs::read_to_string(path).map_err(|error| map_io_error(error, path))?;
    let text = content.trim();
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| {
        BackendError::Parse(format!(
            "failed to parse '{text}' from {}",
            path.display()
        ))
    })
}

fn write_sysfs_value(path: &Path, value: u32) -> Result<(), BackendError> {
    fs::write(path, format!("{value}\n")).map_err(|error| map_io_error(error, path))
}

fn map_io_error(error: std::io::Error, path: &Path) -> BackendError {
    match error.kind() {
        ErrorKind::PermissionDenied => {
            BackendError::PermissionDenied(format!("{}: {error}", path.display()))
        }
        _ => BackendError::Io(error),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
