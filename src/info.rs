use crate::backend::{DeviceCaps, GpuBackend};
use crate::errors::BackendError;
use crate::selector::DeviceSelection;

/// Print the per-adapter report for the selected adapters (all of them when
/// no `--adapters` list was given).
pub fn print_adapters(
    backend: &dyn GpuBackend,
    chosen: Option<&DeviceSelection>,
    verbose: bool,
) -> Result<(), BackendError> {
    let device_count = backend.device_count();
    let selection = chosen.unwrap_or(&DeviceSelection::All);

    for index in selection.resolve(device_count) {
        let device = index as usize;
        if verbose {
            print_verbose(backend, device)?;
        } else {
            print_short(backend, device)?;
        }
    }

    Ok(())
}

fn print_short(backend: &dyn GpuBackend, device: usize) -> Result<(), BackendError> {
    let state = backend.adapter_state(device)?;

    println!("Adapter {device}: {}", state.name);

    let mut line = format!(
        "  Core: {} MHz, Mem: {} MHz",
        state.core_clock, state.memory_clock
    );
    if let Some(voltage) = state.voltage {
        line.push_str(&format!(", Vddc: {voltage} V"));
    }
    if let (Some(core_od), Some(memory_od)) = (state.core_overdrive, state.memory_overdrive) {
        line.push_str(&format!(", CoreOD: {core_od}, MemOD: {memory_od}"));
    }
    if let Some(load) = state.gpu_load {
        line.push_str(&format!(", Load: {load}%"));
    }
    line.push_str(&format!(
        ", Temp: {} C, Fan: {}%",
        state.temperature, state.fan_speed
    ));
    println!("{line}");

    if !state.core_clocks.is_empty() {
        println!("  Core clocks: {}", join_clocks(&state.core_clocks));
    }
    if !state.memory_clocks.is_empty() {
        println!("  Memory clocks: {}", join_clocks(&state.memory_clocks));
    }

    if let DeviceCaps::Ranged {
        engine_clock,
        memory_clock,
        voltage,
        ..
    } = backend.capabilities(device)?
    {
        println!(
            "  Max ranges: Core: {} - {} MHz, Mem: {} - {} MHz, Vddc: {} - {} V",
            engine_clock.0, engine_clock.1, memory_clock.0, memory_clock.1, voltage.0, voltage.1
        );
    }

    Ok(())
}

fn print_verbose(backend: &dyn GpuBackend, device: usize) -> Result<(), BackendError> {
    let state = backend.adapter_state(device)?;

    println!("Adapter {device}: {}", state.name);
    println!(
        "  Device topology: {}:{}:{}",
        state.bus, state.device, state.function
    );
    println!("  Vendor ID: {}", state.vendor_id);
    if let Some(device_id) = state.device_id {
        println!("  Device ID: {device_id}");
    }
    println!("  Current core clock: {} MHz", state.core_clock);
    println!("  Current memory clock: {} MHz", state.memory_clock);
    if let Some(voltage) = state.voltage {
        println!("  Current voltage: {voltage} V");
    }
    if let Some(core_od) = state.core_overdrive {
        println!("  Core overdrive: {core_od}");
    }
    if let Some(memory_od) = state.memory_overdrive {
        println!("  Memory overdrive: {memory_od}");
    }
    if let Some(load) = state.gpu_load {
        println!("  GPU load: {load}%");
    }
    if let Some(speed) = state.bus_speed {
        println!("  Current bus speed: {speed}");
    }
    if let Some(lanes) = state.bus_lanes {
        println!("  Current bus lanes: {lanes}");
    }
    println!("  Temperature: {} C", state.temperature);
    if let Some(critical) = state.critical_temperature {
        println!("  Critical temperature: {critical} C");
    }
    println!("  Current fan speed: {}%", state.fan_speed);
    if let Some(automatic) = state.fan_automatic {
        println!(
            "  Controlled fan speed: {}",
            if automatic { "no" } else { "yes" }
        );
    }

    match backend.capabilities(device)? {
        DeviceCaps::Ranged {
            level_count,
            engine_clock,
            memory_clock,
            voltage,
        } => {
            println!(
                "  Core clock range: {} - {} MHz",
                engine_clock.0, engine_clock.1
            );
            println!(
                "  Memory clock range: {} - {} MHz",
                memory_clock.0, memory_clock.1
            );
            println!("  Voltage range: {} - {} V", voltage.0, voltage.1);
            println!("  Performance levels: {level_count}");
            for (label, defaults) in [("Performance levels", false), ("Default performance levels", true)]
            {
                println!("  {label}:");
                for (level, record) in backend
                    .read_performance_levels(device, defaults)?
                    .iter()
                    .enumerate()
                {
                    println!(
                        "    Level {level}: Core: {} MHz, Mem: {} MHz, Vddc: {} V",
                        f64::from(record.engine_clock) / 100.0,
                        f64::from(record.memory_clock) / 100.0,
                        f64::from(record.voltage) / 1000.0
                    );
                }
            }
        }
        DeviceCaps::Envelope { .. } => {
            if !state.core_clocks.is_empty() {
                println!("  Core clocks:");
                for clock in &state.core_clocks {
                    println!("    {clock} MHz");
                }
            }
            if !state.memory_clocks.is_empty() {
                println!("  Memory clocks:");
                for clock in &state.memory_clocks {
                    println!("    {clock} MHz");
                }
            }
        }
    }

    println!();
    Ok(())
}

fn join_clocks(clocks: &[u32]) -> String {
    clocks
        .iter()
        .map(|clock| clock.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
