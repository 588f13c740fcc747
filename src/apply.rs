use log::warn;

use crate::backend::{DeviceCaps, GpuBackend, PerformanceLevel};
use crate::directive::{Directive, ParameterKind, ValueSpec};
use crate::errors::BackendError;

/// Per-device fan directive accumulator; the last directive touching a
/// device wins, untouched devices are never written.
#[derive(Debug, Clone, Copy, Default)]
struct FanSpeedSetup {
    value: f64,
    use_default: bool,
    is_set: bool,
}

/// Pending mutation state of one device. All directives touching the device
/// are merged here first; the commit phase then issues one write per
/// affected entity, never one write per directive.
enum Pending {
    /// ADL-style: the full level table, mutated in place.
    Levels {
        current: Vec<PerformanceLevel>,
        defaults: Vec<PerformanceLevel>,
        changed: bool,
    },
    /// AMDGPU-style: overdrive percentages still to be written.
    Overdrive {
        core: Option<u32>,
        memory: Option<u32>,
    },
}

/// Apply a batch of directives that already passed validation: print the
/// per-device preview, merge, then commit. A backend write failure aborts
/// the remaining commits; per-device writes already issued are final.
pub fn apply(
    backend: &dyn GpuBackend,
    directives: &[Directive],
    caps: &[DeviceCaps],
) -> Result<(), BackendError> {
    println!("WARNING: setting AMD Overdrive parameters!");
    println!(
        "\nIMPORTANT NOTICE: before changing any AMD Overdrive parameter,\n\
         please stop all GPU computations and GPU renderings.\n\
         Use this utility carefully, it can damage your hardware!\n"
    );

    let device_count = caps.len();

    print_preview(directives, caps);

    let mut fans = vec![FanSpeedSetup::default(); device_count];
    for directive in fan_directives(directives) {
        for index in directive.selection.resolve(device_count) {
            fans[index as usize] = match directive.value {
                ValueSpec::Default => FanSpeedSetup {
                    value: 0.0,
                    use_default: true,
                    is_set: true,
                },
                ValueSpec::Value(value) => FanSpeedSetup {
                    value,
                    use_default: false,
                    is_set: true,
                },
            };
        }
    }

    let mut pending = caps
        .iter()
        .enumerate()
        .map(|(device, device_caps)| match device_caps {
            DeviceCaps::Ranged { .. } => Ok(Pending::Levels {
                current: backend.read_performance_levels(device, false)?,
                defaults: backend.read_performance_levels(device, true)?,
                changed: false,
            }),
            DeviceCaps::Envelope { .. } => Ok(Pending::Overdrive {
                core: None,
                memory: None,
            }),
        })
        .collect::<Result<Vec<_>, BackendError>>()?;

    for directive in level_directives(directives) {
        for index in directive.selection.resolve(device_count) {
            let device = index as usize;
            merge(directive, device, &caps[device], &mut pending[device]);
        }
    }

    for (device, fan) in fans.iter().enumerate() {
        if !fan.is_set {
            continue;
        }
        if fan.use_default {
            backend.set_fan_speed_to_default(device)?;
        } else {
            backend.set_fan_speed(device, fan.value.round())?;
        }
    }

    for (device, change) in pending.iter().enumerate() {
        match change {
            Pending::Levels {
                current,
                changed: true,
                ..
            } => backend.write_performance_levels(device, current)?,
            Pending::Levels { .. } => {}
            Pending::Overdrive { core, memory } => {
                if let Some(percent) = core {
                    backend.set_core_overdrive(device, *percent)?;
                }
                if let Some(percent) = memory {
                    backend.set_memory_overdrive(device, *percent)?;
                }
            }
        }
    }

    Ok(())
}

fn fan_directives(directives: &[Directive]) -> impl Iterator<Item = &Directive> {
    directives
        .iter()
        .filter(|d| d.kind == ParameterKind::FanSpeed)
}

fn level_directives(directives: &[Directive]) -> impl Iterator<Item = &Directive> {
    directives
        .iter()
        .filter(|d| d.kind != ParameterKind::FanSpeed)
}

/// Fold one directive into the pending state of one device.
fn merge(directive: &Directive, device: usize, caps: &DeviceCaps, pending: &mut Pending) {
    match pending {
        Pending::Levels {
            current,
            defaults,
            changed,
        } => {
            let level = directive.level.resolve(current.len() as i32) as usize;
            match directive.kind {
                ParameterKind::CoreClock => {
                    current[level].engine_clock = match directive.value {
                        ValueSpec::Default => defaults[level].engine_clock,
                        // ADL stores clocks in 10 kHz units.
                        ValueSpec::Value(mhz) => (mhz * 100.0).round() as i32,
                    };
                    *changed = true;
                }
                ParameterKind::MemoryClock => {
                    current[level].memory_clock = match directive.value {
                        ValueSpec::Default => defaults[level].memory_clock,
                        ValueSpec::Value(mhz) => (mhz * 100.0).round() as i32,
                    };
                    *changed = true;
                }
                ParameterKind::Voltage => {
                    match directive.value {
                        ValueSpec::Default => current[level].voltage = defaults[level].voltage,
                        ValueSpec::Value(volts) => {
                            if current[level].voltage == 0 {
                                // No baseline to offset from on this level.
                                warn!(
                                    "voltage for adapter {device} is not set, skipping '{}'",
                                    directive.source
                                );
                            } else {
                                current[level].voltage = (volts * 1000.0).round() as i32;
                            }
                        }
                    }
                    *changed = true;
                }
                // Informational no-ops here; the preview already said so.
                ParameterKind::CoreOverdrive | ParameterKind::MemoryOverdrive => {}
                ParameterKind::FanSpeed => unreachable!(),
            }
        }
        Pending::Overdrive { core, memory } => {
            let DeviceCaps::Envelope {
                core_clock,
                memory_clock,
            } = caps
            else {
                unreachable!()
            };
            match directive.kind {
                ParameterKind::CoreClock => {
                    *core = Some(match directive.value {
                        ValueSpec::Default => 0,
                        ValueSpec::Value(mhz) => relative_overdrive(mhz, *core_clock),
                    });
                }
                ParameterKind::MemoryClock => {
                    *memory = Some(match directive.value {
                        ValueSpec::Default => 0,
                        ValueSpec::Value(mhz) => relative_overdrive(mhz, *memory_clock),
                    });
                }
                ParameterKind::CoreOverdrive => {
                    *core = Some(match directive.value {
                        ValueSpec::Default => 0,
                        ValueSpec::Value(percent) => percent.round() as u32,
                    });
                }
                ParameterKind::MemoryOverdrive => {
                    *memory = Some(match directive.value {
                        ValueSpec::Default => 0,
                        ValueSpec::Value(percent) => percent.round() as u32,
                    });
                }
                ParameterKind::Voltage => {}
                ParameterKind::FanSpeed => unreachable!(),
            }
        }
    }
}

/// A requested absolute clock, expressed as the relative overdrive
/// percentage the AMDGPU driver wants.
fn relative_overdrive(requested_mhz: f64, base_mhz: u32) -> u32 {
    let base = f64::from(base_mhz);
    (((requested_mhz - base) / base) * 100.0).round() as u32
}

/// One human-readable line per (directive, resolved device), before any
/// mutation. Fan directives are listed first, like the commit order.
fn print_preview(directives: &[Directive], caps: &[DeviceCaps]) {
    let device_count = caps.len();

    for directive in fan_directives(directives) {
        for index in directive.selection.resolve(device_count) {
            println!(
                "Setting fan speed to {} for adapter {index} at thermal controller {}",
                format_value(directive.value, "%"),
                directive.level.resolve(1),
            );
        }
    }

    for directive in level_directives(directives) {
        for index in directive.selection.resolve(device_count) {
            let device_caps = &caps[index as usize];
            let level = directive.level.resolve(device_caps.level_count());
            let ranged = matches!(device_caps, DeviceCaps::Ranged { .. });

            match directive.kind {
                ParameterKind::CoreClock => println!(
                    "Setting core clock to {} for adapter {index} at performance level {level}",
                    format_value(directive.value, " MHz"),
                ),
                ParameterKind::MemoryClock => println!(
                    "Setting memory clock to {} for adapter {index} at performance level {level}",
                    format_value(directive.value, " MHz"),
                ),
                ParameterKind::Voltage if ranged => println!(
                    "Setting Vddc voltage to {} for adapter {index} at performance level {level}",
                    format_value(directive.value, " V"),
                ),
                ParameterKind::Voltage => {
                    println!("Vddc voltage is available only with the Catalyst driver.");
                }
                ParameterKind::CoreOverdrive if !ranged => println!(
                    "Setting core overdrive to {} for adapter {index}",
                    format_value(directive.value, "%"),
                ),
                ParameterKind::MemoryOverdrive if !ranged => println!(
                    "Setting memory overdrive to {} for adapter {index}",
                    format_value(directive.value, "%"),
                ),
                ParameterKind::CoreOverdrive | ParameterKind::MemoryOverdrive => {
                    println!("Overdrive percentage is available only with the AMDGPU driver.");
                }
                ParameterKind::FanSpeed => unreachable!(),
            }
        }
    }
}

fn format_value(value: ValueSpec, unit: &str) -> String {
    match value {
        ValueSpec::Default => "default".to_string(),
        ValueSpec::Value(value) => format!("{value}{unit}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::parse_directive;
    use std::cell::RefCell;

    /// Records every backend write; performance level reads are served from
    /// canned tables.
    struct FakeBackend {
        caps: Vec<DeviceCaps>,
        current: Vec<Vec<PerformanceLevel>>,
        defaults: Vec<Vec<PerformanceLevel>>,
        writes: RefCell<Vec<Write>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Write {
        Levels(usize, Vec<PerformanceLevel>),
        Fan(usize, f64),
        FanDefault(usize),
        CoreOd(usize, u32),
        MemoryOd(usize, u32),
    }

    impl FakeBackend {
        fn ranged(devices: usize) -> Self {
            let levels = vec![
                PerformanceLevel {
                    engine_clock: 30_000,
                    memory_clock: 15_000,
                    voltage: 900,
                },
                PerformanceLevel {
                    engine_clock: 100_000,
                    memory_clock: 120_000,
                    voltage: 1100,
                },
            ];
            FakeBackend {
                caps: vec![
                    DeviceCaps::Ranged {
                        level_count: 2,
                        engine_clock: (300.0, 1200.0),
                        memory_clock: (150.0, 1500.0),
                        voltage: (0.8, 1.3),
                    };
                    devices
                ],
                current: vec![levels.clone(); devices],
                defaults: vec![levels; devices],
                writes: RefCell::new(Vec::new()),
            }
        }

        fn envelope(devices: usize) -> Self {
            FakeBackend {
                caps: vec![
                    DeviceCaps::Envelope {
                        core_clock: 1000,
                        memory_clock: 500,
                    };
                    devices
                ],
                current: vec![Vec::new(); devices],
                defaults: vec![Vec::new(); devices],
                writes: RefCell::new(Vec::new()),
            }
        }

        fn writes(&self) -> Vec<Write> {
            self.writes.borrow().clone()
        }
    }

    impl GpuBackend for FakeBackend {
        fn device_count(&self) -> usize {
            self.caps.len()
        }

        fn capabilities(&self, device: usize) -> Result<DeviceCaps, BackendError> {
            Ok(self.caps[device].clone())
        }

        fn read_performance_levels(
            &self,
            device: usize,
            defaults: bool,
        ) -> Result<Vec<PerformanceLevel>, BackendError> {
            Ok(if defaults {
                self.defaults[device].clone()
            } else {
                self.current[device].clone()
            })
        }

        fn write_performance_levels(
            &self,
            device: usize,
            levels: &[PerformanceLevel],
        ) -> Result<(), BackendError> {
            self.writes
                .borrow_mut()
                .push(Write::Levels(device, levels.to_vec()));
            Ok(())
        }

        fn set_fan_speed(&self, device: usize, percent: f64) -> Result<(), BackendError> {
            self.writes.borrow_mut().push(Write::Fan(device, percent));
            Ok(())
        }

        fn set_fan_speed_to_default(&self, device: usize) -> Result<(), BackendError> {
            self.writes.borrow_mut().push(Write::FanDefault(device));
            Ok(())
        }

        fn set_core_overdrive(&self, device: usize, percent: u32) -> Result<(), BackendError> {
            self.writes.borrow_mut().push(Write::CoreOd(device, percent));
            Ok(())
        }

        fn set_memory_overdrive(&self, device: usize, percent: u32) -> Result<(), BackendError> {
            self.writes
                .borrow_mut()
                .push(Write::MemoryOd(device, percent));
            Ok(())
        }

        fn adapter_state(
            &self,
            _device: usize,
        ) -> Result<crate::backend::AdapterState, BackendError> {
            unimplemented!("not used by the apply engine")
        }
    }

    fn run(backend: &FakeBackend, tokens: &[&str]) {
        let directives: Vec<_> = tokens
            .iter()
            .map(|t| parse_directive(t).unwrap())
            .collect();
        apply(backend, &directives, &backend.caps).unwrap();
    }

    #[test]
    fn later_fan_directive_wins() {
        let backend = FakeBackend::ranged(1);
        run(&backend, &["fanspeed:0=50", "fanspeed:0=70"]);
        assert_eq!(backend.writes(), vec![Write::Fan(0, 70.0)]);
    }

    #[test]
    fn untouched_devices_are_not_written() {
        let backend = FakeBackend::ranged(3);
        run(&backend, &["fanspeed:1=40"]);
        assert_eq!(backend.writes(), vec![Write::Fan(1, 40.0)]);
    }

    #[test]
    fn level_directives_merge_into_one_write_per_device() {
        let backend = FakeBackend::ranged(2);
        run(&backend, &["coreclk:0:0=500", "memclk:0:1=800", "vcore:0:1=1.2"]);

        let writes = backend.writes();
        assert_eq!(writes.len(), 1);
        let Write::Levels(0, levels) = &writes[0] else {
            panic!("expected a level write for device 0, got {writes:?}");
        };
        assert_eq!(levels[0].engine_clock, 50_000);
        assert_eq!(levels[0].memory_clock, 15_000);
        assert_eq!(levels[1].memory_clock, 80_000);
        assert_eq!(levels[1].voltage, 1200);
    }

    #[test]
    fn default_restores_recorded_default_and_is_idempotent() {
        let mut backend = FakeBackend::ranged(1);
        backend.current[0][1].engine_clock = 110_000;

        run(&backend, &["coreclk:0=default"]);
        let first = backend.writes();
        assert_eq!(
            first,
            vec![Write::Levels(0, backend.defaults[0].clone())]
        );

        // Feed the written state back in; a second application is a no-op
        // in terms of the resulting table.
        let Write::Levels(_, written) = &first[0] else { unreachable!() };
        backend.current[0] = written.clone();
        backend.writes.borrow_mut().clear();
        run(&backend, &["coreclk:0=default"]);
        assert_eq!(backend.writes(), first);
    }

    #[test]
    fn last_level_is_resolved_per_device() {
        let backend = FakeBackend::ranged(1);
        run(&backend, &["coreclk:0=1100"]);
        let writes = backend.writes();
        let Write::Levels(0, levels) = &writes[0] else { panic!() };
        assert_eq!(levels[1].engine_clock, 110_000);
        assert_eq!(levels[0].engine_clock, 30_000);
    }

    #[test]
    fn voltage_without_baseline_is_skipped() {
        let mut backend = FakeBackend::ranged(1);
        backend.current[0][1].voltage = 0;

        run(&backend, &["vcore:0=1.1"]);
        let writes = backend.writes();
        let Write::Levels(0, levels) = &writes[0] else { panic!() };
        assert_eq!(levels[1].voltage, 0);
    }

    #[test]
    fn clocks_become_relative_overdrive_on_the_amdgpu_backend() {
        let backend = FakeBackend::envelope(1);
        run(&backend, &["coreclk=1100", "memclk=550"]);
        assert_eq!(
            backend.writes(),
            vec![Write::CoreOd(0, 10), Write::MemoryOd(0, 10)]
        );
    }

    #[test]
    fn overdrive_default_resets_to_zero() {
        let backend = FakeBackend::envelope(1);
        run(&backend, &["coreod=default", "memod=7"]);
        assert_eq!(
            backend.writes(),
            vec![Write::CoreOd(0, 0), Write::MemoryOd(0, 7)]
        );
    }

    #[test]
    fn later_overdrive_directive_wins_per_register() {
        let backend = FakeBackend::envelope(1);
        run(&backend, &["coreclk=1100", "coreod=5"]);
        assert_eq!(backend.writes(), vec![Write::CoreOd(0, 5)]);
    }

    #[test]
    fn fan_commits_before_levels() {
        let backend = FakeBackend::ranged(1);
        run(&backend, &["coreclk:0=900", "fanspeed:0=default"]);
        let writes = backend.writes();
        assert_eq!(writes[0], Write::FanDefault(0));
        assert!(matches!(writes[1], Write::Levels(0, _)));
    }

    #[test]
    fn all_selector_touches_every_device() {
        let backend = FakeBackend::envelope(2);
        run(&backend, &["coreod:all=5"]);
        assert_eq!(
            backend.writes(),
            vec![Write::CoreOd(0, 5), Write::CoreOd(1, 5)]
        );
    }
}
