use crate::backend::DeviceCaps;
use crate::directive::{Directive, ParameterKind, ValueSpec};
use crate::errors::Violation;
use crate::selector::DeviceSelection;

/// Factor by which the AMDGPU backend allows clocks above their base value.
const OVERDRIVE_HEADROOM: f64 = 1.20;

/// Largest accepted overdrive percentage.
const OVERDRIVE_LIMIT: f64 = 20.0;

/// Check every directive against the capability snapshot, collecting every
/// violation instead of stopping at the first so the user sees all problems
/// in one run. On `Err` the caller must not mutate any device.
pub fn validate(directives: &[Directive], caps: &[DeviceCaps]) -> Result<(), Vec<Violation>> {
    let device_count = caps.len();
    let mut violations = Vec::new();

    // Explicit selector bounds first; one violation per offending
    // directive, however many of its indices are bad.
    for directive in directives {
        if let DeviceSelection::Explicit(indices) = &directive.selection {
            if indices
                .iter()
                .any(|&index| index < 0 || index as usize >= device_count)
            {
                violations.push(Violation::AdapterIndex(directive.source.clone()));
            }
        }
    }

    // Fan speed: thermal controller index and percentage range are fixed,
    // independent of any device capability.
    for directive in directives {
        if directive.kind != ParameterKind::FanSpeed {
            continue;
        }
        if directive.level.resolve(1) != 0 {
            violations.push(Violation::ThermalController(directive.source.clone()));
        }
        if let ValueSpec::Value(value) = directive.value {
            if !(0.0..=100.0).contains(&value) {
                violations.push(Violation::FanSpeed(directive.source.clone()));
            }
        }
    }

    // Everything else is checked per resolved device. Indices already
    // reported above are skipped, not re-reported.
    for directive in directives {
        if directive.kind == ParameterKind::FanSpeed {
            continue;
        }
        for index in directive.selection.resolve(device_count) {
            if index < 0 || index as usize >= device_count {
                continue;
            }
            let device_caps = &caps[index as usize];

            let level = directive.level.resolve(device_caps.level_count());
            if level < 0 || level >= device_caps.level_count() {
                violations.push(Violation::PerformanceLevel(directive.source.clone()));
                continue;
            }

            let value = match directive.value {
                ValueSpec::Default => continue,
                ValueSpec::Value(value) => value,
            };

            match directive.kind {
                ParameterKind::CoreClock => {
                    let (min, max) = clock_window(device_caps, true);
                    if value < min || value > max {
                        violations.push(Violation::CoreClock(directive.source.clone()));
                    }
                }
                ParameterKind::MemoryClock => {
                    let (min, max) = clock_window(device_caps, false);
                    if value < min || value > max {
                        violations.push(Violation::MemoryClock(directive.source.clone()));
                    }
                }
                ParameterKind::Voltage => {
                    // The AMDGPU backend has no voltage interface; the
                    // directive becomes an informational no-op at apply
                    // time instead of failing the batch.
                    if let DeviceCaps::Ranged { voltage: (min, max), .. } = device_caps {
                        if value < *min || value > *max {
                            violations.push(Violation::Voltage(directive.source.clone()));
                        }
                    }
                }
                ParameterKind::CoreOverdrive => {
                    if !(0.0..=OVERDRIVE_LIMIT).contains(&value) {
                        violations.push(Violation::CoreOverdrive(directive.source.clone()));
                    }
                }
                ParameterKind::MemoryOverdrive => {
                    if !(0.0..=OVERDRIVE_LIMIT).contains(&value) {
                        violations.push(Violation::MemoryOverdrive(directive.source.clone()));
                    }
                }
                ParameterKind::FanSpeed => unreachable!(),
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Legal clock window for a device: the driver-reported range on the ADL
/// backend, or base clock through base + 20% on the AMDGPU backend.
fn clock_window(caps: &DeviceCaps, core: bool) -> (f64, f64) {
    match caps {
        DeviceCaps::Ranged {
            engine_clock,
            memory_clock,
            ..
        } => {
            if core {
                *engine_clock
            } else {
                *memory_clock
            }
        }
        DeviceCaps::Envelope {
            core_clock,
            memory_clock,
        } => {
            let base = f64::from(if core { *core_clock } else { *memory_clock });
            (base, base * OVERDRIVE_HEADROOM)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::parse_directive;

    fn ranged_caps() -> DeviceCaps {
        DeviceCaps::Ranged {
            level_count: 2,
            engine_clock: (300.0, 1200.0),
            memory_clock: (150.0, 1500.0),
            voltage: (0.8, 1.3),
        }
    }

    fn envelope_caps() -> DeviceCaps {
        DeviceCaps::Envelope {
            core_clock: 1000,
            memory_clock: 500,
        }
    }

    fn check(tokens: &[&str], caps: &[DeviceCaps]) -> Result<(), Vec<Violation>> {
        let directives: Vec<_> = tokens
            .iter()
            .map(|t| parse_directive(t).unwrap())
            .collect();
        validate(&directives, caps)
    }

    #[test]
    fn in_range_batch_passes() {
        let caps = vec![ranged_caps(), ranged_caps()];
        check(
            &["coreclk:0-1:1=900", "vcore:0=1.1", "fanspeed:all=55"],
            &caps,
        )
        .unwrap();
    }

    #[test]
    fn clock_above_reported_range() {
        let caps = vec![ranged_caps()];
        let violations = check(&["coreclk:0:1=1300"], &caps).unwrap_err();
        assert_eq!(
            violations,
            vec![Violation::CoreClock("coreclk:0:1=1300".into())]
        );
    }

    #[test]
    fn default_value_bypasses_range_checks() {
        let caps = vec![ranged_caps()];
        check(&["coreclk=default", "vcore=default", "fanspeed=default"], &caps).unwrap();
    }

    #[test]
    fn selector_out_of_range_reported_once_per_directive() {
        let caps = vec![ranged_caps()];
        let violations = check(&["coreclk:1-3=900"], &caps).unwrap_err();
        assert_eq!(
            violations,
            vec![Violation::AdapterIndex("coreclk:1-3=900".into())]
        );
    }

    #[test]
    fn all_selector_never_exceeds_device_count() {
        let caps = vec![ranged_caps()];
        check(&["coreclk:all=900"], &caps).unwrap();
    }

    #[test]
    fn explicit_level_out_of_range() {
        let caps = vec![ranged_caps()];
        let violations = check(&["memclk:0:2=800"], &caps).unwrap_err();
        assert_eq!(
            violations,
            vec![Violation::PerformanceLevel("memclk:0:2=800".into())]
        );
    }

    #[test]
    fn negative_level_out_of_range() {
        let caps = vec![ranged_caps()];
        assert!(check(&["coreclk:0:-1=900"], &caps).is_err());
    }

    #[test]
    fn fan_speed_range_and_thermal_index() {
        let caps = vec![ranged_caps()];
        let violations = check(&["fanspeed=101", "fanspeed:0:1=50"], &caps).unwrap_err();
        assert_eq!(
            violations,
            vec![
                Violation::FanSpeed("fanspeed=101".into()),
                Violation::ThermalController("fanspeed:0:1=50".into()),
            ]
        );
    }

    #[test]
    fn envelope_clock_window_is_base_plus_headroom() {
        let caps = vec![envelope_caps()];
        check(&["coreclk=1200"], &caps).unwrap();
        assert!(check(&["coreclk=1201"], &caps).is_err());
        assert!(check(&["coreclk=999"], &caps).is_err());
        check(&["memclk=600"], &caps).unwrap();
    }

    #[test]
    fn envelope_rejects_nonzero_level() {
        let caps = vec![envelope_caps()];
        assert!(check(&["coreclk:0:1=1100"], &caps).is_err());
        // The last level is level 0 here.
        check(&["coreclk=1100"], &caps).unwrap();
    }

    #[test]
    fn overdrive_percent_limits() {
        for caps in [vec![envelope_caps()], vec![ranged_caps()]] {
            check(&["coreod=20", "memod=0"], &caps).unwrap();
            assert!(check(&["coreod=21"], &caps).is_err());
            assert!(check(&["memod=-1"], &caps).is_err());
        }
    }

    #[test]
    fn voltage_checked_only_against_reported_range() {
        let violations = check(&["vcore=1.4"], &[ranged_caps()]).unwrap_err();
        assert_eq!(violations, vec![Violation::Voltage("vcore=1.4".into())]);
        // No voltage interface on the AMDGPU backend, so nothing to check.
        check(&["vcore=1.4"], &[envelope_caps()]).unwrap();
    }

    #[test]
    fn all_violations_are_collected() {
        let caps = vec![ranged_caps()];
        let violations = check(
            &["coreclk:5=900", "fanspeed=200", "memclk=2000", "vcore=1.1"],
            &caps,
        )
        .unwrap_err();
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn violation_repeated_per_resolved_device() {
        let caps = vec![ranged_caps(), ranged_caps()];
        let violations = check(&["coreclk:0-1=1300"], &caps).unwrap_err();
        assert_eq!(violations.len(), 2);
    }
}
