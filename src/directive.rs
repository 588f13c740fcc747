use crate::errors::SyntaxError;
use crate::selector::DeviceSelection;

/// Metric addressed by a parameter token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    CoreClock,
    MemoryClock,
    Voltage,
    FanSpeed,
    CoreOverdrive,
    MemoryOverdrive,
}

/// Performance level (or thermal controller index, for fan speed) addressed
/// by a directive. `Last` is resolved per device at validation time against
/// the level count the backend reports; it is never a sentinel integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSpec {
    Last,
    Explicit(i32),
}

impl LevelSpec {
    /// Resolve against a device's live level count.
    pub fn resolve(self, level_count: i32) -> i32 {
        match self {
            Self::Last => level_count - 1,
            Self::Explicit(level) => level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueSpec {
    /// Restore the backend-recorded default (automatic fan control for
    /// `fanspeed`).
    Default,
    /// A finite value in the kind's physical unit (MHz, V, or percent).
    Value(f64),
}

/// One parsed parameter token, immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub kind: ParameterKind,
    pub selection: DeviceSelection,
    pub level: LevelSpec,
    pub value: ValueSpec,
    /// Original token text, echoed verbatim in diagnostics.
    pub source: String,
}

/// Whether a parameter name permits a second `:`-clause, and what it means.
enum LevelClause {
    /// Performance level; default is the device's last level.
    PerfLevel,
    /// Thermal controller index; default is 0.
    ThermalId,
    /// No level clause allowed (idle-level parameter names).
    Forbidden,
}

/// Parse one command-line token of the form
/// `name[:selector][:level]=value|default`.
pub fn parse_directive(token: &str) -> Result<Directive, SyntaxError> {
    let name_end = token
        .find([':', '='])
        .ok_or_else(|| SyntaxError(format!("'{token}' is not a parameter")))?;

    let (kind, mut level, clause) = match &token[..name_end] {
        "coreclk" => (ParameterKind::CoreClock, LevelSpec::Last, LevelClause::PerfLevel),
        "memclk" => (ParameterKind::MemoryClock, LevelSpec::Last, LevelClause::PerfLevel),
        "coreod" => (ParameterKind::CoreOverdrive, LevelSpec::Last, LevelClause::PerfLevel),
        "memod" => (ParameterKind::MemoryOverdrive, LevelSpec::Last, LevelClause::PerfLevel),
        "vcore" => (ParameterKind::Voltage, LevelSpec::Last, LevelClause::PerfLevel),
        "icoreclk" => (ParameterKind::CoreClock, LevelSpec::Explicit(0), LevelClause::Forbidden),
        "imemclk" => (ParameterKind::MemoryClock, LevelSpec::Explicit(0), LevelClause::Forbidden),
        "ivcore" => (ParameterKind::Voltage, LevelSpec::Explicit(0), LevelClause::Forbidden),
        "fanspeed" => (ParameterKind::FanSpeed, LevelSpec::Explicit(0), LevelClause::ThermalId),
        name => {
            return Err(SyntaxError(format!(
                "wrong parameter name '{name}' in '{token}'"
            )))
        }
    };

    // When no selector clause is given the directive addresses adapter 0,
    // not all adapters.
    let mut selection = DeviceSelection::Explicit(vec![0]);
    let mut rest = &token[name_end..];

    if let Some(selector_part) = rest.strip_prefix(':') {
        let end = selector_part
            .find([':', '='])
            .unwrap_or(selector_part.len());
        if end > 0 {
            selection = DeviceSelection::parse(&selector_part[..end]).map_err(|err| {
                SyntaxError(format!("bad adapter list in '{token}': {err}"))
            })?;
        }
        rest = &selector_part[end..];
    }

    if let Some(level_part) = rest.strip_prefix(':') {
        if matches!(clause, LevelClause::Forbidden) {
            return Err(SyntaxError(format!(
                "performance level is not allowed in '{token}'"
            )));
        }
        let end = level_part.find('=').unwrap_or(level_part.len());
        // An empty level clause keeps the kind's default level.
        if end > 0 {
            let parsed: i32 = level_part[..end].parse().map_err(|_| {
                SyntaxError(format!("unable to parse performance level in '{token}'"))
            })?;
            level = LevelSpec::Explicit(parsed);
        }
        rest = &level_part[end..];
    }

    let value_text = rest
        .strip_prefix('=')
        .ok_or_else(|| SyntaxError(format!("unterminated parameter '{token}'")))?;

    let value = if value_text == "default" {
        ValueSpec::Default
    } else {
        let parsed: f64 = value_text
            .parse()
            .map_err(|_| SyntaxError(format!("unable to parse value in '{token}'")))?;
        if !parsed.is_finite() {
            return Err(SyntaxError(format!("value of '{token}' is not finite")));
        }
        ValueSpec::Value(parsed)
    };

    Ok(Directive {
        kind,
        selection,
        level,
        value,
        source: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_and_value() {
        let d = parse_directive("coreclk=1000").unwrap();
        assert_eq!(d.kind, ParameterKind::CoreClock);
        assert_eq!(d.selection, DeviceSelection::Explicit(vec![0]));
        assert_eq!(d.level, LevelSpec::Last);
        assert_eq!(d.value, ValueSpec::Value(1000.0));
        assert_eq!(d.source, "coreclk=1000");
    }

    #[test]
    fn selector_and_level() {
        let d = parse_directive("coreclk:0-1:1=900").unwrap();
        assert_eq!(d.kind, ParameterKind::CoreClock);
        assert_eq!(d.selection, DeviceSelection::Explicit(vec![0, 1]));
        assert_eq!(d.level, LevelSpec::Explicit(1));
        assert_eq!(d.value, ValueSpec::Value(900.0));
    }

    #[test]
    fn empty_selector_keeps_default_adapter() {
        // "vcore::0=0.81" addresses adapter 0 at performance level 0.
        let d = parse_directive("vcore::0=0.81").unwrap();
        assert_eq!(d.kind, ParameterKind::Voltage);
        assert_eq!(d.selection, DeviceSelection::Explicit(vec![0]));
        assert_eq!(d.level, LevelSpec::Explicit(0));
        assert_eq!(d.value, ValueSpec::Value(0.81));
    }

    #[test]
    fn empty_level_keeps_last_level() {
        let d = parse_directive("memclk:2:=1250").unwrap();
        assert_eq!(d.selection, DeviceSelection::Explicit(vec![2]));
        assert_eq!(d.level, LevelSpec::Last);
    }

    #[test]
    fn all_selector() {
        let d = parse_directive("memod:all=5").unwrap();
        assert_eq!(d.kind, ParameterKind::MemoryOverdrive);
        assert_eq!(d.selection, DeviceSelection::All);
        assert_eq!(d.value, ValueSpec::Value(5.0));
    }

    #[test]
    fn fanspeed_default_value() {
        let d = parse_directive("fanspeed=default").unwrap();
        assert_eq!(d.kind, ParameterKind::FanSpeed);
        assert_eq!(d.selection, DeviceSelection::Explicit(vec![0]));
        assert_eq!(d.level, LevelSpec::Explicit(0));
        assert_eq!(d.value, ValueSpec::Default);
    }

    #[test]
    fn fanspeed_thermal_controller_clause() {
        // Parses fine; the validator rejects any index other than 0.
        let d = parse_directive("fanspeed:1:2=40").unwrap();
        assert_eq!(d.selection, DeviceSelection::Explicit(vec![1]));
        assert_eq!(d.level, LevelSpec::Explicit(2));
    }

    #[test]
    fn idle_kinds_fix_level_zero() {
        let d = parse_directive("icoreclk:1=300").unwrap();
        assert_eq!(d.kind, ParameterKind::CoreClock);
        assert_eq!(d.level, LevelSpec::Explicit(0));
        assert_eq!(d.selection, DeviceSelection::Explicit(vec![1]));
    }

    #[test]
    fn idle_kinds_reject_level_clause() {
        assert!(parse_directive("icoreclk:0:1=300").is_err());
        assert!(parse_directive("ivcore:0:0=0.8").is_err());
    }

    #[test]
    fn unknown_name() {
        assert!(parse_directive("gpuclk=900").is_err());
        assert!(parse_directive("=900").is_err());
    }

    #[test]
    fn missing_equals() {
        assert!(parse_directive("coreclk").is_err());
        assert!(parse_directive("coreclk:0").is_err());
        assert!(parse_directive("fanspeed:").is_err());
    }

    #[test]
    fn malformed_level() {
        assert!(parse_directive("coreclk:0:x=900").is_err());
    }

    #[test]
    fn negative_level_is_parsed_not_rejected() {
        // Range-checked by the validator against the live level count.
        let d = parse_directive("coreclk:0:-1=900").unwrap();
        assert_eq!(d.level, LevelSpec::Explicit(-1));
    }

    #[test]
    fn malformed_value() {
        assert!(parse_directive("coreclk=").is_err());
        assert!(parse_directive("coreclk=90x").is_err());
        assert!(parse_directive("coreclk=Default").is_err());
    }

    #[test]
    fn non_finite_value() {
        assert!(parse_directive("coreclk=inf").is_err());
        assert!(parse_directive("coreclk=NaN").is_err());
    }

    #[test]
    fn bad_selector_reports_token() {
        let err = parse_directive("coreclk:3-1=900").unwrap_err();
        assert!(err.to_string().contains("coreclk:3-1=900"));
    }
}
