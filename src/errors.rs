use thiserror::Error;

/// A malformed selector or parameter token. Reported per offending token;
/// the run keeps scanning the remaining tokens before aborting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SyntaxError(pub String);

/// A directive that parsed but is not applicable to the live device set.
/// Violations are collected across the whole batch; one violation rejects
/// the batch before any device is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("some adapter indices are out of range in '{0}'")]
    AdapterIndex(String),

    #[error("performance level out of range in '{0}'")]
    PerformanceLevel(String),

    #[error("thermal controller index is not 0 in '{0}'")]
    ThermalController(String),

    #[error("fan speed out of range in '{0}'")]
    FanSpeed(String),

    #[error("core clock out of range in '{0}'")]
    CoreClock(String),

    #[error("memory clock out of range in '{0}'")]
    MemoryClock(String),

    #[error("voltage out of range in '{0}'")]
    Voltage(String),

    #[error("core overdrive out of range in '{0}'")]
    CoreOverdrive(String),

    #[error("memory overdrive out of range in '{0}'")]
    MemoryOverdrive(String),
}

/// Read or write failure from a hardware backend. Fatal: the remaining
/// commit phase is aborted; already-issued per-device writes stay.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("ADL library is not available")]
    AdlUnavailable,

    #[error("{0} returned ADL status {1}")]
    Adl(&'static str, i32),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Parse(String),

    #[error("no AMD adapters found")]
    NoAdapters,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
