/// Core types shared by the opcode stress worker
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Code generation strategy used to fill the arena before each generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Method {
    /// Uniformly random 32-bit words
    #[default]
    #[serde(rename = "random")]
    Random,
    /// The execution counter replicated slot by slot
    #[serde(rename = "inc", alias = "incrementing")]
    Incrementing,
    /// Counter and random values with their inverted/gray/reversed forms
    #[serde(rename = "mixed")]
    Mixed,
    /// A copy of this program's own code with sparse bit flips
    #[serde(rename = "text", alias = "mutated-text")]
    MutatedText,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Random,
        Method::MutatedText,
        Method::Incrementing,
        Method::Mixed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::Random => "random",
            Method::Incrementing => "inc",
            Method::Mixed => "mixed",
            Method::MutatedText => "text",
        }
    }

    /// Space separated list of accepted method names, for error messages.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = OpcodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "random" => Ok(Method::Random),
            "inc" | "incrementing" => Ok(Method::Incrementing),
            "mixed" => Ok(Method::Mixed),
            "text" | "mutated-text" => Ok(Method::MutatedText),
            other => Err(OpcodeError::Config(format!(
                "opcode-method '{}' must be one of: {}",
                other,
                Method::valid_names()
            ))),
        }
    }
}

/// Worker configuration consumed from the harness
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcodeConfig {
    /// Generation method
    pub method: Method,
    /// Index of this worker among its siblings
    pub instance: u32,
    /// Total number of sibling workers
    pub instances: u32,
    /// Stop after this many generations (0 = unbounded)
    pub max_ops: u64,
    /// Stop after this many seconds
    pub timeout_secs: Option<u64>,
    /// Count fatal signals per signal number in a shared page
    pub track_signals: bool,
    /// Transient fork failures tolerated back to back before giving up
    pub fork_retries: u32,
    /// Watchdog period for runaway generated code
    pub watchdog_interval_ms: u64,
}

impl Default for OpcodeConfig {
    fn default() -> Self {
        Self {
            method: Method::Random,
            instance: 0,
            instances: 1,
            max_ops: 0,
            timeout_secs: None,
            track_signals: false,
            fork_retries: 1000,
            watchdog_interval_ms: 50,
        }
    }
}

impl OpcodeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OpcodeError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: OpcodeConfig = serde_json::from_str(&content)
            .map_err(|e| OpcodeError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on settings the worker cannot honour.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.instances == 0 {
            errors.push("instances must be at least 1".to_string());
        } else if self.instance >= self.instances {
            errors.push(format!(
                "instance index {} out of range for {} instances",
                self.instance, self.instances
            ));
        }
        if self.watchdog_interval_ms == 0 {
            errors.push("watchdog_interval_ms must be non-zero".to_string());
        }
        if self.watchdog_interval_ms >= 1000 {
            // setitimer's usec field must stay below one second
            errors.push("watchdog_interval_ms must be below 1000".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OpcodeError::Config(errors.join("; ")))
        }
    }
}

/// Worker-level result reported back to the harness
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StressExit {
    Success,
    Failure,
    /// Resources could not be set up; the harness skips the worker
    NoResource,
    /// Host lacks the sandboxing primitives this worker needs
    NotImplemented,
}

impl From<StressExit> for i32 {
    fn from(exit: StressExit) -> i32 {
        match exit {
            StressExit::Success => 0,
            StressExit::Failure => 1,
            StressExit::NoResource => 3,
            StressExit::NotImplemented => 4,
        }
    }
}

impl StressExit {
    /// Inverse of the `i32` conversion, for exit statuses of forked workers.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(StressExit::Success),
            1 => Some(StressExit::Failure),
            3 => Some(StressExit::NoResource),
            4 => Some(StressExit::NotImplemented),
            _ => None,
        }
    }
}

impl fmt::Display for StressExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressExit::Success => write!(f, "success"),
            StressExit::Failure => write!(f, "failure"),
            StressExit::NoResource => write!(f, "no_resource"),
            StressExit::NotImplemented => write!(f, "not_implemented"),
        }
    }
}

/// Custom error types for the opcode worker
#[derive(Error, Debug)]
pub enum OpcodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Privilege error: {0}")]
    Privilege(String),
}

impl From<nix::errno::Errno> for OpcodeError {
    fn from(err: nix::errno::Errno) -> Self {
        OpcodeError::Process(err.to_string())
    }
}

/// Result type alias for opcode worker operations
pub type Result<T> = std::result::Result<T, OpcodeError>;
