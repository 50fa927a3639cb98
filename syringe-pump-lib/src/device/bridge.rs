//! Boundary with the process-variable bridge: the keys the controller
//! publishes and the commands it accepts.

use std::fmt::{self, Display};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PvKey {
    Rbv,
    Val,
    Velo,
    Valve,
    Dmov,
    Status,
    Error,
    ErrorCode,
    Alarm,
    Warn,
    Running,
}

impl PvKey {
    pub fn name(self) -> &'static str {
        match self {
            PvKey::Rbv => "RBV",
            PvKey::Val => "VAL",
            PvKey::Velo => "VELO",
            PvKey::Valve => "VALVE",
            PvKey::Dmov => "DMOV",
            PvKey::Status => "STATUS",
            PvKey::Error => "ERROR",
            PvKey::ErrorCode => "ERROR_CODE",
            PvKey::Alarm => "ALARM",
            PvKey::Warn => "WARN",
            PvKey::Running => "RUNNING",
        }
    }
}

impl Display for PvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Float(f64),
    Bool(bool),
    Text(String),
    Absent,
}

impl PvValue {
    pub fn float(value: Option<f64>) -> Self {
        value.map_or(PvValue::Absent, PvValue::Float)
    }

    pub fn text(value: Option<&str>) -> Self {
        value.map_or(PvValue::Absent, |v| PvValue::Text(v.to_string()))
    }
}

impl Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Float(v) => v.fmt(f),
            PvValue::Bool(v) => v.fmt(f),
            PvValue::Text(v) => v.fmt(f),
            PvValue::Absent => "None".fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub key: PvKey,
    pub value: PvValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeValue {
    Float(f64),
    Text(String),
    Command(PumpCommand),
}

pub const DEFAULT_PRIME_CYCLES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PumpCommand {
    Abort,
    Fill,
    Empty,
    Prime { cycles: u32 },
    Flow { position: f64, speed: f64 },
}

#[derive(Error, Debug, PartialEq)]
pub enum DispatchError {
    #[error("unknown process variable '{0}'")]
    UnknownName(String),
    #[error("{name} does not accept {value:?}")]
    TypeMismatch { name: String, value: BridgeValue },
    #[error("invalid value '{value}' for {name}")]
    BadValue { name: String, value: String },
}

impl FromStr for PumpCommand {
    type Err = DispatchError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref PRIME: Regex = Regex::new(r"^prime(?::(\d+))?$").unwrap();
            static ref FLOW: Regex =
                Regex::new(r"^flow:([-+]?[0-9]*\.?[0-9]+),\s*([-+]?[0-9]*\.?[0-9]+)$").unwrap();
        }

        let bad = || DispatchError::BadValue {
            name: "CMD".to_string(),
            value: input.to_string(),
        };
        let text = input.trim().to_ascii_lowercase();

        match text.as_str() {
            "abort" => return Ok(PumpCommand::Abort),
            "fill" => return Ok(PumpCommand::Fill),
            "empty" => return Ok(PumpCommand::Empty),
            _ => {}
        }

        if let Some(c) = PRIME.captures(&text) {
            let cycles = match c.get(1) {
                Some(n) => n.as_str().parse().map_err(|_| bad())?,
                None => DEFAULT_PRIME_CYCLES,
            };
            return Ok(PumpCommand::Prime { cycles });
        }

        if let Some(c) = FLOW.captures(&text) {
            let position = c[1].parse().map_err(|_| bad())?;
            let speed = c[2].parse().map_err(|_| bad())?;
            return Ok(PumpCommand::Flow { position, speed });
        }

        Err(bad())
    }
}
