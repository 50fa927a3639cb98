//! Cavro Centris ASCII command dialect.
//!
//! A command is `/` + pump address + program text + execute character + `\r`.
//! `R` runs the program once the previous one has finished, `F` applies it on
//! the fly while the plunger is still moving. A few status queries are sent
//! without any execute character.

mod reply;

pub use reply::{
    convert_error_code, decode, encode_reply, parse_pump_id, Reply, StatusInfo, LOCAL_REJECT_CODE,
    MALFORMED_REPLY, NO_DEVICE, REPLY_PREFIX, REPLY_SUFFIX,
};

use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_ADDRESS: u8 = 1;

/// Plunger speed used by the homing program, uL/s.
pub const HOME_SPEED: f64 = 25.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid valve '{0}', expected one of i, o, b")]
    BadValve(String),
    #[error("invalid orientation '{0}', expected Y or Z")]
    BadOrientation(String),
    #[error("unsupported syringe volume '{0}', expected one of 50, 100, 250, 500")]
    BadVolume(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Valve {
    In,
    Out,
    Bypass,
}

impl Valve {
    pub fn as_char(self) -> char {
        match self {
            Valve::In => 'i',
            Valve::Out => 'o',
            Valve::Bypass => 'b',
        }
    }

    fn command(self) -> char {
        self.as_char().to_ascii_uppercase()
    }

    /// Interprets the payload of a valve query.
    pub fn from_reply(value: &str) -> Option<Self> {
        value
            .trim()
            .chars()
            .next()
            .and_then(|c| Self::from_char(c.to_ascii_lowercase()))
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Valve::In),
            'o' => Some(Valve::Out),
            'b' => Some(Valve::Bypass),
            _ => None,
        }
    }
}

impl Display for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_char().fmt(f)
    }
}

impl FromStr for Valve {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut chars = input.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c.to_ascii_lowercase()),
            _ => None,
        }
        .ok_or_else(|| ParseError::BadValve(input.to_string()))
    }
}

/// Valve handedness. `Y` pumps take input on the right, `Z` pumps on the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Y = 0,
    Z = 1,
}

static INIT_PROGRAMS: [&str; 2] = ["Y7,0,0", "Z7,0,0"];

impl Orientation {
    /// Odd pump ids are mounted as `Y`, even ones as `Z`.
    pub fn for_pump(pump_id: u8) -> Self {
        if pump_id % 2 == 1 {
            Orientation::Y
        } else {
            Orientation::Z
        }
    }

    pub fn init_program(self) -> &'static str {
        INIT_PROGRAMS[self as usize]
    }
}

impl Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Orientation::Y => "Y".fmt(f),
            Orientation::Z => "Z".fmt(f),
        }
    }
}

impl FromStr for Orientation {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "Y" | "y" => Ok(Orientation::Y),
            "Z" | "z" => Ok(Orientation::Z),
            _ => Err(ParseError::BadOrientation(input.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyringeVolume {
    Ul50,
    Ul100,
    Ul250,
    Ul500,
}

impl SyringeVolume {
    pub const SUPPORTED: [u32; 4] = [50, 100, 250, 500];

    pub fn microliters(self) -> u32 {
        match self {
            SyringeVolume::Ul50 => 50,
            SyringeVolume::Ul100 => 100,
            SyringeVolume::Ul250 => 250,
            SyringeVolume::Ul500 => 500,
        }
    }

    /// Full plunger stroke in uL.
    pub fn stroke(self) -> f64 {
        f64::from(self.microliters())
    }

    fn command(self) -> &'static str {
        match self {
            SyringeVolume::Ul50 => "U93",
            SyringeVolume::Ul100 => "U94",
            SyringeVolume::Ul250 => "U90",
            SyringeVolume::Ul500 => "U95",
        }
    }
}

impl TryFrom<u32> for SyringeVolume {
    type Error = ParseError;

    fn try_from(volume: u32) -> Result<Self, Self::Error> {
        match volume {
            50 => Ok(SyringeVolume::Ul50),
            100 => Ok(SyringeVolume::Ul100),
            250 => Ok(SyringeVolume::Ul250),
            500 => Ok(SyringeVolume::Ul500),
            _ => Err(ParseError::BadVolume(volume.to_string())),
        }
    }
}

impl FromStr for SyringeVolume {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        input
            .trim()
            .parse::<u32>()
            .map_err(|_| ParseError::BadVolume(input.to_string()))
            .and_then(Self::try_from)
    }
}

impl Display for SyringeVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.microliters().fmt(f)
    }
}

/// Rounds to the 3 decimals the pump displays.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Shortest decimal text with at least one fractional digit: `25.0`, `12.346`.
pub fn format_number(value: f64) -> String {
    let rounded = round3(value);
    let text = rounded.to_string();
    if text.contains('.') || !rounded.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame(Vec<u8>);

impl CommandFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        String::from_utf8_lossy(&self.0).escape_debug().fmt(f)
    }
}

/// Assembles one command program for a single pump address.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    buffer: String,
}

impl FrameBuilder {
    pub fn new(address: u8) -> Self {
        Self {
            buffer: format!("/{}", address),
        }
    }

    pub fn raw(mut self, program: &str) -> Self {
        self.buffer.push_str(program);
        self
    }

    pub fn velocity(self, speed: f64) -> Self {
        let text = format!("V{},1", format_number(speed));
        self.raw(&text)
    }

    pub fn move_abs(self, position: f64) -> Self {
        let text = format!("A{},1", format_number(position));
        self.raw(&text)
    }

    pub fn aspirate(self, volume: f64) -> Self {
        let text = format!("P{},1", format_number(volume));
        self.raw(&text)
    }

    pub fn dispense(self, volume: f64) -> Self {
        let text = format!("D{},1", format_number(volume));
        self.raw(&text)
    }

    pub fn backlash(self, increments: u32) -> Self {
        let text = format!("K{}", increments);
        self.raw(&text)
    }

    pub fn valve(mut self, valve: Valve) -> Self {
        self.buffer.push(valve.command());
        self
    }

    pub fn execute(self) -> CommandFrame {
        self.terminate("R")
    }

    pub fn on_the_fly(self) -> CommandFrame {
        self.terminate("F")
    }

    /// Terminates without an execute character (plain status queries).
    pub fn finish(self) -> CommandFrame {
        self.terminate("")
    }

    fn terminate(mut self, execute: &str) -> CommandFrame {
        self.buffer.push_str(execute);
        self.buffer.push('\r');
        CommandFrame(self.buffer.into_bytes())
    }
}

pub fn move_absolute(address: u8, position: f64) -> CommandFrame {
    FrameBuilder::new(address).move_abs(position).execute()
}

pub fn move_with_speed(address: u8, position: f64, speed: f64) -> CommandFrame {
    FrameBuilder::new(address)
        .velocity(speed)
        .move_abs(position)
        .execute()
}

/// Relative move in uL, positive draws fluid in. `J2`/`J0` toggle the
/// auxiliary output around the move.
pub fn move_relative(address: u8, delta: f64, speed: f64) -> CommandFrame {
    let builder = FrameBuilder::new(address).raw("J2").velocity(speed);
    let builder = if delta < 0.0 {
        builder.dispense(delta.abs())
    } else {
        builder.aspirate(delta)
    };
    builder.raw("J0").execute()
}

pub fn set_velocity(address: u8, speed: f64, on_the_fly: bool) -> CommandFrame {
    let builder = FrameBuilder::new(address).velocity(speed);
    if on_the_fly {
        builder.on_the_fly()
    } else {
        builder.execute()
    }
}

pub fn set_backlash(address: u8, increments: u32) -> CommandFrame {
    FrameBuilder::new(address).backlash(increments).execute()
}

pub fn set_valve(address: u8, valve: Valve) -> CommandFrame {
    FrameBuilder::new(address).valve(valve).execute()
}

pub fn assign_volume(address: u8, volume: SyringeVolume) -> CommandFrame {
    FrameBuilder::new(address).raw(volume.command()).execute()
}

pub fn initialize(address: u8, orientation: Orientation) -> CommandFrame {
    FrameBuilder::new(address)
        .raw(orientation.init_program())
        .execute()
}

/// Stores the pump id in non-volatile memory.
pub fn assign_pump_id(address: u8, pump_id: u8) -> CommandFrame {
    let text = format!("s0ZA{}", pump_id);
    FrameBuilder::new(address).raw(&text).execute()
}

/// Initializes the valve drive, routes the valve to input, loads the homing
/// speed and backlash, and parks the plunger at zero, all as one program.
pub fn home(address: u8, orientation: Orientation, backlash: u32) -> CommandFrame {
    FrameBuilder::new(address)
        .raw(orientation.init_program())
        .valve(Valve::In)
        .velocity(HOME_SPEED)
        .backlash(backlash)
        .move_abs(0.0)
        .execute()
}

pub fn query_position(address: u8) -> CommandFrame {
    FrameBuilder::new(address).raw("?18").finish()
}

pub fn query_velocity(address: u8) -> CommandFrame {
    FrameBuilder::new(address).raw("?37").finish()
}

pub fn query_valve(address: u8) -> CommandFrame {
    FrameBuilder::new(address).raw("?20").execute()
}

pub fn query_busy(address: u8) -> CommandFrame {
    FrameBuilder::new(address).raw("?29").execute()
}

pub fn query_identity(address: u8) -> CommandFrame {
    FrameBuilder::new(address).raw("?80").finish()
}

/// Terminates plunger moves and initialization, valve moves are unaffected.
pub fn abort(address: u8) -> CommandFrame {
    FrameBuilder::new(address).raw("T").execute()
}

pub fn reset(address: u8) -> CommandFrame {
    FrameBuilder::new(address).raw("!").execute()
}
