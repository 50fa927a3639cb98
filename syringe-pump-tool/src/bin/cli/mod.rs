use clap::{Parser, Subcommand};

use syringe_pump_lib::device::{PumpCommand, DEFAULT_PRIME_CYCLES};
use syringe_pump_lib::protocol::{Orientation, SyringeVolume, Valve};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip the port busy check
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// Serial device or 'auto'
    #[clap(long, short, default_value = "auto")]
    pub port: String,

    /// Pump id reported by the identification query
    #[clap(long, short = 'i', default_value_t = 1)]
    pub pump_id: u8,

    /// UART baud rate
    #[clap(long, short, default_value_t = 9600)]
    pub baudrate: u32,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    /// Valve orientation (Y or Z), odd pump ids default to Y
    #[clap(long, short)]
    pub orientation: Option<Orientation>,

    /// Backlash compensation in motor increments
    #[clap(long, default_value_t = 100)]
    pub backlash: u32,

    /// Installed syringe size in uL
    #[clap(long, default_value = "250")]
    pub volume: SyringeVolume,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List serial ports that may host a pump
    ListPorts,

    /// Find the port of the pump with the given id
    Discover,

    /// Print the pump state
    Status,

    /// Load volume, backlash and speed, then home
    Init,

    /// Initialize the valve drive only
    InitValve,

    /// Home the plunger
    Home,

    /// Stop the current move
    Abort,

    /// Soft reset
    Reset,

    /// Move to an absolute position in uL
    Move {
        position: f64,
        #[clap(long, short)]
        speed: Option<f64>,
        /// Return without waiting for the move to finish
        #[clap(long)]
        no_wait: bool,
    },

    /// Move by a volume in uL, positive draws fluid in
    MoveRel {
        #[clap(allow_hyphen_values = true)]
        delta: f64,
        #[clap(long, short)]
        speed: Option<f64>,
        /// Return without waiting for the move to finish
        #[clap(long)]
        no_wait: bool,
    },

    /// Set the plunger speed in uL/s
    Speed {
        speed: f64,
        /// Apply to the running move
        #[clap(long)]
        on_the_fly: bool,
    },

    /// Route the valve: i, o or b
    Valve { valve: Valve },

    /// Store the syringe size, effective after power cycle
    Volume { volume: u32 },

    /// Store a new pump id
    AssignId { id: u8 },

    /// Refill the syringe from the reservoir
    Fill,

    /// Empty the syringe into the reservoir
    Empty,

    /// Empty and refill several times
    Prime {
        #[clap(default_value_t = DEFAULT_PRIME_CYCLES)]
        cycles: u32,
    },

    /// Slow move through the output port
    Flow {
        position: f64,
        speed: f64,
        /// Return without waiting for the move to finish
        #[clap(long)]
        no_wait: bool,
    },

    /// Withdraw against the closed output line
    LowPressure { delta: f64 },

    /// Run a bridge command: abort, fill, empty, prime[:N], flow:<pos>,<speed>
    Cmd { command: PumpCommand },

    /// Run the poll loop and print state updates
    Monitor {
        #[clap(long, short, default_value_t = 10)]
        seconds: u64,
    },
}
