pub mod cli;

use std::io;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, shells::Bash};
use json::JsonValue;
use log::{error, info};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout_at, Instant};

use syringe_pump_lib::device::{BridgeValue, PumpConfig, PumpController, StateUpdate};
use syringe_pump_lib::port::{self, PortSettings};
use syringe_pump_lib::protocol::{Orientation, Reply, LOCAL_REJECT_CODE};

use cli::{Cli, Commands};

enum OutputFormat {
    Plain,
    Json,
}

fn slice_to_column(data: &[String]) -> String {
    data.join("\n")
}

fn reply_to_string(reply: &Reply, fmt: &OutputFormat) -> String {
    match fmt {
        OutputFormat::Plain => format!(
            "value={} error_code={} busy={} error={}",
            reply.value.as_deref().unwrap_or("None"),
            reply
                .error_code_char()
                .map_or("None".to_string(), |c| c.to_string()),
            reply.busy.map_or("None".to_string(), |b| b.to_string()),
            reply.error.as_deref().unwrap_or("None"),
        ),
        OutputFormat::Json => {
            let mut obj = JsonValue::new_object();
            obj["value"] = reply.value.clone().into();
            obj["error_code"] = reply.error_code_char().map(|c| c.to_string()).into();
            obj["busy"] = reply.busy.into();
            obj["error"] = reply.error.clone().into();
            json::stringify(obj)
        }
    }
}

/// Fails on replies that never reached the pump or came back garbled.
fn check_reply(reply: Reply, fmt: &OutputFormat) -> Result<String> {
    if reply.error_code == Some(LOCAL_REJECT_CODE) || reply.error_code.is_none() {
        return Err(anyhow!(
            "{}",
            reply.error.unwrap_or_else(|| "no reply".to_string())
        ));
    }
    Ok(reply_to_string(&reply, fmt))
}

fn update_to_string(update: &StateUpdate, fmt: &OutputFormat) -> String {
    match fmt {
        OutputFormat::Plain => format!("{} = {}", update.key, update.value),
        OutputFormat::Json => {
            let mut obj = JsonValue::new_object();
            obj["key"] = update.key.name().into();
            obj["value"] = update.value.to_string().into();
            json::stringify(obj)
        }
    }
}

fn port_settings(cli: &Cli) -> PortSettings {
    PortSettings {
        baudrate: cli.baudrate,
        ..PortSettings::default()
    }
}

fn pump_config(cli: &Cli) -> PumpConfig {
    PumpConfig {
        orientation: cli
            .orientation
            .unwrap_or_else(|| Orientation::for_pump(cli.pump_id)),
        backlash: cli.backlash,
        syringe_volume: cli.volume.microliters(),
        ..PumpConfig::for_pump(cli.pump_id)
    }
}

async fn open_controller(cli: &Cli) -> Result<PumpController> {
    let config = pump_config(cli);
    let settings = port_settings(cli);

    if cli.port == "auto" {
        PumpController::discover(config, &settings)
            .await
            .with_context(|| format!("Failed to find pump {}", cli.pump_id))
    } else {
        PumpController::open(&cli.port, config, &settings, cli.force)
            .with_context(|| format!("Failed to open {}", cli.port))
    }
}

fn cmd_list_ports(fmt: OutputFormat) -> Result<String> {
    let ports = port::candidate_ports()?;
    Ok(match fmt {
        OutputFormat::Plain => slice_to_column(&ports),
        OutputFormat::Json => json::stringify(ports),
    })
}

async fn cmd_discover(cli: &Cli, fmt: OutputFormat) -> Result<String> {
    let found = port::discover(
        cli.pump_id,
        pump_config(cli).address,
        &port_settings(cli),
    )
    .await?;
    found.transport.close().await;

    Ok(match fmt {
        OutputFormat::Plain => found.port_name,
        OutputFormat::Json => json::stringify(found.port_name),
    })
}

async fn cmd_status(pump: &PumpController, fmt: OutputFormat) -> Result<String> {
    pump.run_once().await;
    let speed = pump.get_speed().await;
    let valve = pump.get_valve().await;
    let identity = pump.driver().identify().await;
    let state = pump.snapshot().await;
    let done = pump.is_done_moving().await;
    let alarm = pump.alarm().await;
    let warning = pump.warning().await;

    Ok(match fmt {
        OutputFormat::Plain => {
            let mut lines = vec![
                format!("pump id: {}", state.pump_id),
                format!("identity: {}", identity.value.as_deref().unwrap_or("None")),
                format!(
                    "position: {} (commanded {})",
                    state
                        .measured_position
                        .map_or("None".to_string(), |p| p.to_string()),
                    state.commanded_position
                ),
                format!(
                    "speed: {}",
                    speed.map_or("None".to_string(), |s| s.to_string())
                ),
                format!("valve: {}", valve.map_or("None".to_string(), |v| v.to_string())),
                format!(
                    "busy: {}",
                    state.busy.map_or("None".to_string(), |b| b.to_string())
                ),
                format!(
                    "done moving: {}",
                    done.map_or("None".to_string(), |d| d.to_string())
                ),
                format!(
                    "error: {} ({})",
                    state.last_error.as_deref().unwrap_or("None"),
                    state
                        .last_error_code
                        .map_or("None".to_string(), |c| char::from(c).to_string())
                ),
            ];
            if !alarm.is_empty() {
                lines.push(format!("alarm: {}", alarm));
            } else if !warning.is_empty() {
                lines.push(format!("warning: {}", warning));
            }
            slice_to_column(&lines)
        }
        OutputFormat::Json => {
            let mut obj = JsonValue::new_object();
            obj["pump_id"] = state.pump_id.into();
            obj["identity"] = identity.value.into();
            obj["position"] = state.measured_position.into();
            obj["commanded_position"] = state.commanded_position.into();
            obj["speed"] = speed.into();
            obj["valve"] = valve.map(|v| v.to_string()).into();
            obj["busy"] = state.busy.into();
            obj["done_moving"] = done.into();
            obj["error"] = state.last_error.into();
            obj["error_code"] = state
                .last_error_code
                .map(|c| char::from(c).to_string())
                .into();
            obj["alarm"] = alarm.into();
            obj["warning"] = warning.into();
            json::stringify(obj)
        }
    })
}

async fn cmd_position(pump: &PumpController, fmt: OutputFormat) -> Result<String> {
    let position = pump
        .get_position()
        .await
        .ok_or(anyhow!("Failed to read position back"))?;
    Ok(match fmt {
        OutputFormat::Plain => position.to_string(),
        OutputFormat::Json => json::stringify(position),
    })
}

async fn cmd_abort(pump: &PumpController, fmt: OutputFormat) -> Result<String> {
    let outcome = pump.abort().await;
    if outcome.timed_out {
        return Err(anyhow!("pump still busy after abort"));
    }
    check_reply(outcome.reply, &fmt)
}

async fn cmd_monitor(pump: PumpController, seconds: u64, fmt: OutputFormat) -> Result<String> {
    let pump = std::sync::Arc::new(pump);
    let mut updates = pump.subscribe();
    pump.start();

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while let Ok(received) = timeout_at(deadline, updates.recv()).await {
        match received {
            Ok(update) => println!("{}", update_to_string(&update, &fmt)),
            Err(RecvError::Lagged(n)) => info!("skipped {} updates", n),
            Err(RecvError::Closed) => break,
        }
    }

    pump.close().await;
    Ok(String::default())
}

async fn run_command(cli: Cli, pump: PumpController, fmt: OutputFormat) -> Result<String> {
    let keep_moving = matches!(
        cli.command,
        Commands::Move { no_wait: true, .. }
            | Commands::MoveRel { no_wait: true, .. }
            | Commands::Flow { no_wait: true, .. }
    );

    let result = match cli.command {
        Commands::Status => cmd_status(&pump, fmt).await,
        Commands::Init => {
            let reply = pump.init().await;
            pump.wait().await;
            check_reply(reply, &fmt)
        }
        Commands::InitValve => {
            let reply = pump.driver().initialize(pump.config().orientation).await;
            pump.wait().await;
            check_reply(reply, &fmt)
        }
        Commands::Home => {
            let reply = pump.home().await;
            pump.wait().await;
            check_reply(reply, &fmt)
        }
        Commands::Abort => cmd_abort(&pump, fmt).await,
        Commands::Reset => check_reply(pump.reset().await, &fmt),
        Commands::Move {
            position,
            speed,
            no_wait,
        } => {
            check_reply(pump.move_abs(position, speed).await, &fmt)?;
            if !no_wait {
                pump.wait().await;
            }
            cmd_position(&pump, fmt).await
        }
        Commands::MoveRel {
            delta,
            speed,
            no_wait,
        } => {
            check_reply(pump.move_rel(delta, speed).await, &fmt)?;
            if !no_wait {
                pump.wait().await;
            }
            cmd_position(&pump, fmt).await
        }
        Commands::Speed { speed, on_the_fly } => {
            let reply = if on_the_fly {
                pump.set_speed_on_the_fly(speed).await
            } else {
                pump.set_speed(speed).await
            };
            check_reply(reply, &fmt)
        }
        Commands::Valve { valve } => check_reply(pump.set_valve(valve).await, &fmt),
        Commands::Volume { volume } => check_reply(pump.assign_volume(volume).await, &fmt),
        Commands::AssignId { id } => {
            check_reply(pump.driver().assign_pump_id(id).await, &fmt)
        }
        Commands::Fill => {
            pump.fill().await;
            cmd_position(&pump, fmt).await
        }
        Commands::Empty => {
            pump.empty().await;
            cmd_position(&pump, fmt).await
        }
        Commands::Prime { cycles } => {
            pump.prime(cycles).await;
            cmd_position(&pump, fmt).await
        }
        Commands::Flow {
            position,
            speed,
            no_wait,
        } => {
            let reply = pump.flow(position, speed).await.ok_or(anyhow!(
                "flow speed {} above limit {}",
                speed,
                pump.config().flow_speed_high_limit
            ))?;
            check_reply(reply, &fmt)?;
            if !no_wait {
                pump.wait().await;
            }
            cmd_position(&pump, fmt).await
        }
        Commands::LowPressure { delta } => {
            pump.create_low_pressure(delta).await;
            cmd_position(&pump, fmt).await
        }
        Commands::Cmd { command } => pump
            .dispatch("CMD", BridgeValue::Command(command))
            .await
            .map(|_| String::new())
            .map_err(|e| e.into()),
        Commands::Monitor { seconds } => return cmd_monitor(pump, seconds, fmt).await,
        _ => Err(anyhow!("unexpected command (this is a bug!)")),
    };

    // closing aborts, so a move left running is not closed
    if !keep_moving {
        pump.close().await;
    }
    result
}

async fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut cli::Cli::command(),
            "syringe-pump-tool",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    match cli.command {
        Commands::ListPorts => cmd_list_ports(fmt),
        Commands::Discover => cmd_discover(&cli, fmt).await,
        _ => {
            let pump = open_controller(&cli).await?;
            run_command(cli, pump, fmt).await
        }
    }
}

#[tokio::main]
async fn main() {
    match do_main().await {
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}
