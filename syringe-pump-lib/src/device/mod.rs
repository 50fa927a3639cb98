//! Stateful pump controller.
//!
//! Tracks commanded against measured position, valve, busy and error state,
//! runs the compound actions (fill, empty, prime, flow, low pressure) on top
//! of the atomic driver, and republishes state to the process-variable bridge.
//! Every `PumpState` mutation happens inside a short critical section, the
//! state lock is never held across a pump exchange.

mod bridge;
mod config;
mod state;

pub use bridge::{
    BridgeValue, DispatchError, PumpCommand, PvKey, PvValue, StateUpdate, DEFAULT_PRIME_CYCLES,
};
pub use config::PumpConfig;
pub use state::{MotionState, PumpState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::driver::PumpDriver;
use crate::port::{self, PortSettings};
use crate::protocol::{round3, Reply, Valve, HOME_SPEED};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Result of [`PumpController::abort`]. `timed_out` means the pump never
/// reported idle, it may still be moving.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortOutcome {
    pub reply: Reply,
    pub timed_out: bool,
}

pub struct PumpController {
    driver: PumpDriver,
    config: PumpConfig,
    state: Mutex<PumpState>,
    updates: broadcast::Sender<StateUpdate>,
    running: AtomicBool,
    poller: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PumpController {
    pub fn new(driver: PumpDriver, config: PumpConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            driver,
            state: Mutex::new(PumpState::new(&config)),
            config,
            updates,
            running: AtomicBool::new(false),
            poller: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Probes every candidate port for `config.pump_id`.
    pub async fn discover(config: PumpConfig, settings: &PortSettings) -> Result<Self> {
        let found = port::discover(config.pump_id, config.address, settings).await?;
        info!("pump {} bound to {}", config.pump_id, found.port_name);
        let driver = PumpDriver::new(found.transport, config.address);
        Ok(Self::new(driver, config))
    }

    pub fn open(
        port_name: &str,
        config: PumpConfig,
        settings: &PortSettings,
        force: bool,
    ) -> Result<Self> {
        let transport = port::open_port(port_name, settings, force)?;
        let driver = PumpDriver::new(transport, config.address);
        Ok(Self::new(driver, config))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> PumpState {
        self.state.lock().await.clone()
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    pub fn driver(&self) -> &PumpDriver {
        &self.driver
    }

    fn publish(&self, key: PvKey, value: PvValue) {
        // no subscribers is not an error
        let _ = self.updates.send(StateUpdate { key, value });
    }

    async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PumpState) -> R,
    {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    async fn set_status(&self, status: &str) {
        self.update(|s| s.status = status.to_string()).await;
        self.publish(PvKey::Status, PvValue::Text(status.to_string()));
    }

    /// Records the error fields of `reply`. Busy is left to [`Self::get_busy`].
    async fn process_reply(&self, reply: &Reply) {
        self.update(|s| {
            s.last_error = reply.error.clone();
            s.last_error_code = reply.error_code;
        })
        .await;

        if reply.error_code.is_none() || reply.busy.is_none() {
            warn!("unexpected reply {:?}", reply);
        }
        self.publish(PvKey::Error, PvValue::text(reply.error.as_deref()));
        self.publish(
            PvKey::ErrorCode,
            PvValue::text(reply.error_code_char().map(String::from).as_deref()),
        );
    }

    async fn start_motion(&self, position: f64) {
        let fast = self.config.fast_scan_period;
        self.update(|s| {
            s.commanded_position = position;
            s.motion = MotionState::Moving;
            s.scan_period = fast;
        })
        .await;
        self.publish(PvKey::Val, PvValue::Float(position));
    }

    /// Loads volume, backlash and speed, then homes the pump and polls once.
    pub async fn init(&self) -> Reply {
        info!(
            "initializing pump {} ({} uL, orientation {}, backlash {})",
            self.config.pump_id,
            self.config.syringe_volume,
            self.config.orientation,
            self.config.backlash
        );
        let reply = self.driver.assign_volume(self.config.syringe_volume).await;
        self.process_reply(&reply).await;
        let reply = self.driver.set_backlash(self.config.backlash).await;
        self.process_reply(&reply).await;
        self.set_speed_on_the_fly(self.config.initial_speed).await;

        let reply = self.home().await;
        self.run_once().await;
        reply
    }

    pub async fn get_position(&self) -> Option<f64> {
        let reply = self.driver.get_position().await;
        self.process_reply(&reply).await;

        let position = reply.number();
        if let Some(position) = position {
            self.update(|s| s.measured_position = Some(position)).await;
        }
        self.publish(PvKey::Rbv, PvValue::float(position));
        position
    }

    /// `commanded_position` is updated before the move goes out.
    pub async fn set_cmd_position(&self, position: f64) -> Reply {
        self.start_motion(position).await;
        let reply = self.driver.set_position(position).await;
        self.process_reply(&reply).await;
        reply
    }

    /// Aborts the current move, then moves to `position`. Without `speed` the
    /// commanded speed is used.
    pub async fn move_abs(&self, position: f64, speed: Option<f64>) -> Reply {
        let reply = self.driver.abort().await;
        self.process_reply(&reply).await;

        let speed = match speed {
            Some(speed) => speed,
            None => self.state.lock().await.commanded_speed,
        };
        self.start_motion(position).await;
        self.update(|s| s.commanded_speed = speed).await;
        self.publish(PvKey::Velo, PvValue::Float(speed));

        let reply = self.driver.move_abs(position, speed).await;
        self.process_reply(&reply).await;
        reply
    }

    /// Moves by `delta` uL from the position read back after aborting,
    /// positive draws fluid in.
    pub async fn move_rel(&self, delta: f64, speed: Option<f64>) -> Reply {
        let reply = self.driver.abort().await;
        self.process_reply(&reply).await;

        let measured = self.get_position().await;
        let (base, speed) = {
            let s = self.state.lock().await;
            (
                measured.unwrap_or(s.commanded_position),
                speed.unwrap_or(s.commanded_speed),
            )
        };
        self.start_motion(round3(base + delta)).await;

        let reply = self.driver.move_rel(delta, speed).await;
        self.process_reply(&reply).await;
        reply
    }

    pub async fn get_speed(&self) -> Option<f64> {
        let reply = self.driver.get_speed().await;
        self.process_reply(&reply).await;

        let speed = reply.number();
        if let Some(speed) = speed {
            self.update(|s| s.commanded_speed = speed).await;
            self.publish(PvKey::Velo, PvValue::Float(speed));
        }
        speed
    }

    async fn commit_speed(&self, speed: f64) {
        let fast = self.config.fast_scan_period;
        self.update(|s| {
            s.commanded_speed = speed;
            s.scan_period = fast;
        })
        .await;
        self.publish(PvKey::Velo, PvValue::Float(speed));
    }

    /// Queued speed change. Aborts the current move first.
    pub async fn set_speed(&self, speed: f64) -> Reply {
        let reply = self.driver.set_speed(speed, false).await;
        self.process_reply(&reply).await;
        self.commit_speed(speed).await;
        reply
    }

    /// Changes the speed of the running move. Not clamped here, see
    /// [`PumpDriver::set_speed`] for the hardware ceiling.
    pub async fn set_speed_on_the_fly(&self, speed: f64) -> Reply {
        let reply = self.driver.set_speed_on_the_fly(speed).await;
        self.process_reply(&reply).await;
        self.commit_speed(speed).await;
        reply
    }

    /// Reads the valve back. The tracked valve state is left alone.
    pub async fn get_valve(&self) -> Option<Valve> {
        let reply = self.driver.get_valve().await;
        self.process_reply(&reply).await;
        reply.value.as_deref().and_then(Valve::from_reply)
    }

    pub async fn set_valve(&self, valve: Valve) -> Reply {
        let reply = self.driver.set_valve(valve).await;
        self.process_reply(&reply).await;

        let fast = self.config.fast_scan_period;
        self.update(|s| {
            s.valve = valve;
            s.scan_period = fast;
        })
        .await;
        self.publish(PvKey::Valve, PvValue::Text(valve.to_string()));

        sleep(self.config.valve_settle).await;
        reply
    }

    /// Queries busy. An idle answer ends any move or homing in progress and
    /// relaxes the scan period.
    pub async fn get_busy(&self) -> Option<bool> {
        let reply = self.driver.busy().await;
        self.process_reply(&reply).await;

        let busy = reply.busy;
        let idle = self.config.idle_scan_period;
        self.update(|s| {
            s.busy = busy;
            if busy == Some(false) {
                if matches!(s.motion, MotionState::Moving | MotionState::Homing) {
                    s.motion = MotionState::Idle;
                }
                s.scan_period = idle;
            }
        })
        .await;
        busy
    }

    pub async fn is_done_moving(&self) -> Option<bool> {
        self.state.lock().await.done_moving(self.config.done_epsilon)
    }

    pub async fn alarm(&self) -> String {
        self.state.lock().await.low_level(self.config.low_level_alarm)
    }

    pub async fn warning(&self) -> String {
        self.state
            .lock()
            .await
            .low_level(self.config.low_level_warning)
    }

    /// Runs the homing program. On a well-formed reply the commanded position
    /// becomes 0.0 and the speed the homing speed.
    pub async fn home(&self) -> Reply {
        let fast = self.config.fast_scan_period;
        let previous = self
            .update(|s| {
                s.scan_period = fast;
                std::mem::replace(&mut s.motion, MotionState::Homing)
            })
            .await;
        self.set_status("homing...").await;

        let reply = self
            .driver
            .home(self.config.orientation, self.config.backlash)
            .await;
        self.process_reply(&reply).await;

        if reply.is_well_formed() {
            self.update(|s| {
                s.commanded_position = 0.0;
                s.commanded_speed = HOME_SPEED;
            })
            .await;
            self.publish(PvKey::Val, PvValue::Float(0.0));
            self.publish(PvKey::Velo, PvValue::Float(HOME_SPEED));
            self.set_status("homing complete").await;
        } else {
            warn!("homing failed: {:?}", reply.error);
            self.update(|s| s.motion = previous).await;
            self.set_status("homing failed").await;
        }
        reply
    }

    /// Stops the plunger and polls until the pump reports idle or the abort
    /// timeout passes. Always ends `Idle`.
    pub async fn abort(&self) -> AbortOutcome {
        self.update(|s| s.motion = MotionState::Aborting).await;
        self.set_status("aborting...").await;

        let reply = self.driver.abort().await;
        self.process_reply(&reply).await;

        let deadline = Instant::now() + self.config.abort_timeout;
        let timed_out = loop {
            if self.get_busy().await == Some(false) {
                break false;
            }
            if Instant::now() >= deadline {
                break true;
            }
            sleep(self.config.abort_poll_interval).await;
        };

        self.update(|s| s.motion = MotionState::Idle).await;
        if timed_out {
            warn!(
                "pump {} still busy {:?} after abort",
                self.config.pump_id, self.config.abort_timeout
            );
            self.set_status("abort timed out").await;
        } else {
            self.set_status("aborted").await;
        }
        AbortOutcome { reply, timed_out }
    }

    pub async fn reset(&self) -> Reply {
        let reply = self.driver.reset().await;
        self.process_reply(&reply).await;
        self.update(|s| s.motion = MotionState::Idle).await;
        reply
    }

    /// Takes effect after a power cycle, the tracked syringe size is kept.
    pub async fn assign_volume(&self, volume: u32) -> Reply {
        let reply = self.driver.assign_volume(volume).await;
        self.process_reply(&reply).await;
        reply
    }

    pub async fn wait(&self) {
        self.wait_every(self.config.wait_poll_interval).await
    }

    /// Polls busy every `poll_interval` until the pump reports idle. An
    /// indeterminate answer keeps waiting. Unbounded.
    pub async fn wait_every(&self, poll_interval: Duration) {
        while self.get_busy().await != Some(false) {
            sleep(poll_interval).await;
        }
    }

    async fn commanded_speed(&self) -> f64 {
        self.state.lock().await.commanded_speed
    }

    async fn full_stroke(&self) -> f64 {
        f64::from(self.state.lock().await.syringe_volume)
    }

    /// Empties and refills the syringe `cycles` times through the input port.
    /// Ends full with the valve out.
    pub async fn prime(&self, cycles: u32) {
        info!("prime x{}", cycles);
        let start_speed = self.commanded_speed().await;
        let stroke = self.full_stroke().await;

        self.set_speed(self.config.prime_speed).await;
        self.set_valve(Valve::In).await;
        self.wait().await;
        for _ in 0..cycles {
            self.set_cmd_position(0.0).await;
            self.wait().await;
            self.set_cmd_position(stroke).await;
            self.wait().await;
        }
        self.set_speed(start_speed).await;
        self.set_valve(Valve::Out).await;
    }

    /// Empties into the reservoir, then draws a full stroke back in.
    pub async fn fill(&self) {
        info!("fill");
        let start_speed = self.commanded_speed().await;
        let stroke = self.full_stroke().await;

        self.set_speed(self.config.fill_speed).await;
        self.set_valve(Valve::In).await;
        self.wait().await;
        self.set_cmd_position(0.0).await;
        self.wait().await;
        self.set_cmd_position(stroke).await;
        self.wait().await;
        self.set_speed(start_speed).await;
        self.set_valve(Valve::Out).await;
    }

    /// Pushes the syringe contents back into the reservoir.
    pub async fn empty(&self) {
        info!("empty");
        let start_speed = self.commanded_speed().await;

        self.set_speed(self.config.fill_speed).await;
        self.set_valve(Valve::In).await;
        self.wait().await;
        self.set_cmd_position(0.0).await;
        self.wait().await;
        self.set_speed(start_speed).await;
        self.set_valve(Valve::Out).await;
    }

    /// Slow move through the output port. Refused above the flow speed limit,
    /// in which case nothing is sent and `None` is returned.
    pub async fn flow(&self, position: f64, speed: f64) -> Option<Reply> {
        if !(speed.is_finite() && speed <= self.config.flow_speed_high_limit) {
            warn!(
                "flow speed {} above limit {}, ignored",
                speed, self.config.flow_speed_high_limit
            );
            return None;
        }

        self.abort().await;
        let valve = self.state.lock().await.valve;
        if valve != Valve::Out {
            self.set_valve(Valve::Out).await;
        }
        Some(self.move_abs(position, Some(speed)).await)
    }

    /// Withdraws the plunger by `delta` uL against the closed output line.
    pub async fn create_low_pressure(&self, delta: f64) {
        info!("create low pressure, {} uL", delta);
        let start_speed = self.commanded_speed().await;
        let stroke = self.full_stroke().await;

        self.set_speed(self.config.low_pressure_speed).await;
        self.set_valve(Valve::Out).await;
        self.wait().await;
        let target = (self.state.lock().await.commanded_position + delta).min(stroke);
        self.set_cmd_position(round3(target)).await;
        self.wait().await;
        self.set_speed(start_speed).await;
        self.set_valve(Valve::Out).await;
    }

    fn publish_all(&self, state: &PumpState) {
        let done = state.done_moving(self.config.done_epsilon);

        self.publish(PvKey::Rbv, PvValue::float(state.measured_position));
        self.publish(PvKey::Val, PvValue::Float(state.commanded_position));
        self.publish(PvKey::Velo, PvValue::Float(state.commanded_speed));
        self.publish(PvKey::Valve, PvValue::Text(state.valve.to_string()));
        self.publish(PvKey::Dmov, done.map_or(PvValue::Absent, PvValue::Bool));
        self.publish(PvKey::Status, PvValue::Text(state.status.clone()));
        self.publish(PvKey::Error, PvValue::text(state.last_error.as_deref()));
        self.publish(
            PvKey::ErrorCode,
            PvValue::text(
                state
                    .last_error_code
                    .map(|c| char::from(c).to_string())
                    .as_deref(),
            ),
        );
        self.publish(
            PvKey::Alarm,
            PvValue::Text(state.low_level(self.config.low_level_alarm)),
        );
        self.publish(
            PvKey::Warn,
            PvValue::Text(state.low_level(self.config.low_level_warning)),
        );
        self.publish(PvKey::Running, PvValue::Bool(state.running));
    }

    /// One poll: position and busy, then every key is republished.
    pub async fn run_once(&self) {
        self.get_position().await;
        self.get_busy().await;

        let state = self.snapshot().await;
        debug!(
            "run_once: cmd {} rbv {:?} busy {:?} {}",
            state.commanded_position, state.measured_position, state.busy, state.motion
        );
        self.publish_all(&state);
    }

    async fn set_running(&self, running: bool) {
        self.update(|s| s.running = running).await;
        self.publish(PvKey::Running, PvValue::Bool(running));
    }

    /// Polls until [`Self::stop`] is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.poll_loop().await
    }

    async fn poll_loop(&self) {
        self.set_running(true).await;
        info!("pump {}: polling started", self.config.pump_id);

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.run_once().await;

            // the period is re-read every tick so a command shortens it at once
            while self.running.load(Ordering::SeqCst)
                && started.elapsed() < self.state.lock().await.scan_period
            {
                sleep(self.config.scan_tick).await;
            }
        }

        self.set_running(false).await;
        info!("pump {}: polling stopped", self.config.pump_id);
    }

    /// Spawns the poll loop on the current runtime. Does nothing while a
    /// spawned loop is still alive.
    pub fn start(self: &Arc<Self>) {
        let mut poller = match self.poller.lock() {
            Ok(poller) => poller,
            Err(poisoned) => poisoned.into_inner(),
        };
        if poller.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        *poller = Some(tokio::spawn(async move { this.poll_loop().await }));
    }

    /// Clears the running flag and waits for a spawned poll loop to finish
    /// its current pass.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = match self.poller.lock() {
            Ok(mut poller) => poller.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("poll loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops polling, aborts and releases the port. Returns `false` when the
    /// controller was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stop().await;
        self.abort().await;
        self.driver.close().await;
        info!("pump {} closed", self.config.pump_id);
        true
    }

    /// Applies a write coming from the bridge.
    pub async fn dispatch(&self, name: &str, value: BridgeValue) -> Result<(), DispatchError> {
        let result = self.apply(name, value).await;
        if let Err(e) = &result {
            warn!("rejected bridge write: {}", e);
        }
        result
    }

    async fn apply(&self, name: &str, value: BridgeValue) -> Result<(), DispatchError> {
        let not_finite = |v: f64| DispatchError::BadValue {
            name: name.to_string(),
            value: v.to_string(),
        };
        match (name, value) {
            ("VAL" | "VELO", BridgeValue::Float(v)) if !v.is_finite() => return Err(not_finite(v)),
            ("CMD", BridgeValue::Command(PumpCommand::Flow { position, speed }))
                if !(position.is_finite() && speed.is_finite()) =>
            {
                let v = if position.is_finite() { speed } else { position };
                return Err(not_finite(v));
            }
            ("VAL", BridgeValue::Float(position)) => {
                self.set_cmd_position(position).await;
            }
            ("VELO", BridgeValue::Float(speed)) => {
                self.set_speed_on_the_fly(speed).await;
            }
            ("VALVE", BridgeValue::Text(text)) => {
                let valve = text.parse::<Valve>().map_err(|_| DispatchError::BadValue {
                    name: name.to_string(),
                    value: text.clone(),
                })?;
                self.set_valve(valve).await;
            }
            ("CMD", BridgeValue::Command(command)) => self.execute(command).await,
            ("CMD", BridgeValue::Text(text)) => self.execute(text.parse()?).await,
            ("VAL" | "VELO" | "VALVE" | "CMD", value) => {
                return Err(DispatchError::TypeMismatch {
                    name: name.to_string(),
                    value,
                })
            }
            _ => return Err(DispatchError::UnknownName(name.to_string())),
        }
        Ok(())
    }

    pub async fn execute(&self, command: PumpCommand) {
        debug!("execute {:?}", command);
        match command {
            PumpCommand::Abort => {
                self.abort().await;
            }
            PumpCommand::Fill => self.fill().await,
            PumpCommand::Empty => self.empty().await,
            PumpCommand::Prime { cycles } => self.prime(cycles).await,
            PumpCommand::Flow { position, speed } => {
                self.flow(position, speed).await;
            }
        }
    }
}
