//! Atomic pump operations. Every call is one encode, exchange, decode round
//! and hands back the decoded [`Reply`] as is. Transport failures come back
//! as [`Reply::no_device`], nothing here returns an error.

use log::{debug, warn};

use crate::protocol::{self, decode, CommandFrame, Orientation, Reply, SyringeVolume, Valve};
use crate::transport::Transport;

/// Above this the pump ignores on-the-fly speed changes, uL/s.
pub const ON_THE_FLY_SPEED_CEILING: f64 = 68.8;

pub struct PumpDriver {
    transport: Transport,
    address: u8,
}

impl PumpDriver {
    pub fn new(transport: Transport, address: u8) -> Self {
        Self { transport, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    async fn query(&self, frame: CommandFrame) -> Reply {
        match self.transport.exchange(&frame).await {
            Ok(raw) => decode(&raw),
            Err(e) => {
                warn!("exchange of {} failed: {:#}", frame, e);
                Reply::no_device()
            }
        }
    }

    pub async fn get_position(&self) -> Reply {
        let reply = self.query(protocol::query_position(self.address)).await;
        debug!("get_position(): reply = {:?}", reply);
        reply
    }

    pub async fn set_position(&self, position: f64) -> Reply {
        let reply = self
            .query(protocol::move_absolute(self.address, position))
            .await;
        debug!("set_position({}): reply = {:?}", position, reply);
        reply
    }

    /// Loads `speed` and moves to `position` in one program.
    pub async fn move_abs(&self, position: f64, speed: f64) -> Reply {
        let reply = self
            .query(protocol::move_with_speed(self.address, position, speed))
            .await;
        debug!("move_abs({}, {}): reply = {:?}", position, speed, reply);
        reply
    }

    pub async fn move_rel(&self, delta: f64, speed: f64) -> Reply {
        let reply = self
            .query(protocol::move_relative(self.address, delta, speed))
            .await;
        debug!("move_rel({}, {}): reply = {:?}", delta, speed, reply);
        reply
    }

    pub async fn get_speed(&self) -> Reply {
        let reply = self.query(protocol::query_velocity(self.address)).await;
        debug!("get_speed(): reply = {:?}", reply);
        reply
    }

    /// On the fly the change applies to the running move. The hardware
    /// silently ignores on-the-fly speeds above [`ON_THE_FLY_SPEED_CEILING`],
    /// the value is still sent as given. Otherwise the current move is
    /// aborted first.
    pub async fn set_speed(&self, speed: f64, on_the_fly: bool) -> Reply {
        if !on_the_fly {
            self.abort().await;
        } else if speed > ON_THE_FLY_SPEED_CEILING {
            warn!(
                "on-the-fly speed {} above {}, the pump will ignore it",
                speed, ON_THE_FLY_SPEED_CEILING
            );
        }
        let reply = self
            .query(protocol::set_velocity(self.address, speed, on_the_fly))
            .await;
        debug!(
            "set_speed({}, on_the_fly = {}): reply = {:?}",
            speed, on_the_fly, reply
        );
        reply
    }

    pub async fn set_speed_on_the_fly(&self, speed: f64) -> Reply {
        self.set_speed(speed, true).await
    }

    pub async fn get_valve(&self) -> Reply {
        let reply = self.query(protocol::query_valve(self.address)).await;
        debug!("get_valve(): reply = {:?}", reply);
        reply
    }

    pub async fn set_valve(&self, valve: Valve) -> Reply {
        let reply = self.query(protocol::set_valve(self.address, valve)).await;
        debug!("set_valve({}): reply = {:?}", valve, reply);
        reply
    }

    pub async fn set_backlash(&self, increments: u32) -> Reply {
        let reply = self
            .query(protocol::set_backlash(self.address, increments))
            .await;
        debug!("set_backlash({}): reply = {:?}", increments, reply);
        reply
    }

    /// Takes effect after the pump is power cycled.
    pub async fn assign_volume(&self, volume: u32) -> Reply {
        match SyringeVolume::try_from(volume) {
            Ok(volume) => {
                self.query(protocol::assign_volume(self.address, volume))
                    .await
            }
            Err(_) => {
                let reply = Reply::rejected(format!(
                    "volume of {} uL is not supported. Choose from {:?}",
                    volume,
                    SyringeVolume::SUPPORTED
                ));
                warn!("assign_volume({}): {:?}", volume, reply.error);
                reply
            }
        }
    }

    /// Valve initialization only, the plunger is left alone.
    pub async fn initialize(&self, orientation: Orientation) -> Reply {
        self.query(protocol::initialize(self.address, orientation))
            .await
    }

    pub async fn assign_pump_id(&self, pump_id: u8) -> Reply {
        self.query(protocol::assign_pump_id(self.address, pump_id))
            .await
    }

    pub async fn home(&self, orientation: Orientation, backlash: u32) -> Reply {
        let reply = self
            .query(protocol::home(self.address, orientation, backlash))
            .await;
        debug!("home({}, {}): reply = {:?}", orientation, backlash, reply);
        reply
    }

    pub async fn abort(&self) -> Reply {
        self.query(protocol::abort(self.address)).await
    }

    pub async fn reset(&self) -> Reply {
        let reply = self.query(protocol::reset(self.address)).await;
        debug!("reset(): reply = {:?}", reply);
        reply
    }

    pub async fn busy(&self) -> Reply {
        let reply = self.query(protocol::query_busy(self.address)).await;
        debug!("busy(): reply = {:?}", reply);
        reply
    }

    pub async fn identify(&self) -> Reply {
        self.query(protocol::query_identity(self.address)).await
    }

    pub async fn close(&self) -> bool {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakePump, MockBus};
    use crate::protocol::{encode_reply, LOCAL_REJECT_CODE, NO_DEVICE};

    fn driver() -> (PumpDriver, std::sync::Arc<std::sync::Mutex<MockBus>>) {
        let bus = MockBus::shared();
        (PumpDriver::new(MockBus::transport(&bus), 1), bus)
    }

    #[tokio::test]
    async fn position_reply_is_returned_unmodified() {
        let (driver, bus) = driver();
        bus.lock()
            .unwrap()
            .replies
            .push_back(encode_reply(b'`', "10.250"));

        let reply = driver.get_position().await;
        assert_eq!(reply.value.as_deref(), Some("10.250"));
        assert_eq!(reply.busy, Some(false));
        assert_eq!(bus.lock().unwrap().sent_text(), vec!["/1?18\r"]);
    }

    #[tokio::test]
    async fn unsupported_volume_never_reaches_the_wire() {
        let (driver, bus) = driver();

        for volume in [0, 25, 125, 1000] {
            let reply = driver.assign_volume(volume).await;
            assert_eq!(reply.error_code, Some(LOCAL_REJECT_CODE));
            assert_eq!(reply.busy, None);
            assert!(reply.error.is_some());
        }
        assert!(bus.lock().unwrap().sent.is_empty());

        driver.assign_volume(100).await;
        assert_eq!(bus.lock().unwrap().sent_text(), vec!["/1U94R\r"]);
    }

    #[tokio::test]
    async fn speed_on_the_fly_is_sent_unclamped() {
        let (driver, bus) = driver();
        FakePump::default().attach(&bus);

        let reply = driver.set_speed(200.0, true).await;
        assert!(reply.is_well_formed());
        assert_eq!(bus.lock().unwrap().sent_text(), vec!["/1V200.0,1F\r"]);
    }

    #[tokio::test]
    async fn queued_speed_change_aborts_first() {
        let (driver, bus) = driver();
        FakePump::default().attach(&bus);

        driver.set_speed(25.0, false).await;
        assert_eq!(
            bus.lock().unwrap().sent_text(),
            vec!["/1TR\r", "/1V25.0,1R\r"]
        );
    }

    #[tokio::test]
    async fn home_is_one_frame() {
        let (driver, bus) = driver();
        FakePump::default().attach(&bus);

        driver.home(Orientation::Y, 100).await;
        assert_eq!(
            bus.lock().unwrap().sent_text(),
            vec!["/1Y7,0,0IV25.0,1K100A0.0,1R\r"]
        );
    }

    #[tokio::test]
    async fn silent_pump_reports_no_device() {
        let (driver, _bus) = driver();

        let reply = driver.busy().await;
        assert_eq!(reply.value, None);
        assert_eq!(reply.busy, None);
        assert_eq!(reply.error.as_deref(), Some(NO_DEVICE));
    }

    #[tokio::test]
    async fn write_failure_reports_no_device() {
        let (driver, bus) = driver();
        bus.lock().unwrap().fail_writes = true;

        assert_eq!(driver.abort().await, Reply::no_device());
    }

    #[tokio::test]
    async fn closed_driver_reports_no_device() {
        let (driver, _bus) = driver();
        assert!(driver.close().await);

        assert_eq!(driver.get_speed().await, Reply::no_device());
    }
}
