//! In-memory pump link for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::protocol::encode_reply;
use crate::transport::{Link, Transport};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Records traffic and answers from `replies` first, then from `responder`.
/// Without either the pump stays silent.
#[derive(Default)]
pub(crate) struct MockBus {
    pub sent: Vec<Vec<u8>>,
    pub sent_at: Vec<Instant>,
    pub replies: VecDeque<Vec<u8>>,
    pub responder: Option<Responder>,
    pub clears: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub fail_writes: bool,
    pub dropped: bool,
}

impl MockBus {
    pub fn shared() -> Arc<Mutex<MockBus>> {
        Arc::new(Mutex::new(MockBus::default()))
    }

    pub fn link(bus: &Arc<Mutex<MockBus>>) -> Box<dyn Link> {
        Box::new(MockLink { bus: bus.clone() })
    }

    pub fn transport(bus: &Arc<Mutex<MockBus>>) -> Transport {
        Transport::new(Self::link(bus), Duration::ZERO)
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }
}

struct MockLink {
    bus: Arc<Mutex<MockBus>>,
}

impl Drop for MockLink {
    fn drop(&mut self) {
        if let Ok(mut bus) = self.bus.lock() {
            bus.dropped = true;
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn clear(&mut self) -> Result<()> {
        let mut bus = self.bus.lock().unwrap();
        bus.clears += 1;
        bus.in_flight += 1;
        bus.max_in_flight = bus.max_in_flight.max(bus.in_flight);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut bus = self.bus.lock().unwrap();
        if bus.fail_writes {
            bus.in_flight -= 1;
            return Err(anyhow!("write failed"));
        }
        bus.sent.push(data.to_vec());
        bus.sent_at.push(Instant::now());
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut bus = self.bus.lock().unwrap();
        bus.in_flight -= 1;
        if let Some(reply) = bus.replies.pop_front() {
            return Ok(reply);
        }
        let last = bus.sent.last().cloned().unwrap_or_default();
        Ok(match bus.responder.as_mut() {
            Some(responder) => responder(&last),
            None => Vec::new(),
        })
    }
}

/// Simulated pump answering the command set the driver uses.
#[derive(Debug, Clone)]
pub(crate) struct FakePump {
    pub pump_id: u8,
    pub position: f64,
    pub speed: f64,
    pub valve: char,
    /// Busy answers left before the current move reports done.
    pub busy_polls: usize,
    /// Busy answers every move starts with.
    pub move_polls: usize,
    /// Never reports idle.
    pub stuck: bool,
    pub status: u8,
}

impl Default for FakePump {
    fn default() -> Self {
        Self {
            pump_id: 1,
            position: 0.0,
            speed: 25.0,
            valve: 'o',
            busy_polls: 0,
            move_polls: 2,
            stuck: false,
            status: b'`',
        }
    }
}

fn number_after(program: &str, tag: char) -> Option<f64> {
    let start = program.find(tag)? + tag.len_utf8();
    let digits: String = program[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    digits.parse().ok()
}

impl FakePump {
    pub fn attach(self, bus: &Arc<Mutex<MockBus>>) -> Arc<Mutex<FakePump>> {
        let pump = Arc::new(Mutex::new(self));
        let handle = pump.clone();
        bus.lock().unwrap().responder = Some(Box::new(move |frame| {
            handle.lock().unwrap().respond(frame)
        }));
        pump
    }

    fn busy_code(&self) -> u8 {
        if self.stuck || self.busy_polls > 0 {
            match self.status {
                b'`' => b'@',
                other => other.to_ascii_uppercase(),
            }
        } else {
            self.status
        }
    }

    pub fn respond(&mut self, frame: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(frame).into_owned();
        let program = text
            .trim_end_matches('\r')
            .get(2..)
            .unwrap_or_default()
            .to_string();

        match program.as_str() {
            "?18" => encode_reply(self.busy_code(), &format!("{:.3}", self.position)),
            "?37" => encode_reply(self.busy_code(), &format!("{:.3}", self.speed)),
            "?20R" => encode_reply(self.busy_code(), &self.valve.to_string()),
            "?80" => encode_reply(self.status, &format!("10{}", self.pump_id)),
            "?29R" => {
                let code = self.busy_code();
                self.busy_polls = self.busy_polls.saturating_sub(1);
                encode_reply(code, "")
            }
            "TR" => {
                self.busy_polls = 0;
                encode_reply(self.busy_code(), "")
            }
            "IR" | "OR" | "BR" => {
                self.valve = program.chars().next().unwrap_or('o').to_ascii_lowercase();
                encode_reply(self.status, "")
            }
            _ => {
                if let Some(speed) = number_after(&program, 'V') {
                    self.speed = speed;
                }
                if let Some(position) = number_after(&program, 'A') {
                    self.position = position;
                    self.busy_polls = self.move_polls;
                }
                if let Some(delta) = number_after(&program, 'P') {
                    self.position += delta;
                    self.busy_polls = self.move_polls;
                }
                if let Some(delta) = number_after(&program, 'D') {
                    self.position -= delta;
                    self.busy_polls = self.move_polls;
                }
                encode_reply(self.busy_code(), "")
            }
        }
    }
}
