//! The bus between the controller and the physical panel.
//!
//! `PanelInterface` is the narrow set of operations the controller needs:
//! reset, chip select, command and data bytes, and the busy line. The panel
//! holds the busy line active while it refreshes; there is no interrupt, so
//! the controller polls it.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use super::command;

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("bus io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus error: {0}")]
    Bus(String),
}

/// Which of the panel's two controller chips a transfer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipSelect {
    /// Left half of every row.
    Main,
    /// Right half of every row.
    Secondary,
    Both,
}

pub trait PanelInterface: Send + 'static {
    fn reset(&mut self) -> Result<(), InterfaceError>;

    fn select(&mut self, chip: ChipSelect, active: bool) -> Result<(), InterfaceError>;

    fn send_command(&mut self, command: u8) -> Result<(), InterfaceError>;

    fn send_data(&mut self, data: &[u8]) -> Result<(), InterfaceError>;

    /// True while the panel holds its busy line.
    fn is_busy(&mut self) -> Result<bool, InterfaceError>;

    /// Drive the busy line to its idle level.
    fn force_idle(&mut self) -> Result<(), InterfaceError>;

    fn delay(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEventKind {
    Reset,
    Command(u8),
    Data(usize),
    ForceIdle,
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub at: Instant,
    pub thread: ThreadId,
    pub kind: BusEventKind,
}

/// Shared record of every bus transfer, tagged with the issuing thread.
#[derive(Debug, Clone, Default)]
pub struct BusLog {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl BusLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, kind: BusEventKind) {
        self.events.lock().push(BusEvent {
            at: Instant::now(),
            thread: thread::current().id(),
            kind,
        });
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }

    /// Number of times `command` was sent.
    pub fn command_count(&self, command: u8) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == BusEventKind::Command(command))
            .count()
    }

    /// Threads that issued a `DISPLAY_REFRESH`, in order.
    pub fn refresh_threads(&self) -> Vec<ThreadId> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == BusEventKind::Command(command::DISPLAY_REFRESH))
            .map(|e| e.thread)
            .collect()
    }
}

/// In-process panel with realistic busy timing.
///
/// A refresh keeps the busy line active for `refresh_time`; power on and off
/// each keep it active for `power_time`.
pub struct SimulatedInterface {
    refresh_time: Duration,
    power_time: Duration,
    busy_until: Option<Instant>,
    log: BusLog,
}

impl SimulatedInterface {
    pub fn new(refresh_time: Duration) -> Self {
        Self {
            refresh_time,
            power_time: Duration::ZERO,
            busy_until: None,
            log: BusLog::new(),
        }
    }

    pub fn with_power_time(mut self, power_time: Duration) -> Self {
        self.power_time = power_time;
        self
    }

    /// Share an existing log, so a test can keep a handle after the
    /// interface moves into a controller.
    pub fn with_log(mut self, log: BusLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> BusLog {
        self.log.clone()
    }

    fn busy_for(&mut self, duration: Duration) {
        if !duration.is_zero() {
            self.busy_until = Some(Instant::now() + duration);
        }
    }
}

impl PanelInterface for SimulatedInterface {
    fn reset(&mut self) -> Result<(), InterfaceError> {
        self.busy_until = None;
        self.log.push(BusEventKind::Reset);
        Ok(())
    }

    fn select(&mut self, _chip: ChipSelect, _active: bool) -> Result<(), InterfaceError> {
        Ok(())
    }

    fn send_command(&mut self, byte: u8) -> Result<(), InterfaceError> {
        self.log.push(BusEventKind::Command(byte));
        match byte {
            command::DISPLAY_REFRESH => self.busy_for(self.refresh_time),
            command::POWER_ON | command::POWER_OFF => self.busy_for(self.power_time),
            _ => {}
        }
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), InterfaceError> {
        self.log.push(BusEventKind::Data(data.len()));
        Ok(())
    }

    fn is_busy(&mut self) -> Result<bool, InterfaceError> {
        Ok(self.busy_until.is_some_and(|until| Instant::now() < until))
    }

    fn force_idle(&mut self) -> Result<(), InterfaceError> {
        self.busy_until = None;
        self.log.push(BusEventKind::ForceIdle);
        Ok(())
    }
}
