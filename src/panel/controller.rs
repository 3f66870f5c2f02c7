//! Panel protocol state machine.
//!
//! `Off -> Idle -> {Clearing, Writing} -> Updating -> Idle`. A write sends
//! the left half of every row through the main chip and the right half
//! through the secondary chip, then powers on, refreshes and powers off.
//!
//! Refreshes take tens of seconds and the panel has no abort command, so
//! cancellation is cooperative: every transfer step and every busy-wait poll
//! is a checkpoint that observes the session's [`StopFlag`]. On a stop the
//! controller abandons the remaining steps, drives the busy line idle, powers
//! the panel back down, clears the flag and reports
//! [`RenderOutcome::Cancelled`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::buffer::{PanelBuffer, PanelColor, RowHalf};
use super::command;
use super::interface::{ChipSelect, InterfaceError, PanelInterface};

/// Register initialisation sequence sent after reset.
const INIT_SEQUENCE: &[(ChipSelect, u8, &[u8])] = &[
    (ChipSelect::Main, 0x74, &[0xC0, 0x1C, 0x1C, 0xCC, 0xCC, 0xCC, 0x15, 0x15, 0x55]),
    (ChipSelect::Both, 0xF0, &[0x49, 0x55, 0x13, 0x5D, 0x05, 0x10]),
    (ChipSelect::Both, 0x00, &[0xDF, 0x69]),
    (ChipSelect::Both, 0x50, &[0xF7]),
    (ChipSelect::Both, 0x60, &[0x03, 0x03]),
    (ChipSelect::Both, 0x86, &[0x10]),
    (ChipSelect::Both, 0xE3, &[0x22]),
    (ChipSelect::Both, 0xE0, &[0x01]),
    (ChipSelect::Both, 0x61, &[0x04, 0xB0, 0x03, 0x20]),
    (ChipSelect::Main, 0x01, &[0x0F, 0x00, 0x28, 0x2C, 0x28, 0x38]),
    (ChipSelect::Main, 0xB6, &[0x07]),
    (ChipSelect::Main, 0x06, &[0xE8, 0x28]),
    (ChipSelect::Main, 0xB7, &[0x01]),
    (ChipSelect::Main, 0x05, &[0xE8, 0x28]),
    (ChipSelect::Main, 0xB0, &[0x01]),
    (ChipSelect::Main, 0xB1, &[0x02]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelGeometry {
    pub width: u32,
    pub height: u32,
}

impl Default for PanelGeometry {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 1600,
        }
    }
}

impl PanelGeometry {
    /// Width must split into two whole half-rows of packed bytes.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 4 == 0
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize / 2
    }

    pub fn half_row_bytes(&self) -> usize {
        self.width as usize / 4
    }

    pub fn buffer_len(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PanelTiming {
    /// Interval between busy-line polls.
    pub busy_poll: Duration,
    /// Pause between power-on and refresh.
    pub power_settle: Duration,
    /// Pause after the deep-sleep command.
    pub sleep_settle: Duration,
}

impl Default for PanelTiming {
    fn default() -> Self {
        Self {
            busy_poll: Duration::from_millis(100),
            power_settle: Duration::from_millis(50),
            sleep_settle: Duration::from_secs(2),
        }
    }
}

const STOP_IDLE: u8 = 0;
const STOP_RUNNING: u8 = 1;
const STOP_REQUESTED: u8 = 2;

/// Cross-thread stop request for the render currently on the panel.
///
/// A request only lands while a render is armed, so a request made after a
/// render finished cannot leak into the next one. Only the controller clears
/// the flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    state: Arc<AtomicU8>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running render to stop at its next checkpoint. Returns false
    /// when no render is running or a stop is already pending.
    pub fn request(&self) -> bool {
        self.state
            .compare_exchange(STOP_RUNNING, STOP_REQUESTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOP_REQUESTED
    }

    pub(crate) fn arm(&self) {
        let _ = self.state.compare_exchange(
            STOP_IDLE,
            STOP_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Returns whether a stop was pending.
    pub(crate) fn disarm(&self) -> bool {
        self.state.swap(STOP_IDLE, Ordering::AcqRel) == STOP_REQUESTED
    }
}

#[derive(Debug, Clone)]
pub struct PanelSession {
    pub powered_on: bool,
    pub stop: StopFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RenderOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelState {
    Off,
    Idle,
    Clearing,
    Writing,
    Updating,
}

enum Interrupt {
    Stop(&'static str),
    Bus(InterfaceError),
}

impl From<InterfaceError> for Interrupt {
    fn from(e: InterfaceError) -> Self {
        Interrupt::Bus(e)
    }
}

pub struct PanelController<I: PanelInterface> {
    interface: I,
    geometry: PanelGeometry,
    timing: PanelTiming,
    session: PanelSession,
    state: PanelState,
}

impl<I: PanelInterface> PanelController<I> {
    pub fn new(interface: I, geometry: PanelGeometry, timing: PanelTiming) -> Self {
        Self {
            interface,
            geometry,
            timing,
            session: PanelSession {
                powered_on: false,
                stop: StopFlag::new(),
            },
            state: PanelState::Off,
        }
    }

    pub fn geometry(&self) -> PanelGeometry {
        self.geometry
    }

    pub fn state(&self) -> PanelState {
        self.state
    }

    pub fn session(&self) -> &PanelSession {
        &self.session
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_flag(&self) -> StopFlag {
        self.session.stop.clone()
    }

    pub fn interface(&self) -> &I {
        &self.interface
    }

    /// Reset the panel and load its register table.
    pub fn init(&mut self) -> Result<(), InterfaceError> {
        tracing::debug!("panel init");
        self.interface.reset()?;
        self.wait_released("init")?;
        for (chip, cmd, data) in INIT_SEQUENCE {
            self.interface.select(*chip, true)?;
            self.interface.send_command(*cmd)?;
            self.interface.send_data(data)?;
            self.interface.select(ChipSelect::Both, false)?;
        }
        self.state = PanelState::Idle;
        Ok(())
    }

    /// Write `buffer` to the panel and refresh it.
    pub fn display(&mut self, buffer: &PanelBuffer, title: &str) -> RenderOutcome {
        self.session.stop.arm();
        let result = self.write_and_update(buffer, title, PanelState::Writing);
        self.conclude(result, title)
    }

    /// Fill the panel with a single colour.
    pub fn clear(&mut self, color: PanelColor) -> RenderOutcome {
        self.session.stop.arm();
        let buffer = PanelBuffer::filled(self.geometry, color);
        let result = self.write_and_update(&buffer, "clear", PanelState::Clearing);
        self.conclude(result, "clear")
    }

    /// Put the panel into deep sleep. `init` is required before the next write.
    pub fn sleep(&mut self) -> Result<(), InterfaceError> {
        tracing::debug!("panel deep sleep");
        self.interface.select(ChipSelect::Both, true)?;
        self.interface.send_command(command::DEEP_SLEEP)?;
        self.interface.send_data(&[command::DEEP_SLEEP_CHECK])?;
        self.interface.select(ChipSelect::Both, false)?;
        self.interface.delay(self.timing.sleep_settle);
        self.session.powered_on = false;
        self.state = PanelState::Off;
        Ok(())
    }

    fn write_and_update(
        &mut self,
        buffer: &PanelBuffer,
        title: &str,
        state: PanelState,
    ) -> Result<(), Interrupt> {
        self.wait_or_stop("start")?;
        self.state = state;

        tracing::debug!(title, "sending left half");
        self.send_half(buffer, ChipSelect::Main, RowHalf::Left)?;
        tracing::debug!(title, "sending right half");
        self.send_half(buffer, ChipSelect::Secondary, RowHalf::Right)?;

        self.update_display(title)
    }

    fn send_half(
        &mut self,
        buffer: &PanelBuffer,
        chip: ChipSelect,
        half: RowHalf,
    ) -> Result<(), Interrupt> {
        self.interface.select(ChipSelect::Both, false)?;
        self.checkpoint("deselect")?;
        self.interface.select(chip, true)?;
        self.checkpoint("select")?;
        self.interface.send_command(command::DATA_START)?;
        self.checkpoint("data start")?;
        for row in 0..self.geometry.height {
            self.interface.send_data(buffer.half_row(row, half))?;
            self.checkpoint("row")?;
        }
        self.interface.select(ChipSelect::Both, false)?;
        self.checkpoint("half complete")
    }

    fn update_display(&mut self, title: &str) -> Result<(), Interrupt> {
        self.state = PanelState::Updating;
        if !self.session.powered_on {
            self.write_power(true, true)?;
        }
        self.interface.delay(self.timing.power_settle);
        self.checkpoint("power settle")?;

        tracing::debug!(title, "display refresh");
        self.interface.select(ChipSelect::Both, true)?;
        self.checkpoint("refresh select")?;
        self.interface.send_command(command::DISPLAY_REFRESH)?;
        self.checkpoint("refresh command")?;
        self.interface.send_data(&[0x00])?;
        self.checkpoint("refresh data")?;
        self.interface.select(ChipSelect::Both, false)?;
        self.checkpoint("refresh deselect")?;
        self.wait_or_stop("refresh")?;

        // The image is on the panel; a stop from here on is too late to matter.
        self.write_power(false, false)?;
        self.state = PanelState::Idle;
        tracing::debug!(title, "write to display complete");
        Ok(())
    }

    fn write_power(&mut self, on: bool, observe_stop: bool) -> Result<(), Interrupt> {
        self.interface.select(ChipSelect::Both, true)?;
        if on {
            self.interface.send_command(command::POWER_ON)?;
        } else {
            self.interface.send_command(command::POWER_OFF)?;
            self.interface.send_data(&[0x00])?;
        }
        self.interface.select(ChipSelect::Both, false)?;
        // Record the new level before waiting; an interrupted wait still
        // leaves the panel powered the way the command asked.
        self.session.powered_on = on;
        let label = if on { "power on" } else { "power off" };
        if observe_stop {
            self.wait_or_stop(label)
        } else {
            self.wait_released(label).map_err(Interrupt::from)
        }
    }

    fn checkpoint(&self, step: &'static str) -> Result<(), Interrupt> {
        if self.session.stop.is_requested() {
            Err(Interrupt::Stop(step))
        } else {
            Ok(())
        }
    }

    fn wait_or_stop(&mut self, step: &'static str) -> Result<(), Interrupt> {
        let started = Instant::now();
        while self.interface.is_busy()? {
            self.checkpoint(step)?;
            self.interface.delay(self.timing.busy_poll);
        }
        tracing::trace!(step, elapsed = ?started.elapsed(), "busy released");
        Ok(())
    }

    fn wait_released(&mut self, step: &'static str) -> Result<(), InterfaceError> {
        let started = Instant::now();
        while self.interface.is_busy()? {
            self.interface.delay(self.timing.busy_poll);
        }
        tracing::trace!(step, elapsed = ?started.elapsed(), "busy released");
        Ok(())
    }

    fn conclude(&mut self, result: Result<(), Interrupt>, title: &str) -> RenderOutcome {
        let outcome = match result {
            Ok(()) => RenderOutcome::Completed,
            Err(Interrupt::Stop(step)) => {
                tracing::info!(title, step, "returning early, stop requested");
                match self.restore_baseline() {
                    Ok(()) => RenderOutcome::Cancelled,
                    Err(e) => RenderOutcome::Failed(format!("restoring panel after stop: {e}")),
                }
            }
            Err(Interrupt::Bus(e)) => {
                tracing::error!(title, error = %e, "panel bus error");
                if let Err(restore) = self.restore_baseline() {
                    tracing::warn!(error = %restore, "could not restore panel after bus error");
                }
                RenderOutcome::Failed(e.to_string())
            }
        };
        self.session.stop.disarm();
        outcome
    }

    /// Busy line idle, panel powered down, state `Idle`.
    fn restore_baseline(&mut self) -> Result<(), InterfaceError> {
        self.interface.force_idle()?;
        if self.session.powered_on {
            match self.write_power(false, false) {
                Ok(()) => {}
                Err(Interrupt::Bus(e)) => return Err(e),
                Err(Interrupt::Stop(_)) => {}
            }
        }
        self.state = PanelState::Idle;
        Ok(())
    }
}
