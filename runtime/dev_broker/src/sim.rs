//! Simulated hardware backend
//!
//! [`SimGpioChip`] and [`SimSpiDevice`] stand in for real controllers on a
//! development host. Tests and the `devctl` harness drive the "outside world"
//! through them: [`SimGpioChip::drive`] changes an input level and fires the
//! edge interrupt, [`SimSpiPeer::place`] puts a byte on the bus.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::SpiDevice;
use crate::irq::EdgeTrigger;
use crate::line::{Direction, GpioChip, IrqHandler, LineId};
use crate::{DriverError, Result};

/// First interrupt number handed out by the simulated chip
pub const SIM_IRQ_BASE: u32 = 160;

#[derive(Default)]
struct SimLine {
    claimed: bool,
    direction: Option<Direction>,
    /// Level seen on the pin when configured as input
    level: bool,
    /// Output latch
    latch: bool,
    irq: Option<(EdgeTrigger, IrqHandler)>,
}

/// In-memory GPIO controller with edge detection
pub struct SimGpioChip {
    label: String,
    ngpio: u32,
    lines: Mutex<BTreeMap<LineId, SimLine>>,
}

impl SimGpioChip {
    /// Create a chip exposing lines `0..ngpio`
    pub fn new(label: &str, ngpio: u32) -> Self {
        Self {
            label: label.to_owned(),
            ngpio,
            lines: Mutex::new(BTreeMap::new()),
        }
    }

    /// Change the external level on `line`
    ///
    /// Runs the line's interrupt handler on the calling thread when the
    /// transition matches its trigger. The new level is visible before the
    /// handler runs.
    pub fn drive(&self, line: LineId, level: bool) -> Result<()> {
        self.check_range(line)?;

        let handler = {
            let mut lines = self.lock();
            let state = lines.entry(line).or_default();
            let previous = state.level;
            state.level = level;

            state
                .irq
                .as_ref()
                .filter(|(trigger, _)| trigger.matches(previous, level))
                .map(|(_, handler)| Arc::clone(handler))
        };

        if let Some(handler) = handler {
            log::trace!("{}: edge on line {} -> {}", self.label, line, level as u8);
            handler();
        }

        Ok(())
    }

    /// Lines currently claimed, ascending
    pub fn claimed_lines(&self) -> Vec<LineId> {
        self.lock()
            .iter()
            .filter(|(_, state)| state.claimed)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Configured direction of a line, if any
    pub fn direction_of(&self, line: LineId) -> Option<Direction> {
        self.lock().get(&line).and_then(|state| state.direction)
    }

    /// Whether an interrupt handler is attached to a line
    pub fn has_irq(&self, line: LineId) -> bool {
        self.lock().get(&line).is_some_and(|state| state.irq.is_some())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<LineId, SimLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_range(&self, line: LineId) -> Result<()> {
        if line < self.ngpio {
            Ok(())
        } else {
            Err(DriverError::InvalidInput(format!(
                "line {} not on {} ({} lines)",
                line, self.label, self.ngpio
            )))
        }
    }

    fn with_claimed<T>(&self, line: LineId, f: impl FnOnce(&mut SimLine) -> T) -> Result<T> {
        self.check_range(line)?;
        let mut lines = self.lock();
        match lines.get_mut(&line) {
            Some(state) if state.claimed => Ok(f(state)),
            _ => Err(DriverError::NotClaimed { line }),
        }
    }
}

impl GpioChip for SimGpioChip {
    fn label(&self) -> &str {
        &self.label
    }

    fn request(&self, line: LineId) -> Result<()> {
        self.check_range(line)?;
        let mut lines = self.lock();
        let state = lines.entry(line).or_default();
        if state.claimed {
            return Err(DriverError::Busy { line });
        }
        state.claimed = true;
        Ok(())
    }

    fn free(&self, line: LineId) -> Result<()> {
        self.with_claimed(line, |state| {
            state.claimed = false;
            state.direction = None;
            state.irq = None;
        })
    }

    fn direction_input(&self, line: LineId) -> Result<()> {
        self.with_claimed(line, |state| state.direction = Some(Direction::Input))
    }

    fn direction_output(&self, line: LineId, value: bool) -> Result<()> {
        self.with_claimed(line, |state| {
            state.direction = Some(Direction::Output);
            state.latch = value;
        })
    }

    fn get_value(&self, line: LineId) -> Result<bool> {
        self.with_claimed(line, |state| match state.direction {
            Some(Direction::Output) => state.latch,
            _ => state.level,
        })
    }

    fn set_value(&self, line: LineId, value: bool) -> Result<()> {
        self.with_claimed(line, |state| state.latch = value)
    }

    fn request_irq(&self, line: LineId, trigger: EdgeTrigger, handler: IrqHandler) -> Result<u32> {
        self.with_claimed(line, |state| {
            if state.irq.is_some() {
                return Err(DriverError::Busy { line });
            }
            state.irq = Some((trigger, handler));
            Ok(SIM_IRQ_BASE + line)
        })?
    }

    fn free_irq(&self, line: LineId) -> Result<()> {
        self.with_claimed(line, |state| state.irq = None)
    }
}

#[derive(Default)]
struct PeerState {
    bus_byte: Option<u8>,
    received: Vec<u8>,
    bits_per_word: Option<u8>,
    fail_next: Option<String>,
}

/// Far end of a simulated SPI link
///
/// Shared between the [`SimSpiDevice`] handed to the driver and the test or
/// harness acting as the peripheral.
#[derive(Default)]
pub struct SimSpiPeer {
    state: Mutex<PeerState>,
}

impl SimSpiPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put a byte on the bus for the next reads
    pub fn place(&self, byte: u8) {
        self.lock().bus_byte = Some(byte);
    }

    /// Bytes written by the host, oldest first
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    /// Word size configured by the host, if setup ran
    pub fn bits_per_word(&self) -> Option<u8> {
        self.lock().bits_per_word
    }

    /// Make the next transfer fail with `reason`
    pub fn fail_next(&self, reason: &str) {
        self.lock().fail_next = Some(reason.to_owned());
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_fault(state: &mut PeerState) -> Result<()> {
        match state.fail_next.take() {
            Some(reason) => Err(DriverError::TransferFailed(reason)),
            None => Ok(()),
        }
    }
}

/// Host side of a simulated SPI link
pub struct SimSpiDevice {
    modalias: String,
    chip_select: u8,
    peer: Arc<SimSpiPeer>,
}

impl SimSpiDevice {
    pub fn new(modalias: &str, chip_select: u8, peer: Arc<SimSpiPeer>) -> Self {
        Self {
            modalias: modalias.to_owned(),
            chip_select,
            peer,
        }
    }
}

impl SpiDevice for SimSpiDevice {
    fn modalias(&self) -> &str {
        &self.modalias
    }

    fn chip_select(&self) -> u8 {
        self.chip_select
    }

    fn setup(&mut self, bits_per_word: u8) -> Result<()> {
        let mut state = self.peer.lock();
        SimSpiPeer::take_fault(&mut state)?;
        state.bits_per_word = Some(bits_per_word);
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        let mut state = self.peer.lock();
        SimSpiPeer::take_fault(&mut state)?;
        state.received.push(byte);
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut state = self.peer.lock();
        SimSpiPeer::take_fault(&mut state)?;
        state
            .bus_byte
            .ok_or_else(|| DriverError::TransferFailed("peer has not driven the bus".into()))
    }
}
