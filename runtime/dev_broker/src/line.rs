//! Line Resources - Exclusive ownership of a single GPIO line
//!
//! A [`LineResource`] is the only handle through which a claimed line may be
//! driven or sampled. The claim itself lives in the [`GpioChip`] backend, so a
//! second acquisition of the same physical id fails with
//! [`DriverError::Busy`] no matter which component asks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::irq::EdgeTrigger;
use crate::{DriverError, Result};

/// Physical line number on a GPIO chip
pub type LineId = u32;

/// Callback invoked from interrupt context when a qualifying edge occurs
///
/// Handlers run on whatever context delivers the edge. They must not block,
/// allocate, or hold locks beyond a bounded critical section.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Line direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Decode a manifest direction flag (0 = input, 1 = output)
    pub fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            0 => Some(Direction::Input),
            1 => Some(Direction::Output),
            _ => None,
        }
    }

    /// Encode as a manifest direction flag
    pub fn flag(self) -> u8 {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("in"),
            Direction::Output => f.write_str("out"),
        }
    }
}

/// GPIO controller backend
///
/// Mirrors the gpiolib surface a line driver needs: claim bookkeeping,
/// direction control, value access and edge interrupts.
pub trait GpioChip: Send + Sync {
    /// Human readable chip label
    fn label(&self) -> &str;

    /// Claim a line
    ///
    /// # Errors
    /// [`DriverError::Busy`] if the line is already claimed
    fn request(&self, line: LineId) -> Result<()>;

    /// Return a claimed line to the chip
    ///
    /// # Errors
    /// [`DriverError::NotClaimed`] if the line is not claimed
    fn free(&self, line: LineId) -> Result<()>;

    /// Configure a line as input
    fn direction_input(&self, line: LineId) -> Result<()>;

    /// Configure a line as output, driving `value` immediately
    fn direction_output(&self, line: LineId, value: bool) -> Result<()>;

    /// Sample a line; outputs report their latched value
    fn get_value(&self, line: LineId) -> Result<bool>;

    /// Drive an output line
    fn set_value(&self, line: LineId, value: bool) -> Result<()>;

    /// Attach an edge interrupt handler to a line
    ///
    /// # Returns
    /// The interrupt number assigned to the line
    fn request_irq(&self, line: LineId, trigger: EdgeTrigger, handler: IrqHandler) -> Result<u32>;

    /// Detach the edge interrupt handler from a line
    fn free_irq(&self, line: LineId) -> Result<()>;
}

/// An exclusively owned GPIO line
///
/// Dropping a resource that is still claimed releases it, so any early return
/// between acquisition and hand-off gives the line back to the chip.
pub struct LineResource {
    chip: Arc<dyn GpioChip>,
    id: LineId,
    direction: Option<Direction>,
    claimed: AtomicBool,
}

impl LineResource {
    /// Claim `id` on `chip`
    ///
    /// # Errors
    /// [`DriverError::Busy`] if another owner holds the line
    pub fn acquire(chip: Arc<dyn GpioChip>, id: LineId) -> Result<Self> {
        chip.request(id)?;
        log::debug!("{}: claimed line {}", chip.label(), id);

        Ok(Self {
            chip,
            id,
            direction: None,
            claimed: AtomicBool::new(true),
        })
    }

    /// Physical line number
    pub fn id(&self) -> LineId {
        self.id
    }

    /// Configured direction, `None` until [`set_direction`](Self::set_direction)
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Whether this resource still holds its claim
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Apply a direction; outputs start low
    pub fn set_direction(&mut self, direction: Direction) -> Result<()> {
        self.ensure_claimed()?;

        match direction {
            Direction::Input => self.chip.direction_input(self.id)?,
            Direction::Output => self.chip.direction_output(self.id, false)?,
        }

        self.direction = Some(direction);
        Ok(())
    }

    /// Sample the line
    ///
    /// Output lines return the last value written to them.
    pub fn read(&self) -> Result<bool> {
        self.ensure_claimed()?;
        self.chip.get_value(self.id)
    }

    /// Drive the line
    ///
    /// # Errors
    /// [`DriverError::InvalidOperation`] unless the line is configured as an
    /// output. Input lines are never driven.
    pub fn write(&self, value: bool) -> Result<()> {
        self.ensure_claimed()?;

        if self.direction != Some(Direction::Output) {
            return Err(DriverError::InvalidOperation("line is not configured as output"));
        }

        self.chip.set_value(self.id, value)
    }

    /// Give the line back to the chip
    ///
    /// # Errors
    /// [`DriverError::NotClaimed`] if this resource was already released. The
    /// chip is not touched in that case.
    pub fn release(&self) -> Result<()> {
        if !self.claimed.swap(false, Ordering::AcqRel) {
            return Err(DriverError::NotClaimed { line: self.id });
        }

        log::debug!("{}: released line {}", self.chip.label(), self.id);
        self.chip.free(self.id)
    }

    fn ensure_claimed(&self) -> Result<()> {
        if self.is_claimed() {
            Ok(())
        } else {
            Err(DriverError::NotClaimed { line: self.id })
        }
    }
}

impl fmt::Debug for LineResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineResource")
            .field("chip", &self.chip.label())
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("claimed", &self.is_claimed())
            .finish()
    }
}

impl Drop for LineResource {
    fn drop(&mut self) {
        if self.is_claimed() {
            if let Err(err) = self.release() {
                log::warn!("line {}: release on drop failed: {}", self.id, err);
            }
        }
    }
}
