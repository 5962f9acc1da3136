//! Device Broker - Character-device style access to GPIO lines and an SPI bus
//!
//! # Purpose
//! The Device Broker exposes physical digital I/O lines and a synchronous
//! serial bus through addressable device nodes. Drivers acquire hardware
//! resources, register nodes in a [`DeviceRegistry`], and consumers read and
//! write those nodes by device number.
//!
//! # Integration Points
//! - Depends on: a [`GpioChip`] and an [`SpiDevice`] backend
//! - Provides to: node consumers (CLI harness, tests, user-space shims)
//! - Interrupts: edge handlers registered on the chip signal an
//!   [`InterruptSynchronizer`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Node consumers (dispatch by devno)    │
//! └──────────────┬──────────────────────────┘
//!                │ NodeOp
//! ┌──────────────▼──────────────────────────┐
//! │     DeviceRegistry (this crate)         │
//! │  • Line nodes     (LineResource)        │
//! │  • Blocking nodes (InterruptSynchronizer)│
//! │  • Bus nodes      (BusEngine channels)  │
//! └──────────────┬──────────────────────────┘
//!                │ GpioChip / SpiDevice
//! ┌──────────────▼──────────────────────────┐
//! │   Hardware backend (sim or real)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Testing Strategy
//! - Unit tests: per module, against the [`sim`] backend
//! - Integration tests: manifest probe/remove, interrupt handoff, bus channels

use thiserror::Error;

pub mod bus;
pub mod config;
pub mod driver;
pub mod enumerator;
pub mod irq;
pub mod line;
pub mod manifest;
pub mod node;
pub mod registry;
pub mod sim;

pub use bus::{BusChannelNode, BusEngine, SpiDevice};
pub use config::{BrokerConfig, GpioConfig, IrqConfig, SpiConfig};
pub use driver::{AttachReport, PlatformGpioDriver, SpiChannelDriver, StaticLineConfig, StaticLineDriver};
pub use enumerator::ProbedLines;
pub use irq::{CancelToken, EdgeTrigger, InterruptSynchronizer};
pub use line::{Direction, GpioChip, IrqHandler, LineId, LineResource};
pub use manifest::{Manifest, ManifestEntry, ParsedManifest};
pub use node::{BlockingLineNode, LineNode, NodeCaps};
pub use registry::{DevNo, DeviceFile, DeviceRegistry, NamespaceId, NodeHandle, NodeOp, NodeReply};

/// Error types for device broker operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Device numbers {major}:{first_minor}+{count} already in use")]
    AddressInUse {
        major: u32,
        first_minor: u32,
        count: u32,
    },

    #[error("Line {line} is busy")]
    Busy { line: LineId },

    #[error("No such device {major}:{minor}")]
    NoSuchDevice { major: u32, minor: u32 },

    #[error("No such channel {channel}")]
    NoSuchChannel { channel: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("Line {line} is not claimed")]
    NotClaimed { line: LineId },

    #[error("Bus transfer failed: {0}")]
    TransferFailed(String),

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Manifest entry {index}: {reason}")]
    ManifestParse { index: usize, reason: String },

    #[error("Manifest unreadable: {0}")]
    Manifest(String),

    #[error("No driver matches compatible {0:?}")]
    Incompatible(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = core::result::Result<T, DriverError>;
