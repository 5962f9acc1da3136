//! Broker configuration
//!
//! Loaded from TOML. Every section and every key is optional; anything left
//! out takes the default below. Unknown keys are rejected so a typo never
//! silently falls back to a default.
//!
//! ```toml
//! [gpio]
//! class = "gpio"
//! node_base = 100
//!
//! [spi]
//! channel_names = ["ph", "wl", "sl", "ms"]
//!
//! [irq]
//! cancel_poll_ms = 50
//!
//! [[static_lines]]
//! name = "led"
//! major = 62
//! line = 26
//! direction = "output"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::driver::StaticLineConfig;
use crate::{DriverError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub gpio: GpioConfig,
    pub spi: SpiConfig,
    pub irq: IrqConfig,
    pub static_lines: Vec<StaticLineConfig>,
}

/// `[gpio]` section: the manifest-driven line driver
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpioConfig {
    /// Namespace name reported when the major is assigned
    pub namespace: String,
    /// Node name prefix
    pub class: String,
    /// Number appended to the prefix for manifest entry 0
    pub node_base: u32,
    /// Minors reserved for the namespace
    pub max_lines: u32,
    /// Manifest `compatible` strings this driver accepts
    pub compatible: Vec<String>,
    pub max_write_len: usize,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            namespace: "gpio_driver".into(),
            class: "gpio".into(),
            node_base: 100,
            max_lines: 255,
            compatible: vec!["ase,plat_drv".into()],
            max_write_len: 32,
        }
    }
}

/// `[spi]` section: the bus channel driver
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpiConfig {
    pub namespace: String,
    pub class: String,
    /// Channels reserved; also the cap on attached channels
    pub max_channels: u32,
    pub bits_per_word: u8,
    /// Sub-device name per channel, in channel order
    pub channel_names: Vec<String>,
    pub max_write_len: usize,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            namespace: "spi_drv".into(),
            class: "spi_drv".into(),
            max_channels: 4,
            bits_per_word: 8,
            channel_names: ["ph", "wl", "sl", "ms"].iter().map(|s| s.to_string()).collect(),
            max_write_len: 32,
        }
    }
}

/// `[irq]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IrqConfig {
    /// How often a blocked reader re-checks its cancel token
    pub cancel_poll_ms: u64,
}

impl Default for IrqConfig {
    fn default() -> Self {
        Self { cancel_poll_ms: 50 }
    }
}

impl IrqConfig {
    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }
}

impl BrokerConfig {
    /// Parse and validate a configuration document
    ///
    /// # Errors
    /// [`DriverError::Config`] on malformed TOML, unknown keys or values
    /// that fail [`validate`](Self::validate)
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(DriverError::Config(msg)) };

        if self.gpio.max_lines == 0 {
            return fail("gpio.max_lines must be at least 1".into());
        }
        if self.gpio.node_base.checked_add(self.gpio.max_lines - 1).is_none() {
            return fail(format!(
                "gpio.node_base {} leaves no room for {} lines",
                self.gpio.node_base, self.gpio.max_lines
            ));
        }
        if self.gpio.class.is_empty() || self.spi.class.is_empty() {
            return fail("node class must not be empty".into());
        }
        if self.spi.max_channels == 0 {
            return fail("spi.max_channels must be at least 1".into());
        }
        if !(1..=32).contains(&self.spi.bits_per_word) {
            return fail(format!("spi.bits_per_word {} out of range", self.spi.bits_per_word));
        }
        if self.spi.channel_names.is_empty() {
            return fail("spi.channel_names must name at least one channel".into());
        }
        if self.gpio.max_write_len == 0 || self.spi.max_write_len == 0 {
            return fail("max_write_len must be at least 1".into());
        }
        if self.irq.cancel_poll_ms == 0 {
            return fail("irq.cancel_poll_ms must be at least 1".into());
        }

        for (i, line) in self.static_lines.iter().enumerate() {
            if line.name.is_empty() {
                return fail(format!("static_lines[{}]: name must not be empty", i));
            }
            if self.static_lines[..i].iter().any(|other| other.name == line.name) {
                return fail(format!("static_lines[{}]: duplicate name {:?}", i, line.name));
            }
        }

        Ok(())
    }
}
