//! Bus Transaction Engine - Single-byte transfers over a shared SPI device
//!
//! One [`SpiDevice`] handle is shared by every channel of an engine. Each
//! [`BusEngine::transfer`] holds the handle for the whole transaction, so
//! transfers from different channels never interleave on the wire.
//!
//! Channels are logical: they carry a number and a sub-device name and are
//! handed out sequentially from 0 at attach time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::sync::ShardedLock;

use crate::irq::CancelToken;
use crate::node::{format_value, parse_int_token, token_window, truncate, IntSyntax, NodeCaps};
use crate::registry::DeviceFile;
use crate::{DriverError, Result};

/// Synchronous serial peripheral handle
pub trait SpiDevice: Send {
    /// Driver name the device was matched by
    fn modalias(&self) -> &str;

    fn chip_select(&self) -> u8;

    /// Configure the word size; called once before any transfer
    fn setup(&mut self, bits_per_word: u8) -> Result<()>;

    /// Clock one byte out
    fn write_byte(&mut self, byte: u8) -> Result<()>;

    /// Clock one byte in
    fn read_byte(&mut self) -> Result<u8>;
}

#[derive(Debug, Clone)]
struct BusChannel {
    number: usize,
    name: String,
}

/// Serialised transfers over one SPI device
pub struct BusEngine {
    device: Mutex<Box<dyn SpiDevice>>,
    channels: ShardedLock<Vec<BusChannel>>,
}

impl BusEngine {
    /// Take ownership of `device` and run its setup
    ///
    /// # Errors
    /// [`DriverError::TransferFailed`] if setup fails
    pub fn new(mut device: Box<dyn SpiDevice>, bits_per_word: u8) -> Result<Self> {
        device.setup(bits_per_word)?;
        log::info!(
            "{}: cs {}, {} bits per word",
            device.modalias(),
            device.chip_select(),
            bits_per_word
        );

        Ok(Self {
            device: Mutex::new(device),
            channels: ShardedLock::new(Vec::new()),
        })
    }

    /// Add a channel, returning its number
    pub fn attach_channel(&self, name: &str) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let number = channels.len();
        channels.push(BusChannel {
            number,
            name: name.to_owned(),
        });
        number
    }

    /// Number of attached channels
    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sub-device name of a channel
    pub fn channel_name(&self, channel: usize) -> Result<String> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|ch| ch.name.clone())
            .ok_or(DriverError::NoSuchChannel { channel })
    }

    /// Run one transaction on `channel`
    ///
    /// `Some(byte)` writes the byte and returns `None`; `None` reads one
    /// byte and returns it.
    ///
    /// # Errors
    /// - [`DriverError::NoSuchChannel`] if the channel was never attached
    /// - [`DriverError::TransferFailed`] if the device reports a fault
    pub fn transfer(&self, channel: usize, tx: Option<u8>) -> Result<Option<u8>> {
        let number = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|ch| ch.number)
            .ok_or(DriverError::NoSuchChannel { channel })?;

        let mut device = self.lock_device();
        match tx {
            Some(byte) => {
                device.write_byte(byte)?;
                log::debug!("channel {}: wrote {:#04x}", number, byte);
                Ok(None)
            }
            None => {
                let byte = device.read_byte()?;
                log::debug!("channel {}: read {:#04x}", number, byte);
                Ok(Some(byte))
            }
        }
    }

    fn lock_device(&self) -> MutexGuard<'_, Box<dyn SpiDevice>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static_assertions::assert_impl_all!(BusEngine: Send, Sync);

/// Device node for one bus channel
///
/// Reads clock a byte in and format it as decimal; writes take a value in
/// `0..=255` and clock it out.
pub struct BusChannelNode {
    engine: Arc<BusEngine>,
    channel: usize,
    max_write_len: usize,
}

impl BusChannelNode {
    pub fn new(engine: Arc<BusEngine>, channel: usize, max_write_len: usize) -> Self {
        Self {
            engine,
            channel,
            max_write_len,
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }
}

impl DeviceFile for BusChannelNode {
    fn caps(&self) -> NodeCaps {
        NodeCaps::READ | NodeCaps::WRITE
    }

    fn read(&self, count: usize, _cancel: &CancelToken) -> Result<Vec<u8>> {
        let byte = self
            .engine
            .transfer(self.channel, None)?
            .ok_or_else(|| DriverError::TransferFailed("read returned no data".into()))?;
        Ok(truncate(format_value(i64::from(byte)), count))
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let value = parse_int_token(token_window(data, self.max_write_len), IntSyntax::Prefixed)?;
        let byte = u8::try_from(value)
            .map_err(|_| DriverError::InvalidInput(format!("{} does not fit in a byte", value)))?;

        self.engine.transfer(self.channel, Some(byte))?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimSpiDevice, SimSpiPeer};
    use std::thread;

    fn engine() -> (Arc<BusEngine>, Arc<SimSpiPeer>) {
        let peer = SimSpiPeer::new();
        let device = Box::new(SimSpiDevice::new("psoc", 0, peer.clone()));
        (Arc::new(BusEngine::new(device, 8).unwrap()), peer)
    }

    #[test]
    fn test_setup_runs_before_channels() {
        let (engine, peer) = engine();
        assert_eq!(peer.bits_per_word(), Some(8));
        assert_eq!(engine.channel_count(), 0);
    }

    #[test]
    fn test_setup_failure() {
        let peer = SimSpiPeer::new();
        peer.fail_next("no clock");
        let device = Box::new(SimSpiDevice::new("psoc", 0, peer));
        assert!(matches!(BusEngine::new(device, 8), Err(DriverError::TransferFailed(_))));
    }

    #[test]
    fn test_channels_are_sequential() {
        let (engine, _peer) = engine();
        let numbers: Vec<usize> = ["ph", "wl", "sl", "ms"]
            .iter()
            .map(|name| engine.attach_channel(name))
            .collect();

        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(engine.channel_name(1).unwrap(), "wl");
    }

    #[test]
    fn test_transfer_directions() {
        let (engine, peer) = engine();
        engine.attach_channel("ph");

        assert_eq!(engine.transfer(0, Some(0x42)).unwrap(), None);
        assert_eq!(peer.received(), vec![0x42]);

        peer.place(7);
        assert_eq!(engine.transfer(0, None).unwrap(), Some(7));
    }

    #[test]
    fn test_unknown_channel() {
        let (engine, _peer) = engine();
        engine.attach_channel("ph");

        assert!(matches!(engine.transfer(1, None), Err(DriverError::NoSuchChannel { channel: 1 })));
        assert!(matches!(engine.channel_name(4), Err(DriverError::NoSuchChannel { channel: 4 })));
    }

    #[test]
    fn test_device_fault_is_reported() {
        let (engine, peer) = engine();
        engine.attach_channel("ph");
        peer.place(1);
        peer.fail_next("cs glitch");

        assert!(matches!(engine.transfer(0, None), Err(DriverError::TransferFailed(_))));
        assert_eq!(engine.transfer(0, None).unwrap(), Some(1));
    }

    #[test]
    fn test_concurrent_writes_all_arrive() {
        let (engine, peer) = engine();
        for name in ["ph", "wl", "sl", "ms"] {
            engine.attach_channel(name);
        }

        let workers: Vec<_> = (0..4u8)
            .map(|channel| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for i in 0..25u8 {
                        engine.transfer(channel as usize, Some(channel * 25 + i)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut received = peer.received();
        received.sort_unstable();
        assert_eq!(received, (0..100u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_channel_node_read_and_write() {
        let (engine, peer) = engine();
        let channel = engine.attach_channel("sl");
        let node = BusChannelNode::new(engine, channel, 32);

        peer.place(200);
        assert_eq!(node.read(16, &CancelToken::new()).unwrap(), b"200\0".to_vec());
        assert_eq!(node.read(2, &CancelToken::new()).unwrap(), b"20".to_vec());

        assert_eq!(node.write(b"17\n").unwrap(), 3);
        assert_eq!(peer.received(), vec![17]);
    }

    #[test]
    fn test_channel_node_rejects_out_of_range_bytes() {
        let (engine, peer) = engine();
        let channel = engine.attach_channel("ms");
        let node = BusChannelNode::new(engine, channel, 32);

        assert!(matches!(node.write(b"256"), Err(DriverError::InvalidInput(_))));
        assert!(matches!(node.write(b"-1"), Err(DriverError::InvalidInput(_))));
        assert!(matches!(node.write(b"x"), Err(DriverError::InvalidInput(_))));
        assert!(peer.received().is_empty());
    }

    #[test]
    fn test_channel_node_accepts_hex_and_octal() {
        let (engine, peer) = engine();
        let channel = engine.attach_channel("ph");
        let node = BusChannelNode::new(engine, channel, 32);

        assert_eq!(node.write(b"0x2a").unwrap(), 4);
        assert_eq!(node.write(b"017\n").unwrap(), 4);
        assert_eq!(node.write(b"0xff").unwrap(), 4);
        assert!(matches!(node.write(b"0x100"), Err(DriverError::InvalidInput(_))));
        assert_eq!(peer.received(), vec![42, 15, 255]);
    }

    #[test]
    fn test_channel_node_write_past_the_cap() {
        let (engine, peer) = engine();
        let channel = engine.attach_channel("wl");
        let node = BusChannelNode::new(engine, channel, 32);

        let mut padded = vec![b' '; 40];
        padded.extend_from_slice(b"9");
        assert_eq!(node.write(&padded).unwrap(), 41);

        let mut tail = b"5".to_vec();
        tail.extend_from_slice(&[b' '; 39]);
        tail.extend_from_slice(b"6");
        assert_eq!(node.write(&tail).unwrap(), 41);

        assert_eq!(peer.received(), vec![9, 5]);
    }
}
