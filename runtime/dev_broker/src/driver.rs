//! Drivers - Attach/detach lifecycles over the registry
//!
//! Three driver shapes, each owning the resources it acquired and giving them
//! back in reverse order:
//!
//! - [`StaticLineDriver`]: one line at a fixed device number. Output lines
//!   get a read/write node; input lines with an interrupt trigger get a
//!   node whose reads wait for the next edge.
//! - [`PlatformGpioDriver`]: lines described by a [`Manifest`], matched by
//!   its `compatible` string and probed through the enumerator.
//! - [`SpiChannelDriver`]: one SPI device split into named channel nodes.
//!
//! Initialisation that fails part way unwinds whatever it already did, so a
//! failed init leaves the registry and the chip untouched.

use std::sync::Arc;

use serde::Deserialize;

use crate::bus::{BusChannelNode, BusEngine, SpiDevice};
use crate::config::{BrokerConfig, GpioConfig, SpiConfig};
use crate::enumerator::{self, ProbedLines};
use crate::irq::{EdgeTrigger, InterruptSynchronizer};
use crate::line::{Direction, GpioChip, LineId, LineResource};
use crate::manifest::Manifest;
use crate::node::{BlockingLineNode, LineNode};
use crate::registry::{DevNo, DeviceRegistry, NamespaceId, NodeHandle};
use crate::{DriverError, Result};

/// Undo steps run in reverse on drop unless committed
struct Rollback<'a> {
    steps: Vec<(&'static str, Box<dyn FnOnce() + 'a>)>,
}

impl<'a> Rollback<'a> {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn push(&mut self, what: &'static str, undo: impl FnOnce() + 'a) {
        self.steps.push((what, Box::new(undo)));
    }

    fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        while let Some((what, undo)) = self.steps.pop() {
            log::debug!("rollback: {}", what);
            undo();
        }
    }
}

/// One line bound to a fixed device number
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticLineConfig {
    /// Node name, also used as the namespace name
    pub name: String,
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    pub line: LineId,
    pub direction: Direction,
    /// Edge that wakes blocked readers; input lines only
    #[serde(default)]
    pub trigger: Option<EdgeTrigger>,
}

impl StaticLineConfig {
    /// LED output on line 26, major 62
    pub fn led() -> Self {
        Self {
            name: "led".into(),
            major: 62,
            minor: 0,
            line: 26,
            direction: Direction::Output,
            trigger: None,
        }
    }

    /// Push button on line 16, major 24, waking readers on the falling edge
    pub fn switch() -> Self {
        Self {
            name: "sw1".into(),
            major: 24,
            minor: 0,
            line: 16,
            direction: Direction::Input,
            trigger: Some(EdgeTrigger::Falling),
        }
    }
}

enum StaticTarget {
    Plain(Arc<LineNode>),
    Blocking(Arc<BlockingLineNode>),
}

impl StaticTarget {
    fn line(&self) -> &LineResource {
        match self {
            StaticTarget::Plain(node) => node.line(),
            StaticTarget::Blocking(node) => node.line(),
        }
    }
}

/// Single-line driver at a fixed device number
pub struct StaticLineDriver {
    registry: Arc<DeviceRegistry>,
    chip: Arc<dyn GpioChip>,
    config: StaticLineConfig,
    namespace: NamespaceId,
    handle: NodeHandle,
    target: StaticTarget,
    irq: Option<u32>,
    active: bool,
}

impl StaticLineDriver {
    /// Claim the line, reserve the device number and create the node
    ///
    /// # Errors
    /// - [`DriverError::InvalidOperation`] for a trigger on an output line
    /// - [`DriverError::Busy`] if the line is claimed elsewhere
    /// - [`DriverError::AddressInUse`] if the device number is taken
    pub fn init(
        registry: Arc<DeviceRegistry>,
        chip: Arc<dyn GpioChip>,
        config: StaticLineConfig,
        broker: &BrokerConfig,
    ) -> Result<Self> {
        if config.trigger.is_some() && config.direction != Direction::Input {
            return Err(DriverError::InvalidOperation("interrupt trigger needs an input line"));
        }

        // Declared before the rollback so it is released last
        let mut line = LineResource::acquire(Arc::clone(&chip), config.line)?;
        let mut rollback = Rollback::new();

        line.set_direction(config.direction)?;

        let namespace = registry.register_static(&config.name, config.major, config.minor, 1)?;
        rollback.push("unregister namespace", {
            let registry = &registry;
            move || registry.unregister_namespace(namespace)
        });

        let (target, irq) = match config.trigger {
            Some(trigger) => {
                let sync = Arc::new(InterruptSynchronizer::new(broker.irq.cancel_poll()));
                let irq = chip.request_irq(config.line, trigger, sync.handler())?;
                log::info!("{}: line {} mapped to irq {}", config.name, config.line, irq);
                rollback.push("free irq", {
                    let chip = &chip;
                    let id = config.line;
                    move || {
                        if let Err(err) = chip.free_irq(id) {
                            log::warn!("line {}: {}", id, err);
                        }
                    }
                });
                (StaticTarget::Blocking(Arc::new(BlockingLineNode::new(line, sync))), Some(irq))
            }
            None => (
                StaticTarget::Plain(Arc::new(LineNode::new(line, broker.gpio.max_write_len))),
                None,
            ),
        };

        let handle = match &target {
            StaticTarget::Plain(node) => registry.create_node(namespace, config.minor, &config.name, node.clone()),
            StaticTarget::Blocking(node) => registry.create_node(namespace, config.minor, &config.name, node.clone()),
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                // Undo before `target` drops and releases the line
                drop(rollback);
                return Err(err);
            }
        };
        rollback.commit();

        Ok(Self {
            registry,
            chip,
            config,
            namespace,
            handle,
            target,
            irq,
            active: true,
        })
    }

    pub fn devno(&self) -> DevNo {
        self.handle.devno()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Interrupt number, for drivers with a trigger
    pub fn irq(&self) -> Option<u32> {
        self.irq
    }

    /// Synchronizer behind the node, for drivers with a trigger
    pub fn synchronizer(&self) -> Option<&Arc<InterruptSynchronizer>> {
        match &self.target {
            StaticTarget::Blocking(node) => Some(node.synchronizer()),
            StaticTarget::Plain(_) => None,
        }
    }

    /// Tear everything down; later calls do nothing
    pub fn exit(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        self.registry.destroy_node(self.handle);
        if self.irq.is_some() {
            if let Err(err) = self.chip.free_irq(self.config.line) {
                log::warn!("{}: {}", self.config.name, err);
            }
        }
        self.registry.unregister_namespace(self.namespace);
        if let Err(err) = self.target.line().release() {
            log::warn!("{}: {}", self.config.name, err);
        }
        log::info!("{}: exit", self.config.name);
    }
}

impl Drop for StaticLineDriver {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Summary of one attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReport {
    /// Lines that now have a node
    pub attached: usize,
    /// Manifest entries rejected by the parser
    pub skipped: Vec<DriverError>,
}

/// Manifest-driven multi-line driver
pub struct PlatformGpioDriver {
    registry: Arc<DeviceRegistry>,
    chip: Arc<dyn GpioChip>,
    config: GpioConfig,
    namespace: Option<NamespaceId>,
    probed: Option<ProbedLines>,
}

impl PlatformGpioDriver {
    /// Reserve the namespace; no lines are touched until attach
    pub fn init(registry: Arc<DeviceRegistry>, chip: Arc<dyn GpioChip>, config: GpioConfig) -> Result<Self> {
        let namespace = registry.register_namespace(&config.namespace, config.max_lines)?;

        Ok(Self {
            registry,
            chip,
            config,
            namespace: Some(namespace),
            probed: None,
        })
    }

    /// Whether a manifest with this `compatible` string is handled here
    pub fn matches(&self, compatible: &str) -> bool {
        self.config.compatible.iter().any(|c| c == compatible)
    }

    /// Probe every well-formed entry of `manifest`
    ///
    /// Malformed entries are skipped and listed in the report. If any
    /// well-formed entry fails to probe, nothing stays attached.
    ///
    /// # Errors
    /// - [`DriverError::Incompatible`] if the manifest does not match
    /// - [`DriverError::InvalidOperation`] if already attached or exited
    /// - the first probe error
    pub fn on_attach(&mut self, manifest: &Manifest) -> Result<AttachReport> {
        let compatible = manifest.compatible().unwrap_or_default();
        if !self.matches(compatible) {
            return Err(DriverError::Incompatible(compatible.to_owned()));
        }
        if self.probed.is_some() {
            return Err(DriverError::InvalidOperation("driver already attached"));
        }
        let namespace = self
            .namespace
            .ok_or(DriverError::InvalidOperation("driver has exited"))?;

        let parsed = manifest.parse();
        let probed = enumerator::probe(&self.registry, namespace, &self.chip, &parsed.entries, &self.config)?;
        log::info!("{}: attached {} lines", compatible, probed.len());

        let report = AttachReport {
            attached: probed.len(),
            skipped: parsed.errors,
        };
        self.probed = Some(probed);
        Ok(report)
    }

    /// Remove every attached line; safe to call when nothing is attached
    pub fn on_detach(&mut self) {
        if let Some(probed) = self.probed.take() {
            log::info!("detaching {} lines", probed.len());
            probed.remove(&self.registry);
        }
    }

    /// Device numbers of attached lines, in manifest order
    pub fn devnos(&self) -> Vec<DevNo> {
        self.probed.as_ref().map(ProbedLines::devnos).unwrap_or_default()
    }

    pub fn is_attached(&self) -> bool {
        self.probed.is_some()
    }

    /// Detach and release the namespace; later calls do nothing
    pub fn exit(&mut self) {
        self.on_detach();
        if let Some(namespace) = self.namespace.take() {
            self.registry.unregister_namespace(namespace);
        }
    }
}

impl Drop for PlatformGpioDriver {
    fn drop(&mut self) {
        self.exit();
    }
}

struct BoundBus {
    engine: Arc<BusEngine>,
    handles: Vec<NodeHandle>,
}

/// SPI device split into channel nodes
pub struct SpiChannelDriver {
    registry: Arc<DeviceRegistry>,
    config: SpiConfig,
    namespace: Option<NamespaceId>,
    bound: Option<BoundBus>,
}

impl SpiChannelDriver {
    /// Reserve `max_channels` minors
    pub fn init(registry: Arc<DeviceRegistry>, config: SpiConfig) -> Result<Self> {
        let namespace = registry.register_namespace(&config.namespace, config.max_channels)?;

        Ok(Self {
            registry,
            config,
            namespace: Some(namespace),
            bound: None,
        })
    }

    /// Set up `device` and create one node per configured channel name
    ///
    /// # Errors
    /// - [`DriverError::AddressInUse`] if a device is already bound
    /// - [`DriverError::NoSuchDevice`] if more channels are named than
    ///   `max_channels` allows
    /// - [`DriverError::TransferFailed`] if device setup fails
    pub fn probe(&mut self, device: Box<dyn SpiDevice>) -> Result<()> {
        let namespace = self
            .namespace
            .ok_or(DriverError::InvalidOperation("driver has exited"))?;
        let info = self.registry.namespace_info(namespace)?;

        if self.bound.is_some() {
            return Err(DriverError::AddressInUse {
                major: info.major,
                first_minor: info.first_minor,
                count: info.count,
            });
        }

        let wanted = self.config.channel_names.len();
        if wanted > self.config.max_channels as usize {
            log::error!("{}: {} channels named, only {} allowed", info.name, wanted, self.config.max_channels);
            return Err(DriverError::NoSuchDevice {
                major: info.major,
                minor: info.first_minor + self.config.max_channels,
            });
        }

        let modalias = device.modalias().to_owned();
        let engine = Arc::new(BusEngine::new(device, self.config.bits_per_word)?);

        let mut handles: Vec<NodeHandle> = Vec::with_capacity(wanted);
        let mut rollback = Rollback::new();
        for name in &self.config.channel_names {
            let channel = engine.attach_channel(name);
            let label = format!("{}{}-{}", self.config.class, channel, name);
            let node = Arc::new(BusChannelNode::new(engine.clone(), channel, self.config.max_write_len));

            let handle = self
                .registry
                .create_node(namespace, info.first_minor + channel as u32, &label, node)?;
            rollback.push("destroy channel node", {
                let registry = &self.registry;
                move || {
                    registry.destroy_node(handle);
                }
            });
            handles.push(handle);
        }
        rollback.commit();

        log::info!("{}: {} channels on {}", info.name, handles.len(), modalias);
        self.bound = Some(BoundBus { engine, handles });
        Ok(())
    }

    /// Destroy the channel nodes and drop the device
    pub fn remove(&mut self) {
        if let Some(bound) = self.bound.take() {
            for handle in bound.handles.iter().rev() {
                self.registry.destroy_node(*handle);
            }
            log::info!("{}: removed {} channels", self.config.namespace, bound.handles.len());
        }
    }

    pub fn engine(&self) -> Option<&Arc<BusEngine>> {
        self.bound.as_ref().map(|bound| &bound.engine)
    }

    /// Device number of a channel node
    pub fn channel_devno(&self, channel: usize) -> Option<DevNo> {
        self.bound
            .as_ref()
            .and_then(|bound| bound.handles.get(channel))
            .map(NodeHandle::devno)
    }

    pub fn exit(&mut self) {
        self.remove();
        if let Some(namespace) = self.namespace.take() {
            self.registry.unregister_namespace(namespace);
        }
    }
}

impl Drop for SpiChannelDriver {
    fn drop(&mut self) {
        self.exit();
    }
}
