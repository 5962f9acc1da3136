//! Hardware Enumerator - Manifest entries to registered line nodes
//!
//! [`probe`] turns the decoded entries of a manifest into one claimed line and
//! one device node per entry. The node for entry `i` sits at
//! `first_minor + i` and is named `<class><node_base + i>`.
//!
//! Acquisition is all or nothing: if any entry fails, the entries already
//! handled are unwound in reverse before the error is returned, leaving the
//! chip and the registry exactly as they were.

use std::sync::Arc;

use crate::config::GpioConfig;
use crate::line::{GpioChip, LineResource};
use crate::manifest::ManifestEntry;
use crate::node::LineNode;
use crate::registry::{DevNo, DeviceRegistry, NamespaceId, NodeHandle};
use crate::{DriverError, Result};

struct ProbedLine {
    handle: NodeHandle,
    label: String,
    node: Arc<LineNode>,
}

/// Lines and nodes created by a successful [`probe`]
///
/// Hand it back to [`remove`](ProbedLines::remove) at detach. Dropping it
/// without doing so leaves the nodes registered.
#[derive(Default)]
pub struct ProbedLines {
    lines: Vec<ProbedLine>,
}

impl ProbedLines {
    /// Number of probed entries
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Device numbers in probe order
    pub fn devnos(&self) -> Vec<DevNo> {
        self.lines.iter().map(|line| line.handle.devno()).collect()
    }

    /// Node names in probe order
    pub fn labels(&self) -> Vec<&str> {
        self.lines.iter().map(|line| line.label.as_str()).collect()
    }

    /// Tear down every probed entry
    ///
    /// All nodes are destroyed first, newest first, so nothing can reach a
    /// line once it is released. Lines are then released in the same order.
    pub fn remove(mut self, registry: &DeviceRegistry) {
        self.unwind(registry);
    }

    fn unwind(&mut self, registry: &DeviceRegistry) {
        for line in self.lines.iter().rev() {
            registry.destroy_node(line.handle);
        }

        for line in self.lines.drain(..).rev() {
            if let Err(err) = line.node.line().release() {
                log::warn!("{}: {}", line.label, err);
            }
        }
    }
}

/// Unwinds a partial probe unless disarmed
struct ProbeGuard<'a> {
    registry: &'a DeviceRegistry,
    probed: ProbedLines,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(registry: &'a DeviceRegistry) -> Self {
        Self {
            registry,
            probed: ProbedLines::default(),
            armed: true,
        }
    }

    fn disarm(mut self) -> ProbedLines {
        self.armed = false;
        std::mem::take(&mut self.probed)
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed && !self.probed.is_empty() {
            log::warn!("probe failed, rolling back {} entries", self.probed.len());
            self.probed.unwind(self.registry);
        }
    }
}

/// Claim a line and create a node for every entry, in order
///
/// # Arguments
/// * `namespace` - namespace the nodes are created in; its first minor is
///   the base for entry indices
/// * `config` - node naming and write limits
///
/// # Errors
/// The first acquisition, direction or registration error. Everything
/// created before it has been undone by the time it is returned.
pub fn probe(
    registry: &DeviceRegistry,
    namespace: NamespaceId,
    chip: &Arc<dyn GpioChip>,
    entries: &[ManifestEntry],
    config: &GpioConfig,
) -> Result<ProbedLines> {
    let first_minor = registry.namespace_info(namespace)?.first_minor;
    let mut guard = ProbeGuard::new(registry);

    for entry in entries {
        let (minor, number) = u32::try_from(entry.index)
            .ok()
            .and_then(|offset| Some((first_minor.checked_add(offset)?, config.node_base.checked_add(offset)?)))
            .ok_or_else(|| DriverError::InvalidInput(format!("entry {} is past the numbering range", entry.index)))?;
        let label = format!("{}{}", config.class, number);

        let mut line = LineResource::acquire(Arc::clone(chip), entry.line)?;
        line.set_direction(entry.direction)?;

        let node = Arc::new(LineNode::new(line, config.max_write_len));
        // On failure the line is released when `node` drops
        let handle = registry.create_node(namespace, minor, &label, node.clone())?;

        log::info!("{}: line {} ({}) at {}", label, entry.line, entry.direction, handle.devno());
        guard.probed.lines.push(ProbedLine { handle, label, node });
    }

    Ok(guard.disarm())
}
