//! Device Registry - Device number namespaces and node routing
//!
//! The registry plays the part of the character-device table: drivers reserve
//! a namespace (a major number plus a contiguous minor range), bind a
//! [`DeviceFile`] to individual minors, and consumers reach those targets
//! through [`DeviceRegistry::dispatch`].
//!
//! # Routing
//! Each namespace keeps an arena of slots indexed by `minor - first_minor`.
//! A minor is bounds-checked against the namespace before any slot is touched;
//! out-of-range and unbound minors both report
//! [`DriverError::NoSuchDevice`].
//!
//! # Teardown
//! Every node carries a gate lock. Dispatch holds the gate shared for the
//! length of the operation, and [`DeviceRegistry::destroy_node`] takes it
//! exclusively after asking the target to quiesce, so a node is never torn
//! down under an in-flight operation.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};

use crossbeam::sync::{ShardedLock, ShardedLockReadGuard, ShardedLockWriteGuard};

use crate::irq::CancelToken;
use crate::node::NodeCaps;
use crate::{DriverError, Result};

/// Highest dynamically assigned major; allocation walks downwards
pub const DYNAMIC_MAJOR_END: u32 = 254;

/// Lowest dynamically assigned major
pub const DYNAMIC_MAJOR_START: u32 = 234;

/// Minor numbers are 20 bits wide
pub const MINOR_LIMIT: u32 = 1 << 20;

/// Device number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevNo {
    pub major: u32,
    pub minor: u32,
}

impl DevNo {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DevNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Registry-local namespace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(u32);

/// Snapshot of a registered namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub major: u32,
    pub first_minor: u32,
    pub count: u32,
    /// Minors currently bound to a node
    pub bound: usize,
}

/// Handle to a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    namespace: NamespaceId,
    devno: DevNo,
}

impl NodeHandle {
    pub fn devno(&self) -> DevNo {
        self.devno
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }
}

/// Operations a bound node implements
pub trait DeviceFile: Send + Sync {
    /// Operations this node accepts; dispatch refuses the rest
    fn caps(&self) -> NodeCaps;

    /// Produce at most `count` bytes
    ///
    /// Blocking nodes must return [`DriverError::Cancelled`] once `cancel`
    /// fires or the node is quiesced.
    fn read(&self, count: usize, cancel: &CancelToken) -> Result<Vec<u8>>;

    /// Consume a payload, returning the number of bytes taken
    fn write(&self, _data: &[u8]) -> Result<usize> {
        Err(DriverError::InvalidOperation("node is read-only"))
    }

    /// Release any reader parked inside this node
    ///
    /// Called before the node is destroyed.
    fn quiesce(&self) {}
}

/// Operation issued against a device number
#[derive(Clone, Copy)]
pub enum NodeOp<'a> {
    Open,
    Close,
    Read {
        count: usize,
        cancel: Option<&'a CancelToken>,
    },
    Write(&'a [u8]),
}

/// Result of a dispatched [`NodeOp`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeReply {
    Opened,
    Closed,
    Data(Vec<u8>),
    Written(usize),
}

struct Node {
    devno: DevNo,
    label: String,
    target: Arc<dyn DeviceFile>,
    /// `true` while the node may serve operations
    gate: ShardedLock<bool>,
}

impl Node {
    fn retire(&self) {
        self.target.quiesce();
        let mut alive = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        *alive = false;
    }
}

struct Namespace {
    id: NamespaceId,
    name: String,
    major: u32,
    first_minor: u32,
    slots: Vec<Option<Arc<Node>>>,
}

impl Namespace {
    fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn overlaps(&self, major: u32, first_minor: u32, count: u32) -> bool {
        self.major == major
            && first_minor < self.first_minor + self.count()
            && self.first_minor < first_minor + count
    }

    fn slot_index(&self, minor: u32) -> Option<usize> {
        minor
            .checked_sub(self.first_minor)
            .filter(|offset| *offset < self.count())
            .map(|offset| offset as usize)
    }

    fn info(&self) -> NamespaceInfo {
        NamespaceInfo {
            name: self.name.clone(),
            major: self.major,
            first_minor: self.first_minor,
            count: self.count(),
            bound: self.slots.iter().filter(|slot| slot.is_some()).count(),
        }
    }
}

/// Device number table and node router
///
/// A registry is an explicit context object: drivers receive it rather than
/// reaching for global state, so independent registries never interfere.
pub struct DeviceRegistry {
    namespaces: ShardedLock<Vec<Namespace>>,
    next_id: AtomicU32,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            namespaces: ShardedLock::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Reserve `count` minors under a dynamically assigned major
    ///
    /// # Errors
    /// [`DriverError::AddressInUse`] when every dynamic major is taken
    pub fn register_namespace(&self, name: &str, count: u32) -> Result<NamespaceId> {
        check_range(0, count)?;
        let mut namespaces = self.write_table();

        let major = (DYNAMIC_MAJOR_START..=DYNAMIC_MAJOR_END)
            .rev()
            .find(|major| namespaces.iter().all(|ns| ns.major != *major))
            .ok_or(DriverError::AddressInUse {
                major: 0,
                first_minor: 0,
                count,
            })?;

        let id = self.insert(&mut namespaces, name, major, 0, count);
        log::info!("{}: assigned major {}", name, major);
        Ok(id)
    }

    /// Reserve a fixed device number range
    ///
    /// # Errors
    /// [`DriverError::AddressInUse`] if any minor in the range is already
    /// reserved under `major`
    pub fn register_static(&self, name: &str, major: u32, first_minor: u32, count: u32) -> Result<NamespaceId> {
        check_range(first_minor, count)?;
        let mut namespaces = self.write_table();

        if namespaces.iter().any(|ns| ns.overlaps(major, first_minor, count)) {
            log::warn!("{}: device numbers {}:{}+{} already in use", name, major, first_minor, count);
            return Err(DriverError::AddressInUse {
                major,
                first_minor,
                count,
            });
        }

        let id = self.insert(&mut namespaces, name, major, first_minor, count);
        log::info!("{}: registered {}:{}+{}", name, major, first_minor, count);
        Ok(id)
    }

    /// Drop a namespace, destroying any nodes still bound in it
    ///
    /// Unknown ids are ignored, so teardown paths may call this freely.
    pub fn unregister_namespace(&self, id: NamespaceId) {
        let removed = {
            let mut namespaces = self.write_table();
            namespaces
                .iter()
                .position(|ns| ns.id == id)
                .map(|pos| namespaces.remove(pos))
        };

        if let Some(ns) = removed {
            for node in ns.slots.into_iter().flatten().rev() {
                log::debug!("{}: destroying leftover node {}", ns.name, node.label);
                node.retire();
            }
            log::info!("{}: released major {}", ns.name, ns.major);
        }
    }

    pub fn namespace_info(&self, id: NamespaceId) -> Result<NamespaceInfo> {
        self.read_table()
            .iter()
            .find(|ns| ns.id == id)
            .map(Namespace::info)
            .ok_or(DriverError::NoSuchDevice { major: 0, minor: 0 })
    }

    /// Bind `target` to `minor` and make it visible under `label`
    ///
    /// # Errors
    /// - [`DriverError::NoSuchDevice`] if the namespace is gone or `minor`
    ///   is outside it
    /// - [`DriverError::AddressInUse`] if the minor or the label is taken
    pub fn create_node(
        &self,
        namespace: NamespaceId,
        minor: u32,
        label: &str,
        target: Arc<dyn DeviceFile>,
    ) -> Result<NodeHandle> {
        let mut namespaces = self.write_table();

        if namespaces
            .iter()
            .flat_map(|ns| ns.slots.iter().flatten())
            .any(|node| node.label == label)
        {
            return Err(DriverError::AddressInUse {
                major: 0,
                first_minor: minor,
                count: 1,
            });
        }

        let ns = namespaces
            .iter_mut()
            .find(|ns| ns.id == namespace)
            .ok_or(DriverError::NoSuchDevice { major: 0, minor })?;
        let devno = DevNo::new(ns.major, minor);
        let index = ns.slot_index(minor).ok_or(DriverError::NoSuchDevice {
            major: ns.major,
            minor,
        })?;

        let slot = &mut ns.slots[index];
        if slot.is_some() {
            return Err(DriverError::AddressInUse {
                major: ns.major,
                first_minor: minor,
                count: 1,
            });
        }

        *slot = Some(Arc::new(Node {
            devno,
            label: label.to_owned(),
            target,
            gate: ShardedLock::new(true),
        }));

        log::info!("{}: created node {} at {}", ns.name, label, devno);
        Ok(NodeHandle { namespace, devno })
    }

    /// Unbind a node
    ///
    /// Waits for operations already running on the node to finish; blocked
    /// readers are released through [`DeviceFile::quiesce`] first.
    ///
    /// # Returns
    /// `false` if the node was already gone
    pub fn destroy_node(&self, handle: NodeHandle) -> bool {
        let node = {
            let mut namespaces = self.write_table();
            namespaces
                .iter_mut()
                .find(|ns| ns.id == handle.namespace)
                .and_then(|ns| {
                    let index = ns.slot_index(handle.devno.minor)?;
                    ns.slots[index].take()
                })
        };

        match node {
            Some(node) => {
                node.retire();
                log::info!("destroyed node {} at {}", node.label, node.devno);
                true
            }
            None => false,
        }
    }

    /// Route an operation to the node bound at `devno`
    ///
    /// # Errors
    /// - [`DriverError::NoSuchDevice`] for unbound, out-of-range or
    ///   destroyed nodes
    /// - [`DriverError::InvalidOperation`] if the node lacks the capability
    /// - whatever the target reports
    pub fn dispatch(&self, devno: DevNo, op: NodeOp<'_>) -> Result<NodeReply> {
        let node = self.resolve(devno)?;
        let alive = node.gate.read().unwrap_or_else(PoisonError::into_inner);
        if !*alive {
            return Err(DriverError::NoSuchDevice {
                major: devno.major,
                minor: devno.minor,
            });
        }

        let caps = node.target.caps();
        match op {
            NodeOp::Open => {
                log::debug!("opening {} [major, minor]: {}, {}", node.label, devno.major, devno.minor);
                Ok(NodeReply::Opened)
            }
            NodeOp::Close => {
                log::debug!("closing {} [major, minor]: {}, {}", node.label, devno.major, devno.minor);
                Ok(NodeReply::Closed)
            }
            NodeOp::Read { count, cancel } => {
                if !caps.contains(NodeCaps::READ) {
                    return Err(DriverError::InvalidOperation("node is write-only"));
                }
                let data = match cancel {
                    Some(cancel) => node.target.read(count, cancel)?,
                    None => node.target.read(count, &CancelToken::new())?,
                };
                Ok(NodeReply::Data(data))
            }
            NodeOp::Write(data) => {
                if !caps.contains(NodeCaps::WRITE) {
                    return Err(DriverError::InvalidOperation("node is read-only"));
                }
                Ok(NodeReply::Written(node.target.write(data)?))
            }
        }
    }

    /// Read through [`dispatch`](Self::dispatch)
    pub fn read(&self, devno: DevNo, count: usize) -> Result<Vec<u8>> {
        self.read_cancellable(devno, count, &CancelToken::new())
    }

    /// Read through [`dispatch`](Self::dispatch) with an external cancel
    pub fn read_cancellable(&self, devno: DevNo, count: usize, cancel: &CancelToken) -> Result<Vec<u8>> {
        match self.dispatch(devno, NodeOp::Read { count, cancel: Some(cancel) })? {
            NodeReply::Data(data) => Ok(data),
            _ => Err(DriverError::InvalidOperation("unexpected reply to read")),
        }
    }

    /// Write through [`dispatch`](Self::dispatch)
    pub fn write(&self, devno: DevNo, data: &[u8]) -> Result<usize> {
        match self.dispatch(devno, NodeOp::Write(data))? {
            NodeReply::Written(n) => Ok(n),
            _ => Err(DriverError::InvalidOperation("unexpected reply to write")),
        }
    }

    /// Find a node by label
    pub fn lookup(&self, label: &str) -> Option<DevNo> {
        self.read_table()
            .iter()
            .flat_map(|ns| ns.slots.iter().flatten())
            .find(|node| node.label == label)
            .map(|node| node.devno)
    }

    /// All bound nodes, ordered by device number
    pub fn nodes(&self) -> Vec<(DevNo, String)> {
        let mut nodes: Vec<_> = self
            .read_table()
            .iter()
            .flat_map(|ns| ns.slots.iter().flatten())
            .map(|node| (node.devno, node.label.clone()))
            .collect();
        nodes.sort();
        nodes
    }

    fn resolve(&self, devno: DevNo) -> Result<Arc<Node>> {
        self.read_table()
            .iter()
            .filter(|ns| ns.major == devno.major)
            .find_map(|ns| ns.slot_index(devno.minor).map(|index| ns.slots[index].clone()))
            .flatten()
            .ok_or(DriverError::NoSuchDevice {
                major: devno.major,
                minor: devno.minor,
            })
    }

    fn insert(&self, namespaces: &mut Vec<Namespace>, name: &str, major: u32, first_minor: u32, count: u32) -> NamespaceId {
        let id = NamespaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        namespaces.push(Namespace {
            id,
            name: name.to_owned(),
            major,
            first_minor,
            slots: (0..count).map(|_| None).collect(),
        });
        id
    }

    fn read_table(&self) -> ShardedLockReadGuard<'_, Vec<Namespace>> {
        self.namespaces.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> ShardedLockWriteGuard<'_, Vec<Namespace>> {
        self.namespaces.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_range(first_minor: u32, count: u32) -> Result<()> {
    if count == 0 || first_minor.checked_add(count).map_or(true, |end| end > MINOR_LIMIT) {
        return Err(DriverError::InvalidInput(format!(
            "minor range {}+{} is empty or exceeds {}",
            first_minor, count, MINOR_LIMIT
        )));
    }
    Ok(())
}

static_assertions::assert_impl_all!(DeviceRegistry: Send, Sync);
