//! Integration tests for the complete device broker
//!
//! These tests drive end-to-end workflows through the public API:
//! - Manifest attach, node I/O and detach
//! - Rollback of a probe that fails part way
//! - Interrupt-driven blocking reads
//! - SPI channel nodes

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dev_broker::sim::{SimGpioChip, SimSpiDevice, SimSpiPeer};
use dev_broker::*;

fn gpio() -> (Arc<DeviceRegistry>, Arc<SimGpioChip>, Arc<dyn GpioChip>) {
    let sim = Arc::new(SimGpioChip::new("gpiochip0", 54));
    let chip: Arc<dyn GpioChip> = sim.clone();
    (Arc::new(DeviceRegistry::new()), sim, chip)
}

fn wait_for_reader(sync: &InterruptSynchronizer) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sync.waiters() == 0 {
        assert!(Instant::now() < deadline, "reader never blocked");
        thread::yield_now();
    }
}

/// Manifest [16 in, 21 out]: write/read the output, read the input, detach
#[test]
fn test_manifest_end_to_end() {
    let (registry, sim, chip) = gpio();
    let mut driver = PlatformGpioDriver::init(registry.clone(), chip, GpioConfig::default()).unwrap();

    let manifest = Manifest::from_toml_str(
        r#"
        compatible = "ase,plat_drv"

        [[gpios]]
        line = 16
        direction = 0

        [[gpios]]
        line = 21
        direction = 1
        "#,
    )
    .unwrap();

    let report = driver.on_attach(&manifest).unwrap();
    assert_eq!(report.attached, 2);
    assert!(report.skipped.is_empty());

    let input = registry.lookup("gpio100").unwrap();
    let output = registry.lookup("gpio101").unwrap();
    assert_eq!(output.minor, input.minor + 1);

    // Output loopback
    assert_eq!(registry.write(output, b"1").unwrap(), 1);
    assert_eq!(registry.read(output, 2).unwrap(), b"1\0".to_vec());

    // Input follows the pin; writes are refused at the node
    sim.drive(16, true).unwrap();
    assert_eq!(registry.read(input, 2).unwrap(), b"1\0".to_vec());
    assert_eq!(registry.read(input, 1).unwrap(), b"1".to_vec());
    assert!(matches!(registry.write(input, b"1"), Err(DriverError::InvalidOperation(_))));

    driver.on_detach();

    assert!(matches!(registry.read(input, 2), Err(DriverError::NoSuchDevice { .. })));
    assert!(matches!(registry.read(output, 2), Err(DriverError::NoSuchDevice { .. })));
    assert!(sim.claimed_lines().is_empty());
}

/// A probe failing at entry k leaves claims and nodes as they were
#[test]
fn test_probe_failure_restores_state() {
    let (registry, sim, chip) = gpio();
    let squatter = LineResource::acquire(chip.clone(), 26).unwrap();
    let mut driver = PlatformGpioDriver::init(registry.clone(), chip, GpioConfig::default()).unwrap();

    let before = sim.claimed_lines();
    let manifest = Manifest::from_entries("ase,plat_drv", &[(16, 0), (21, 1), (26, 1), (5, 0)]);

    assert!(matches!(driver.on_attach(&manifest), Err(DriverError::Busy { line: 26 })));
    assert_eq!(sim.claimed_lines(), before);
    assert!(registry.nodes().is_empty());

    // Detach after a failed attach is harmless, and a later attach works
    driver.on_detach();
    squatter.release().unwrap();
    assert_eq!(driver.on_attach(&manifest).unwrap().attached, 4);
    assert_eq!(sim.claimed_lines(), vec![5, 16, 21, 26]);
}

/// Names stay stable across detach/attach cycles
#[test]
fn test_reattach_keeps_addresses() {
    let (registry, _sim, chip) = gpio();
    let mut driver = PlatformGpioDriver::init(registry.clone(), chip, GpioConfig::default()).unwrap();
    let manifest = Manifest::from_entries("ase,plat_drv", &[(16, 0), (21, 1)]);

    driver.on_attach(&manifest).unwrap();
    let first = registry.nodes();
    driver.on_detach();
    driver.on_attach(&manifest).unwrap();

    assert_eq!(registry.nodes(), first);
}

/// One edge, one blocked reader: exactly one wake carrying the post-edge value
#[test]
fn test_interrupt_switch() {
    let (registry, sim, chip) = gpio();
    sim.drive(16, true).unwrap();

    let switch =
        StaticLineDriver::init(registry.clone(), chip, StaticLineConfig::switch(), &BrokerConfig::default()).unwrap();
    let devno = registry.lookup("sw1").unwrap();
    assert_eq!(devno, switch.devno());
    let sync = switch.synchronizer().unwrap().clone();

    let reader = {
        let registry = registry.clone();
        thread::spawn(move || registry.read(devno, 16))
    };
    wait_for_reader(&sync);

    sim.drive(16, false).unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), b"0\0".to_vec());
    assert!(!sync.is_pending());

    // Two edges before any reader coalesce into a single pending wake
    sim.drive(16, true).unwrap();
    sim.drive(16, false).unwrap();
    sim.drive(16, true).unwrap();
    sim.drive(16, false).unwrap();
    assert!(sync.is_pending());
    assert_eq!(registry.read(devno, 16).unwrap(), b"0\0".to_vec());
    assert!(!sync.is_pending());

    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(registry.read_cancellable(devno, 16, &cancel), Err(DriverError::Cancelled)));
}

/// LED and switch drivers coexist on distinct fixed majors
#[test]
fn test_static_drivers_from_config() {
    let (registry, sim, chip) = gpio();
    let config = BrokerConfig::from_toml_str(
        r#"
        [[static_lines]]
        name = "led"
        major = 62
        line = 26
        direction = "output"

        [[static_lines]]
        name = "sw1"
        major = 24
        line = 16
        direction = "input"
        trigger = "falling"
        "#,
    )
    .unwrap();

    let drivers: Vec<StaticLineDriver> = config
        .static_lines
        .iter()
        .map(|line| StaticLineDriver::init(registry.clone(), chip.clone(), line.clone(), &config).unwrap())
        .collect();

    assert_eq!(registry.lookup("led"), Some(DevNo::new(62, 0)));
    assert_eq!(registry.lookup("sw1"), Some(DevNo::new(24, 0)));
    assert_eq!(sim.claimed_lines(), vec![16, 26]);

    // A second LED driver collides on the line before the device number
    assert!(matches!(
        StaticLineDriver::init(registry.clone(), chip.clone(), StaticLineConfig::led(), &config),
        Err(DriverError::Busy { line: 26 })
    ));

    drop(drivers);
    assert!(sim.claimed_lines().is_empty());
    assert!(registry.nodes().is_empty());
}

/// Four channels numbered 0-3; channel 2 reads the peer byte, channel 4 is unknown
#[test]
fn test_bus_channels() {
    let registry = Arc::new(DeviceRegistry::new());
    let peer = SimSpiPeer::new();
    let mut driver = SpiChannelDriver::init(registry.clone(), SpiConfig::default()).unwrap();
    driver.probe(Box::new(SimSpiDevice::new("psoc", 0, peer.clone()))).unwrap();

    let engine = driver.engine().unwrap().clone();
    assert_eq!(engine.channel_count(), 4);
    assert_eq!(peer.bits_per_word(), Some(8));

    peer.place(0x5a);
    assert_eq!(engine.transfer(2, None).unwrap(), Some(0x5a));
    assert!(matches!(engine.transfer(4, None), Err(DriverError::NoSuchChannel { channel: 4 })));

    let sl = registry.lookup("spi_drv2-sl").unwrap();
    assert_eq!(registry.read(sl, 8).unwrap(), b"90\0".to_vec());
    assert_eq!(registry.write(sl, b"12").unwrap(), 2);
    assert_eq!(peer.received(), vec![12]);

    peer.fail_next("bus fault");
    assert!(matches!(registry.read(sl, 8), Err(DriverError::TransferFailed(_))));

    driver.remove();
    assert!(matches!(registry.read(sl, 8), Err(DriverError::NoSuchDevice { .. })));
}

/// Registries are independent contexts
#[test]
fn test_independent_registries() {
    let (first, _sim_a, chip_a) = gpio();
    let (second, _sim_b, chip_b) = gpio();

    let mut a = PlatformGpioDriver::init(first.clone(), chip_a, GpioConfig::default()).unwrap();
    let mut b = PlatformGpioDriver::init(second.clone(), chip_b, GpioConfig::default()).unwrap();
    let manifest = Manifest::from_entries("ase,plat_drv", &[(16, 0)]);

    a.on_attach(&manifest).unwrap();
    b.on_attach(&manifest).unwrap();
    assert_eq!(first.lookup("gpio100"), second.lookup("gpio100"));

    a.exit();
    assert!(first.nodes().is_empty());
    assert_eq!(second.nodes().len(), 1);
}
