//! End-to-end scenarios against the simulated stand.

use std::sync::Arc;

use scopeflow_core::config::Config;
use scopeflow_core::types::{Id, Value};
use scopeflow_devices::device::{Device, DeviceError, DeviceKind, DeviceState};
use scopeflow_devices::devices::{FocusDrive, Lamp, Microscope, Nosepiece};
use scopeflow_devices::protocol::{CommandHub, SharedHub, SimulatedPorts, SimulatedStand};
use scopeflow_devices::registry::DeviceRegistry;

fn shared_hub(config: &Config, ports: SimulatedPorts) -> SharedHub {
    SharedHub::new(CommandHub::from_config(config, Arc::new(ports)).unwrap())
}

#[test_log::test]
fn test_com7_stand_without_type_query() {
    let stand = SimulatedStand::new()
        .with_version("1.3")
        .without_microscope_query();
    let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
    let config = Config::default();
    let hub = shared_hub(&config, ports);

    let scope = Microscope::new(Id::from("scope"), hub.clone(), &config.hub);
    scope.write("Port", Value::from("COM7")).unwrap();
    scope.initialize().unwrap();

    assert_eq!(scope.read("Firmware version").unwrap(), Value::from("1.3"));
    assert_eq!(scope.read("Microscope").unwrap(), Value::from("RxE"));
    assert_eq!(stand.frames_starting_with("50025"), vec!["50025"]);
    assert_eq!(stand.frames_starting_with("50026"), vec!["50026"]);

    // RxE stands top out at 1175 µm/s
    let focus = FocusDrive::new(Id::from("z"), hub, &config.focus);
    focus.initialize().unwrap();
    focus.move_at_speed(1175.0).unwrap();
    assert_eq!(stand.z_speed(), 255);
}

#[test_log::test]
fn test_port_from_configuration() {
    let stand = SimulatedStand::new();
    let ports = SimulatedPorts::new().with_port("/dev/ttyUSB0", stand.clone());
    let mut config = Config::default();
    config.serial.port = Some("/dev/ttyUSB0".to_string());
    let hub = shared_hub(&config, ports);

    let lamp = Lamp::new(Id::from("lamp"), hub.clone(), &config.lamp);
    lamp.initialize().unwrap();
    assert_eq!(hub.microscope().unwrap(), "DMRXA");
}

#[test_log::test]
fn test_initialize_without_port() {
    let config = Config::default();
    let hub = shared_hub(&config, SimulatedPorts::new());

    let focus = FocusDrive::new(Id::from("z"), hub.clone(), &config.focus);
    assert!(matches!(focus.initialize(), Err(DeviceError::PortNotSet)));
    assert_eq!(focus.state(), DeviceState::Error);
    assert!(!hub.is_connected().unwrap());
}

#[test_log::test]
fn test_silent_stand_reports_no_answer() {
    let stand = SimulatedStand::new();
    stand.drop_answers(2);
    let ports = SimulatedPorts::new().with_port("COM1", stand.clone());
    let mut config = Config::default();
    config.serial.port = Some("COM1".to_string());
    let hub = shared_hub(&config, ports);

    let scope = Microscope::new(Id::from("scope"), hub.clone(), &config.hub);
    let err = scope.initialize().unwrap_err();
    assert!(matches!(err, DeviceError::NoAnswer(_)));
    assert!(err.to_string().contains("serial port"));
    assert_eq!(stand.frames_starting_with("50025").len(), 2);

    // one dropped answer is recovered by the version retry
    stand.drop_answers(1);
    scope.shutdown().unwrap();
    scope.initialize().unwrap();
    assert!(hub.is_connected().unwrap());
}

#[test_log::test]
fn test_lamp_applies_cached_intensity_once() {
    let stand = SimulatedStand::new();
    let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
    let mut config = Config::default();
    config.serial.port = Some("COM7".to_string());
    let hub = shared_hub(&config, ports);

    let lamp = Lamp::new(Id::from("lamp"), hub, &config.lamp);
    lamp.initialize().unwrap();

    lamp.set_intensity(150).unwrap();
    assert!(stand.frames_starting_with("50006").is_empty());

    lamp.set_open(true).unwrap();
    assert_eq!(stand.frames_starting_with("50006"), vec!["50006150"]);
    assert_eq!(stand.lamp_intensity(), 150);
}

#[test_log::test]
fn test_turret_between_positions() {
    let stand = SimulatedStand::new();
    let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
    let mut config = Config::default();
    config.serial.port = Some("COM7".to_string());
    let hub = shared_hub(&config, ports);

    let turret = Nosepiece::new(Id::from("turret"), hub, &config.nosepiece).unwrap();
    turret.initialize().unwrap();
    assert_eq!(turret.position().unwrap(), 0);

    stand.set_nosepiece_position(0);
    assert!(matches!(turret.position(), Err(DeviceError::InvalidPosition(_))));

    stand.set_nosepiece_position(1);
    assert_eq!(turret.read("State").unwrap(), Value::Integer(0));
}

#[test_log::test]
fn test_mismatched_echo_leaves_state_alone() {
    let stand = SimulatedStand::new();
    let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
    let mut config = Config::default();
    config.serial.port = Some("COM7".to_string());
    let hub = shared_hub(&config, ports);

    let lamp = Lamp::new(Id::from("lamp"), hub.clone(), &config.lamp);
    lamp.initialize().unwrap();
    lamp.set_intensity(80).unwrap();

    stand.corrupt_answers(1);
    assert!(matches!(lamp.set_open(true), Err(DeviceError::UnexpectedAnswer(_))));
    assert!(!lamp.is_open().unwrap());
    assert!(hub.is_connected().unwrap());

    stand.inject_stale(b"50009255\r");
    assert_eq!(lamp.intensity().unwrap(), 80);
    lamp.set_open(true).unwrap();
    assert!(lamp.is_open().unwrap());
}

#[test_log::test]
fn test_whole_stand_through_registry() {
    let stand = SimulatedStand::new();
    let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
    let mut config = Config::default();
    config.serial.port = Some("COM7".to_string());
    let hub = shared_hub(&config, ports);

    let registry = DeviceRegistry::new();
    for kind in DeviceKind::ALL {
        registry
            .create_device(kind.device_name(), &kind.to_string(), &hub, &config)
            .unwrap();
    }
    registry.initialize_all_devices().unwrap();
    assert_eq!(stand.frames_starting_with("50025").len(), 1);

    let focus = registry
        .get_devices_by_kind(DeviceKind::FocusDrive)
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(focus.read("Step size").unwrap(), Value::Float(0.1));

    registry.shutdown_all_devices().unwrap();
    assert!(!hub.is_connected().unwrap());
    registry.shutdown_all_devices().unwrap();
}
