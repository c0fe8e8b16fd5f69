use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use scopeflow_core::config::ConfigBuilder;
use scopeflow_core::logging;
use scopeflow_core::types::{Id, Value};
use scopeflow_devices::devices::{FocusDrive, Lamp, Microscope, Nosepiece};
use scopeflow_devices::protocol::{CommandHub, SharedHub, SimulatedPorts, SimulatedStand};
use scopeflow_devices::{Device, SharedDeviceRegistry};

const PORT: &str = "COM7";

fn main() -> anyhow::Result<()> {
    // Optional config file as the first argument, SCOPEFLOW__* variables on top
    let mut builder = ConfigBuilder::new().with_environment_prefix("SCOPEFLOW");
    if let Some(path) = std::env::args().nth(1) {
        builder = builder.with_config_file(path);
    }
    let config = builder.build().context("Failed to load configuration")?;
    logging::init_from_config(&config.logging)?;
    scopeflow_devices::init()?;

    // An older stand that does not know the microscope type query
    let stand = SimulatedStand::new()
        .with_version("1.3")
        .without_microscope_query()
        .with_lamp_intensity(40);
    let ports = SimulatedPorts::new().with_port(PORT, stand.clone());
    let hub = SharedHub::new(CommandHub::from_config(&config, Arc::new(ports))?);

    let scope = Arc::new(Microscope::new(Id::from("scope"), hub.clone(), &config.hub));
    let lamp = Arc::new(Lamp::new(Id::from("lamp"), hub.clone(), &config.lamp));
    let focus = Arc::new(FocusDrive::new(Id::from("z"), hub.clone(), &config.focus));
    let turret = Arc::new(Nosepiece::new(Id::from("turret"), hub.clone(), &config.nosepiece)?);

    let registry = SharedDeviceRegistry::new();
    registry.registry().register_device(scope.clone())?;
    registry.registry().register_device(lamp.clone())?;
    registry.registry().register_device(focus.clone())?;
    registry.registry().register_device(turret.clone())?;

    if config.serial.port.is_none() {
        scope.write("Port", Value::from(PORT))?;
    }
    registry.registry().initialize_all_devices()?;
    let microscope = scope.read("Microscope")?;
    let version = scope.read("Firmware version")?;
    info!(microscope = %microscope, version = %version, "Stand ready");

    lamp.set_intensity(180)?;
    lamp.set_open(true)?;
    let intensity = lamp.intensity()?;
    info!("Lamp open at {}", intensity);

    focus.set_position_um(1000.0)?;
    focus.set_relative_position_um(-12.5)?;
    let position = focus.position_um()?;
    info!("Focus at {:.1} µm", position);

    let objective = turret.position()?;
    let label = turret.label()?;
    info!("Objective {} ({})", objective, label);

    lamp.set_open(false)?;
    registry.registry().shutdown_all_devices()?;
    info!("Stand received {} frames", stand.written_frames().len());

    Ok(())
}
