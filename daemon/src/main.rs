//! driftd - SCSI target device emulator daemon
//!
//! Owns the bus, runs the per-target controllers on selections and accepts
//! control connections for attach/detach/insert/eject and introspection.

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use log::*;

use drift_core::bus::inprocess::InProcessBus;
use drift_core::bus::{ScsiBus, Signal};
use drift_core::control::types::{ControlCommand, Operation};
use drift_core::device::storage::FileRegistry;
use drift_core::devinfo::DeviceFactory;
use drift_core::executor::CommandExecutor;
use drift_core::images::ImageSupport;
use drift_core::props::PropertyStore;
use drift_core::scsi::ShutdownMode;

use server::ControlServer;

#[derive(Parser)]
#[command(
    about = "Drift - SCSI target device emulator daemon",
    version,
    long_about = None)]
struct Args {
    /// TCP port of the control channel
    #[arg(short, long, default_value_t = drift_core::DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Default image folder
    #[arg(short = 'F', long, default_value = ".")]
    image_folder: PathBuf,

    /// Properties file with the persisted configuration
    #[arg(short = 'C', long)]
    properties: Option<PathBuf>,

    /// File containing the access token for the control channel
    #[arg(short = 'P', long)]
    token_file: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .parse_filters(&args.log_level)
        .init();

    // Parser-level failures abort the daemon before the bus thread starts
    let properties = match &args.properties {
        Some(path) => PropertyStore::load(path)?,
        None => PropertyStore::default(),
    };
    let overrides = Arc::new(properties.custom_mode_pages()?);

    anyhow::ensure!(
        args.image_folder.is_dir(),
        "image folder '{}' does not exist",
        args.image_folder.display()
    );

    let registry = FileRegistry::default();
    let device_factory = DeviceFactory::new(registry, overrides);
    let images = ImageSupport::new(args.image_folder.clone());

    let mut executor = CommandExecutor::new(device_factory, images, properties.clone());
    apply_properties(&mut executor, &properties)?;

    let token = match &args.token_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Can't read token file '{}'", path.display()))?
                .trim()
                .to_string(),
        ),
        None => None,
    };

    let executor = Arc::new(Mutex::new(executor));
    let running = Arc::new(AtomicBool::new(true));

    // The handlers only set the flag; the bus loop performs the shutdown
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("Can't install signal handler")?;
    }

    let mut control_server =
        ControlServer::start(args.port, executor.clone(), running.clone(), token)?;

    info!(
        "Drift {} ready, default image folder '{}'",
        drift_core::VERSION,
        args.image_folder.display()
    );

    let mut bus = InProcessBus::new();
    run_bus_loop(&mut bus, &executor, &running);

    // Flush all caches before leaving
    executor.lock().unwrap().factory_mut().flush_all();
    control_server.stop();

    info!("Drift shut down");
    Ok(())
}

/// Applies the persisted reserved IDs and device definitions
fn apply_properties(
    executor: &mut CommandExecutor,
    properties: &PropertyStore,
) -> anyhow::Result<()> {
    if let Some(ids) = properties.reserved_ids() {
        let mut cmd = ControlCommand::new(Operation::ReserveIds);
        cmd.params.insert("ids".to_string(), ids.to_string());
        let result = executor.process_command(&cmd);
        anyhow::ensure!(result.status, "Invalid reserved ID list: {}", result.msg);
    }

    let definitions = properties.device_definitions()?;
    if !definitions.is_empty() {
        let mut cmd = ControlCommand::new(Operation::Attach);
        cmd.devices = definitions;
        let result = executor.process_command(&cmd);
        anyhow::ensure!(
            result.status,
            "Can't attach configured devices: {}",
            result.msg
        );
    }

    Ok(())
}

/// The bus loop: the single mutator of controller phase state. Device
/// attach state is only touched under the executor mutex, between
/// commands.
fn run_bus_loop(
    bus: &mut InProcessBus,
    executor: &Arc<Mutex<CommandExecutor>>,
    running: &Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        if !bus.wait_for_selection() {
            // Poll timeout; take the chance to observe SHUT_DOWN commands
            let mode = executor.lock().unwrap().take_shutdown();
            if handle_shutdown(mode, running) {
                break;
            }
            continue;
        }

        bus.acquire();
        if bus.get_signal(Signal::Rst) {
            warn!("RESET signal received");
            let mut exec = executor.lock().unwrap();
            exec.factory_mut().reset_all(bus);
            continue;
        }

        let id_data = bus.get_dat();

        let mode = {
            let mut exec = executor.lock().unwrap();
            let mode = exec.factory_mut().process_on_controller(bus, id_data);
            if mode == ShutdownMode::None {
                exec.take_shutdown()
            } else {
                mode
            }
        };

        if handle_shutdown(mode, running) {
            break;
        }
    }
}

fn handle_shutdown(mode: ShutdownMode, running: &Arc<AtomicBool>) -> bool {
    match mode {
        ShutdownMode::None => false,
        ShutdownMode::StopDaemon => {
            info!("Stopping the daemon");
            running.store(false, Ordering::SeqCst);
            true
        }
        ShutdownMode::StopHost | ShutdownMode::RestartHost => {
            // The actual host shutdown/reboot is the init system's
            // business; leave the daemon cleanly and report the request
            info!(
                "Host {} requested, stopping the daemon",
                if mode == ShutdownMode::StopHost {
                    "shutdown"
                } else {
                    "reboot"
                }
            );
            running.store(false, Ordering::SeqCst);
            true
        }
    }
}
