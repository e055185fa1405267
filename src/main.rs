use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use rbdiscipline::config::SystemConfig;
use rbdiscipline::status::DisciplineStatus;

#[derive(Parser, Debug)]
#[command(author, version, about = "GPS-disciplined rubidium oscillator controller", long_about = None)]
struct Args {
    /// Serial port the rubidium unit is attached to
    #[arg(short, long, default_value = "/dev/ttyS4")]
    device: PathBuf,

    /// JSON tuning file (missing keys keep their defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mirror the status snapshot into this JSON file
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Samples per calibration run
    #[arg(long)]
    discipline_entries: Option<u32>,

    /// DDS value to start the initial calibration from
    #[arg(long, allow_hyphen_values = true)]
    initial_dds: Option<f64>,

    /// Debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };

    if let Some(entries) = args.discipline_entries {
        config.discipline.discipline_entries = entries;
    }
    if let Some(dds) = args.initial_dds {
        config.discipline.initial_dds = dds;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(None)
        .filter_level(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .parse_default_env()
        .init();

    let config = load_config(&args)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let status = Arc::new(RwLock::new(DisciplineStatus::default()));

    if let Err(e) = run(&args, config, status, running) {
        error!("{:#}", e);
        return Err(e);
    }

    info!("Exiting.");
    Ok(())
}

#[cfg(unix)]
fn run(
    args: &Args,
    config: SystemConfig,
    status: Arc<RwLock<DisciplineStatus>>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    use rbdiscipline::clock::HostClock;
    use rbdiscipline::controller::DisciplineController;
    use rbdiscipline::device::SerialDevice;
    use rbdiscipline::error::DisciplineError;
    use rbdiscipline::traits::NoHeartbeat;

    let device = SerialDevice::open(&args.device)
        .with_context(|| format!("Failed to open {}", args.device.display()))?;

    let mut controller = DisciplineController::connect(device, HostClock::default(), NoHeartbeat, status, config)
        .context("Failed to identify rubidium unit")?
        .with_shutdown_flag(running);
    if let Some(path) = &args.status_file {
        controller = controller.with_status_file(path.clone());
    }

    info!("Waiting for lock and running initial calibration...");
    match controller.startup() {
        Ok(()) => {}
        Err(DisciplineError::Interrupted) => {
            info!("Interrupted before the discipline loop started");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        info!("sd_notify unavailable: {}", e);
    }

    info!("Starting discipline loop...");
    controller.run()?;
    Ok(())
}

#[cfg(not(unix))]
fn run(
    args: &Args,
    _config: SystemConfig,
    _status: Arc<RwLock<DisciplineStatus>>,
    _running: Arc<AtomicBool>,
) -> Result<()> {
    Err(anyhow::anyhow!("serial transport for {} is only implemented on unix hosts", args.device.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_win() {
        let args = Args::parse_from([
            "rbdiscipline", "--discipline-entries", "600", "--initial-dds", "-74.2",
        ]);
        let config = load_config(&args).expect("config");
        assert_eq!(config.discipline.discipline_entries, 600);
        assert_eq!(config.discipline.initial_dds, -74.2);
        assert_eq!(args.device, PathBuf::from("/dev/ttyS4"));
    }

    #[test]
    fn test_cli_overrides_file_values() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{ "discipline": {{ "discipline_entries": 900, "drift_limit": 1.05 }} }}"#)
            .expect("write");

        let path = file.path().to_string_lossy().to_string();
        let args = Args::parse_from(["rbdiscipline", "-c", path.as_str(), "--discipline-entries", "1200"]);
        let config = load_config(&args).expect("config");
        assert_eq!(config.discipline.discipline_entries, 1200);
        assert_eq!(config.discipline.drift_limit, 1.05);
    }
}
