//! pamd - PAM actuator controller daemon
//!
//! Connects to the controller (or a virtual one), keeps the machine state
//! fresh with the telemetry poller and runs the command serializer until
//! interrupted.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pam_ctl::{
    CommandProcessor, Connector, MachineSnapshot, MachineState, PamDriver, SerialConnector,
    SerialLink, SimConnector, TelemetryPoller,
};
use pam_sim::VirtualPam;
use settings::Settings;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line options
#[derive(Debug, Default, PartialEq)]
struct Args {
    settings: Option<PathBuf>,
    simulate: bool,
    write_settings: bool,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--simulate" => parsed.simulate = true,
                "--write-settings" => parsed.write_settings = true,
                "--settings" => {
                    let path = args.next().context("--settings needs a path")?;
                    parsed.settings = Some(PathBuf::from(path));
                }
                other => anyhow::bail!("unknown argument: {}", other),
            }
        }
        Ok(parsed)
    }
}

fn summary(snapshot: &MachineSnapshot) -> String {
    fn show<T: std::fmt::Display>(value: Option<T>) -> String {
        value.map_or_else(|| "-".to_string(), |v| v.to_string())
    }

    format!(
        "FUNC={} WA={} WB={} IA={} IB={} MODE_A={} MODE_B={} READY={} PIN15={} PIN6={}",
        show(snapshot.func),
        show(snapshot.wa.map(|v| format!("{:.3}", v))),
        show(snapshot.wb.map(|v| format!("{:.3}", v))),
        show(snapshot.ia),
        show(snapshot.ib),
        show(snapshot.mode_a),
        show(snapshot.mode_b),
        show(snapshot.ready),
        show(snapshot.pin15),
        show(snapshot.pin6),
    )
}

async fn log_status(state: Arc<MachineState>, every: Duration) {
    if every.is_zero() {
        return std::future::pending().await;
    }
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = state.get_all();
        info!("{}", summary(&snapshot));
        if let Ok(json) = serde_json::to_string(&snapshot) {
            debug!("status {}", json);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pamd=info,pam_protocol=info,pam_ctl=info,pam_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pamd");

    let args = Args::parse(std::env::args().skip(1))?;
    let settings_path = args.settings.clone().or_else(Settings::default_path);
    let mut settings = match &args.settings {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };
    settings.simulate |= args.simulate;

    if args.write_settings {
        let path = settings_path.context("could not determine settings path")?;
        settings.save_to(&path)?;
        info!("Settings written to {}", path.display());
        return Ok(());
    }

    let connector: Box<dyn Connector> = if settings.simulate {
        let pam = VirtualPam::from_config(settings.simulator.clone()).shared();
        Box::new(SimConnector::new(pam))
    } else {
        Box::new(SerialConnector::from_config(&settings.pam.link))
    };
    info!("Connecting to {}", connector.endpoint());

    let link = SerialLink::connect("PAM", connector, settings.pam.link.clone()).await;
    let driver = Arc::new(PamDriver::new(link, settings.pam.driver.clone()));
    if driver.ensure_std_mode().await.is_none() {
        warn!("PAM console mode unknown at startup");
    }

    let state = Arc::new(MachineState::new());
    let processor = CommandProcessor::start(
        Arc::clone(&driver),
        Arc::clone(&state),
        settings.pam.processor.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = TelemetryPoller::new(
        Arc::clone(&driver),
        Arc::clone(&state),
        settings.pam.poller.clone(),
    );
    let poller = tokio::spawn(poller.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl-C")?,
        _ = log_status(
            Arc::clone(&state),
            Duration::from_secs(settings.status_log_interval_secs),
        ) => {}
    }

    info!("Shutting down");
    shutdown_tx.send_replace(true);
    processor.shutdown().await;
    poller.await.context("telemetry poller panicked")?;
    Ok(())
}
