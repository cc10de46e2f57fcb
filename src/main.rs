use anyhow::Context;
use renpho_ble_scale::domain::settings::SettingsService;
use renpho_ble_scale::infrastructure::bluetooth::btleplug::BtleplugTransport;
use renpho_ble_scale::infrastructure::logging;
use renpho_ble_scale::{DeviceAddress, ScaleEvent, ScaleService, SessionError};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Exit code for errors outside a measurement session
const EXIT_OTHER: i32 = 1;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<SessionError>()
                .map(|session_error| session_error.kind().exit_code())
                .unwrap_or(EXIT_OTHER)
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        settings = %settings_service.path().display(),
        "Starting Renpho scale client"
    );

    // An address on the command line overrides the configured scale
    let address_override = std::env::args().nth(1).map(DeviceAddress::new);
    let settings = Arc::new(Mutex::new(settings_service));

    let transport = BtleplugTransport::new()
        .await
        .map_err(|e| SessionError::DiscoveryFailed {
            reason: e.to_string(),
        })?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ScaleEvent::SessionStarted(address) => {
                    info!(%address, "Step on the scale...")
                }
                ScaleEvent::Measurement { address, report } => {
                    for reading in report.readings() {
                        info!(%address, "{}: {:.2} {}", reading.key, reading.value, reading.unit);
                    }
                    if report.malformed_frames > 0 {
                        warn!(
                            %address,
                            "{} malformed frames were dropped", report.malformed_frames
                        );
                    }
                }
                ScaleEvent::Failed {
                    address,
                    kind,
                    message,
                } => error!(?address, ?kind, "{}", message),
            }
        }
    });

    let service = Arc::new(ScaleService::new(
        Arc::new(transport),
        Arc::clone(&settings),
        event_tx,
    ));

    let ctrl_c_service = Arc::clone(&service);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling measurement");
            ctrl_c_service.cancel_all();
        }
    });

    let report = match address_override {
        Some(address) => {
            let (unit, profile, timeouts) = {
                let settings = settings
                    .lock()
                    .map_err(|_| anyhow::anyhow!("Lock error"))?;
                let s = settings.get();
                (s.weight_unit, s.profile, s.timeouts.session_timeouts())
            };
            service
                .run_measurement_session(Some(address), unit, profile, timeouts)
                .await?
        }
        None => service.trigger_measurement().await?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
