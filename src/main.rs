use ble_midi_bridge::domain::models::{AppEvent, MessageSeverity};
use ble_midi_bridge::domain::settings::SettingsService;
use ble_midi_bridge::infrastructure::logging::init_logger;
use ble_midi_bridge::EventStream;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

fn main() -> anyhow::Result<()> {
    let settings_service = match std::env::args_os().nth(1) {
        Some(path) => SettingsService::from_path(PathBuf::from(path)),
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();

    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting BLE-MIDI bridge");
    info!("Settings file: {}", settings_service.path().display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ble-midi-bridge")
        .build()?;

    runtime.block_on(run(settings.bridge))
}

#[cfg(windows)]
async fn run(config: ble_midi_bridge::Configuration) -> anyhow::Result<()> {
    use ble_midi_bridge::infrastructure::bluetooth::WinRtTransport;
    use ble_midi_bridge::infrastructure::midi_output::MidirPortOpener;
    use ble_midi_bridge::ConnectionSupervisor;
    use std::sync::Arc;

    let opener = MidirPortOpener::new("ble-midi-bridge");
    match opener.port_names() {
        Ok(ports) => info!("MIDI output ports: {:?}", ports),
        Err(e) => warn!("Could not list MIDI output ports: {}", e),
    }

    let (handle, events, supervisor) = ConnectionSupervisor::spawn(
        config,
        Arc::new(WinRtTransport::new()),
        Arc::new(opener),
    );
    handle.start()?;

    let monitor = tokio::spawn(log_events(events));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    handle.stop()?;
    drop(handle);

    supervisor.await?;
    monitor.await?;
    Ok(())
}

#[cfg(not(windows))]
async fn run(_config: ble_midi_bridge::Configuration) -> anyhow::Result<()> {
    anyhow::bail!("BLE-MIDI bridge backend is only available on Windows")
}

/// Mirror bus events into the log until the supervisor exits.
#[cfg_attr(not(windows), allow(dead_code))]
async fn log_events(mut events: EventStream) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::ConnectionStatus(state) => info!("Status: {}", state),
            AppEvent::MidiActivity(summary) => debug!("MIDI: {}", summary),
            AppEvent::LogMessage(msg) => match msg.severity {
                MessageSeverity::Error => error!("{}", msg.message),
                MessageSeverity::Warning => warn!("{}", msg.message),
                MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
            },
            AppEvent::SinkError(message) => warn!("MIDI output: {}", message),
        }
    }
    if events.dropped_activity() > 0 {
        info!("{} activity ticks dropped", events.dropped_activity());
    }
}
