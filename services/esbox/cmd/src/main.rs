//! ESBox API engine binary.
//!
//! Runs a device and a server session against each other over an in-process
//! channel, decodes captured wrappers, and lists the protocol versions the
//! engine speaks.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use esbox_session::{CloseReason, Collaborators, Role, Session, SessionEvent, SessionStats};
use esbox_storage::Storage;
use esbox_wire::{
    AttributeData, AttributeValue, Cluster, Direction, MessageBody, TelemetryCell, VersionRegistry, WrapperCodec,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::EsboxConfig;
use logging::EsboxLogFormatter;

/// ESBox API protocol engine
#[derive(Parser, Debug)]
#[command(name = "esbox-api", version, about = "ESBox API protocol engine")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, global = true, default_value = "esbox.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server and a device session over an in-process link
    Simulate {
        /// Telemetry cells to preload into the device's stream database
        #[arg(long, default_value_t = 25)]
        cells: usize,

        /// FIFO to drain
        #[arg(long, default_value_t = 0)]
        fifo: u8,
    },
    /// Decode a captured wrapper and print a summary
    Decode {
        /// File holding the wrapper JSON
        #[arg(long)]
        input: PathBuf,

        /// Which way the wrapper was travelling
        #[arg(long, value_enum, default_value_t = WrapperDirection::FromDevice)]
        direction: WrapperDirection,
    },
    /// List registered protocol versions
    Versions,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WrapperDirection {
    ToDevice,
    FromDevice,
}

impl From<WrapperDirection> for Direction {
    fn from(direction: WrapperDirection) -> Self {
        match direction {
            WrapperDirection::ToDevice => Direction::ToDevice,
            WrapperDirection::FromDevice => Direction::FromDevice,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("esbox_api={}", args.log_level).parse()?)
        .add_directive(format!("esbox_session={}", args.log_level).parse()?)
        .add_directive(format!("esbox_wire={}", args.log_level).parse()?)
        .add_directive(format!("esbox_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .event_format(EsboxLogFormatter::new("esbox"))
        .init();

    info!("Starting ESBox API engine v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(VersionRegistry::standard());
    match args.command {
        Command::Simulate { cells, fifo } => {
            let config = EsboxConfig::load_from_file(&args.config)?;
            simulate(&config, registry, cells, fifo).await.map(|_| ())
        }
        Command::Decode { input, direction } => decode(registry, &input, direction.into()),
        Command::Versions => {
            for version in registry.supported() {
                let schema = registry.schema(version)?;
                println!("{}\t{:?}", version, schema.capabilities());
            }
            Ok(())
        }
    }
}

/// Synthetic meter readings spread over three devices
fn synthetic_cells(count: usize) -> Vec<TelemetryCell> {
    let start = chrono::Utc::now().timestamp();
    (0..count)
        .map(|i| TelemetryCell {
            device: format!("001BC502B01003{:02X}", i % 3),
            endpoint: 10,
            cluster: Cluster::new(0, 1794),
            time: start + (i / 3) as i64 * 30,
            attributes: vec![AttributeValue {
                attribute_id: 0,
                value: AttributeData::Uint(1_000 + i as u64),
            }],
        })
        .collect()
}

/// Drain one FIFO from a simulated device; returns the cells the server recovered
async fn simulate(
    config: &EsboxConfig,
    registry: Arc<VersionRegistry>,
    cells: usize,
    fifo: u8,
) -> anyhow::Result<usize> {
    let storage = Storage::from_config(&config.storage_config()).context("failed to open storage")?;
    storage.streams.extend(synthetic_cells(cells));

    let collaborators = Collaborators::none()
        .with_streams(storage.streams.clone())
        .with_files(storage.files.clone());
    let device = Session::new(config.engine_config(Role::Device)?, registry.clone(), collaborators);
    let mut server = Session::new(config.engine_config(Role::Server)?, registry, Collaborators::none());

    let (to_device, device_rx) = mpsc::channel(16);
    let (device_tx, mut from_device) = mpsc::channel(16);
    let device_task = tokio::spawn(run_device(device, device_rx, device_tx));

    server.open()?;
    server.request_telemetry(fifo)?;
    server.send(MessageBody::GetStatus)?;

    let mut received = 0usize;
    loop {
        to_device.send(server.next_outbound()?.to_vec()).await?;
        let Some(reply) = from_device.recv().await else {
            server.disconnected();
            bail!("device went away mid-exchange");
        };
        match server.receive(&reply) {
            Ok(events) => {
                for event in events {
                    match event {
                        SessionEvent::Established(version) => {
                            component_info!("server", "Negotiated protocol v{}", version)
                        }
                        SessionEvent::Telemetry { fifo, cells: Ok(cells) } => {
                            component_info!("server", "Received {} cells from fifo {}", cells.len(), fifo);
                            received += cells.len();
                            if !cells.is_empty() {
                                server.request_telemetry(fifo)?;
                            }
                        }
                        SessionEvent::Telemetry { fifo, cells: Err(e) } => {
                            component_warn!("server", "Telemetry from fifo {} rejected: {}", fifo, e)
                        }
                        SessionEvent::Message(message) => {
                            component_info!("server", "Device sent {}", message.id.as_str())
                        }
                        SessionEvent::Unhandled(message) => {
                            component_warn!("server", "Ignored {} from device", message.id.as_str())
                        }
                        SessionEvent::PeerFinished => component_debug!("server", "Device has nothing more to send"),
                        SessionEvent::Closed(reason) => {
                            component_info!("server", "Device closed the session: {:?}", reason)
                        }
                    }
                }
            }
            Err(e) => warn!("Dropped device wrapper: {}", e),
        }

        if server.is_closed() {
            break;
        }
        if server.is_exchange_complete() {
            server.send(MessageBody::CloseConnection)?;
            to_device.send(server.next_outbound()?.to_vec()).await?;
            server.close(CloseReason::Local("exchange complete".to_string()));
            break;
        }
    }

    let device_stats = device_task.await??;
    report("server", server.stats());
    report("device", &device_stats);
    info!("Simulation finished: {} of {} cells delivered", received, cells);
    Ok(received)
}

async fn run_device(
    mut device: Session,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) -> anyhow::Result<SessionStats> {
    while let Some(bytes) = inbound.recv().await {
        match device.receive(&bytes) {
            Ok(events) => {
                for event in events {
                    match event {
                        SessionEvent::Established(version) => {
                            component_info!("device", "Negotiated protocol v{}", version)
                        }
                        SessionEvent::Closed(reason) => component_info!("device", "Session closed: {:?}", reason),
                        SessionEvent::Unhandled(message) => {
                            component_warn!("device", "Left {} unanswered", message.id.as_str())
                        }
                        other => component_debug!("device", "{:?}", other),
                    }
                }
            }
            Err(e) => component_warn!("device", "Dropped server wrapper: {}", e),
        }
        if device.is_closed() {
            break;
        }
        outbound.send(device.next_outbound()?.to_vec()).await?;
    }
    if !device.is_closed() {
        device.disconnected();
    }
    Ok(device.stats().clone())
}

fn report(side: &str, stats: &SessionStats) {
    info!(
        "{}: {} wrappers in, {} out, {} messages in, {} out, {} dropped, {} cells sent, {} received",
        side,
        stats.wrappers_in,
        stats.wrappers_out,
        stats.messages_in,
        stats.messages_out,
        stats.wrappers_dropped,
        stats.cells_sent,
        stats.cells_received
    );
}

fn decode(registry: Arc<VersionRegistry>, input: &Path, direction: Direction) -> anyhow::Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("failed to read {:?}", input))?;
    let codec = WrapperCodec::new(registry.clone());
    let wrapper = codec.decode_inbound(&bytes, direction)?;

    if !registry.supports(wrapper.protocol_version) {
        warn!(
            "Wrapper declares unsupported v{}, decoded with the nearest schema",
            wrapper.protocol_version
        );
    }
    let timestamp = wrapper
        .timestamp
        .and_then(|ts| chrono::DateTime::<chrono::Utc>::from_timestamp(ts, 0))
        .map(|t| t.to_rfc3339());
    let summary = serde_json::json!({
        "protocol_version": wrapper.protocol_version.to_string(),
        "device_version": wrapper.device_version,
        "address": wrapper.identity.as_ref().map(|i| i.address.clone()),
        "timestamp": timestamp,
        "messages": wrapper.messages.iter().map(|m| serde_json::json!({
            "id": m.id.as_str(),
            "operation": format!("{:?}", m.operation()),
            "cluster": format!("{}:{}", m.cluster.manufacturer, m.cluster.id),
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_config(dir: &Path) -> EsboxConfig {
        EsboxConfig {
            files_root: dir.join("files"),
            default_cell_count: 4,
            ..EsboxConfig::default()
        }
    }

    #[test]
    fn test_synthetic_cells() {
        let cells = synthetic_cells(7);
        assert_eq!(cells.len(), 7);
        assert_eq!(cells[0].time, cells[2].time);
        assert_eq!(cells[3].time, cells[0].time + 30);
        assert_ne!(cells[0].device, cells[1].device);
    }

    #[tokio::test]
    async fn test_simulation_drains_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(VersionRegistry::standard());
        let received = simulate(&test_config(dir.path()), registry, 11, 2).await.unwrap();
        assert_eq!(received, 11);
    }

    #[tokio::test]
    async fn test_simulation_with_empty_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(VersionRegistry::standard());
        let received = simulate(&test_config(dir.path()), registry, 0, 0).await.unwrap();
        assert_eq!(received, 0);
    }

    #[test]
    fn test_decode_captured_wrapper() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"ProtocolVersion": "1.0", "Auth": ["001BC502B0000000", "key"], "Time": 1700000000,
                "Messages": [{"MsgID": "NoFurtherMessages"}, {"MsgID": "GetErrors"}]}"#,
        )
        .unwrap();
        let registry = Arc::new(VersionRegistry::standard());
        decode(registry.clone(), file.path(), Direction::FromDevice).unwrap();
        assert!(decode(registry, file.path(), Direction::ToDevice).is_err());
    }
}
