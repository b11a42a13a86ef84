//! NTRIP Relay daemon
//!
//! Reads RTK corrections from a serial device and relays them to:
//! - Up to two NTRIP casters (as a SOURCE)
//! - Local TCP/UDP peers through the socket server
//! - A remote host through the socket client
//!
//! Replies from peers and the remote host are written back to the device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_engine::services::AlwaysOnline;
use relay_engine::status::{self, INIT_COMPLETE_BODY};
use relay_engine::{
    ConfigStore, Context, Dispatch, FileConfigStore, Indicators, MemoryConfigStore, Relay,
    RelayConfig, StatusIndicator,
};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};

mod serial;

// ============================================================================
// Constants
// ============================================================================

/// Configuration file used when `--config` is not given
const DEFAULT_CONFIG_PATH: &str = "relay.json";

/// Reset reason reported in the boot sentence
const RESET_REASON: &str = "STARTUP";

/// Main loop tick while waiting for signals
const TICK: Duration = Duration::from_millis(200);

// ============================================================================
// Status Indicators
// ============================================================================

/// Indicator without hardware: logs state changes
struct LogIndicator {
    name: &'static str,
    active: AtomicBool,
}

impl LogIndicator {
    fn new(name: &'static str) -> Arc<dyn StatusIndicator> {
        Arc::new(LogIndicator {
            name,
            active: AtomicBool::new(false),
        })
    }
}

impl StatusIndicator for LogIndicator {
    fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::SeqCst) != active {
            log::debug!("{} indicator {}", self.name, if active { "on" } else { "off" });
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --config <path>  JSON configuration (default: relay.json)
    // --device <path>  Serial device, overrides serial.device

    let config_path = parse_arg(&args, "--config").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let device = parse_arg(&args, "--device").map(PathBuf::from);

    log::info!("NTRIP Relay v{}", env!("CARGO_PKG_VERSION"));

    let store = open_config(Path::new(&config_path))?;
    let config = store.load()?;
    let device = device.or_else(|| config.serial.device.clone());

    let (reader, sink) = serial::open(device.as_deref(), &config.serial)?;
    status::announce(
        sink.as_ref(),
        &status::init_start_body(env!("CARGO_PKG_VERSION"), RESET_REASON),
    );

    // Signals: SIGINT/SIGTERM stop the relay, SIGUSR1 logs metrics
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;
    let dump = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGUSR1, Arc::clone(&dump))?;

    let ctx = Context::new(store, Arc::clone(&sink), Arc::new(AlwaysOnline));
    let dispatch = Arc::new(Dispatch::new());
    let indicators = Indicators {
        ntrip_server: Some(LogIndicator::new("ntrip_server")),
        ntrip_server_2: Some(LogIndicator::new("ntrip_server_2")),
        socket_client: Some(LogIndicator::new("socket_client")),
    };
    let relay = Relay::start(ctx, &dispatch, indicators)?;

    status::announce(sink.as_ref(), INIT_COMPLETE_BODY);

    serial::spawn_reader(reader, Arc::clone(&dispatch), config.serial.read_chunk)?;

    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(TICK);
        if dump.swap(false, Ordering::Relaxed) {
            log::info!("Metrics:\n{}", relay.render_metrics());
        }
    }

    log::info!("Shutdown requested");
    dispatch.clear();
    relay.shutdown();
    Ok(())
}

/// File-backed store, or in-memory defaults when the file does not exist
fn open_config(path: &Path) -> Result<Arc<dyn ConfigStore>, Box<dyn std::error::Error>> {
    if path.exists() {
        log::info!("Configuration: {}", path.display());
        return Ok(Arc::new(FileConfigStore::new(path)));
    }
    log::warn!("{} not found, using default configuration", path.display());
    Ok(Arc::new(MemoryConfigStore::new(RelayConfig::default())))
}

/// Parse a command line argument value
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_arg() {
        let a = args(&["ntrip-relay", "--config", "/etc/relay.json", "--device", "/dev/ttyUSB0"]);
        assert_eq!(parse_arg(&a, "--config").as_deref(), Some("/etc/relay.json"));
        assert_eq!(parse_arg(&a, "--device").as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(parse_arg(&a, "--missing"), None);
        assert_eq!(parse_arg(&args(&["ntrip-relay", "--config"]), "--config"), None);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let store = open_config(Path::new("/nonexistent/relay.json")).unwrap();
        assert_eq!(store.load().unwrap(), RelayConfig::default());
    }

    #[test]
    fn test_log_indicator_tracks_state() {
        let indicator = LogIndicator {
            name: "test",
            active: AtomicBool::new(false),
        };
        indicator.set_active(true);
        assert!(indicator.active.load(Ordering::SeqCst));
        indicator.set_active(false);
        assert!(!indicator.active.load(Ordering::SeqCst));
    }
}
