//! Serial port side of the daemon

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use relay_engine::config::{FlowControl, Parity, SerialConfig};
use relay_engine::services::WriterSink;
use relay_engine::{Dispatch, SerialSink};
use serialport::{DataBits, StopBits};

/// Read timeout on the device; a quiet line just loops
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive half of the serial link
pub type SerialReader = Box<dyn Read + Send>;

/// Open the serial device with the configured line settings, or bridge
/// stdin/stdout when no device is configured.
pub fn open(
    device: Option<&Path>,
    line: &SerialConfig,
) -> io::Result<(SerialReader, Arc<dyn SerialSink>)> {
    match device {
        Some(path) => {
            let port = serialport::new(path.to_string_lossy(), line.baud_rate)
                .data_bits(data_bits(line.data_bits)?)
                .stop_bits(stop_bits(line.stop_bits)?)
                .parity(parity(line.parity))
                .flow_control(flow_control(line.flow_control))
                .timeout(READ_TIMEOUT)
                .open()?;
            let writer = port.try_clone()?;
            log::info!(
                "Serial device {} at {} baud, {}{}{}",
                path.display(),
                line.baud_rate,
                line.data_bits,
                parity_letter(line.parity),
                line.stop_bits
            );
            Ok((Box::new(port), Arc::new(WriterSink::new(writer))))
        }
        None => {
            log::info!("No serial device configured, using stdin/stdout");
            Ok((Box::new(io::stdin()), Arc::new(WriterSink::new(io::stdout()))))
        }
    }
}

// ============================================================================
// Line Settings
// ============================================================================

fn data_bits(bits: u8) -> io::Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(invalid(format!("unsupported data bits: {}", other))),
    }
}

fn stop_bits(bits: u8) -> io::Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(invalid(format!("unsupported stop bits: {}", other))),
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn parity_letter(parity: Parity) -> char {
    match parity {
        Parity::None => 'N',
        Parity::Odd => 'O',
        Parity::Even => 'E',
    }
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Software => serialport::FlowControl::Software,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

// ============================================================================
// Reader
// ============================================================================

/// Read `chunk_size` bytes at a time and publish every chunk.
///
/// The thread ends at end of input or on a read error. Read timeouts from a
/// quiet device are not errors. It is never joined.
pub fn spawn_reader(
    mut reader: SerialReader,
    dispatch: Arc<Dispatch>,
    chunk_size: usize,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("serial_reader".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        log::info!("Serial input closed");
                        break;
                    }
                    Ok(n) => dispatch.publish(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        log::error!("Serial read failed: {}", e);
                        break;
                    }
                }
            }
        })
}
