//! NTRIP source handshake
//!
//! A source connects to the caster and sends (CRLF line endings):
//!
//! ```text
//! SOURCE <password> /<mountpoint>
//! Source-Agent: NTRIP <agent>/<version>
//! <blank line>
//! ```
//!
//! The caster's first response line decides the outcome. Only the statuses in
//! [`OK_STATUSES`] are accepted; after that the connection carries raw
//! correction bytes.

/// Line terminator used by the protocol
pub const NEWLINE: &str = "\r\n";

/// Agent name reported in `Source-Agent`
pub const SOURCE_AGENT_NAME: &str = "NtripRelay";

/// Agent version reported in `Source-Agent`
pub const SOURCE_AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Status lines accepted as a successful handshake
pub const OK_STATUSES: [&str; 3] = ["ICY 200 OK", "HTTP/1.0 200 OK", "HTTP/1.1 200 OK"];

/// Build the SOURCE request for a mountpoint
pub fn source_request(password: &str, mountpoint: &str) -> String {
    format!(
        "SOURCE {} /{}{nl}Source-Agent: NTRIP {}/{}{nl}{nl}",
        password,
        mountpoint,
        SOURCE_AGENT_NAME,
        SOURCE_AGENT_VERSION,
        nl = NEWLINE
    )
}

/// Extract the status line (text before the first line terminator).
///
/// Returns `None` when the response has no terminated first line.
pub fn status_line(response: &[u8]) -> Option<String> {
    let end = response.iter().position(|&b| b == b'\n')?;
    let line = &response[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some(String::from_utf8_lossy(line).trim().to_string())
}

pub fn response_ok(status: &str) -> bool {
    OK_STATUSES.iter().any(|ok| *ok == status)
}

/// Outcome of a caster response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    Accepted,
    /// Caster answered with a status outside the whitelist
    Rejected(String),
    /// No parseable status line
    Malformed,
}

pub fn check_response(response: &[u8]) -> HandshakeResult {
    match status_line(response) {
        None => HandshakeResult::Malformed,
        Some(status) if response_ok(&status) => HandshakeResult::Accepted,
        Some(status) => HandshakeResult::Rejected(status),
    }
}
