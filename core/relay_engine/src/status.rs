//! Serial status sentences
//!
//! State transitions are announced on the serial sink as NMEA-style
//! proprietary sentences. Monitoring tooling parses these, so the layout and
//! the per-endpoint tag (`SRV`, `SRV2`) are fixed:
//!
//! ```text
//! $PESP,NTRIP,SRV,WAITING*XX\r\n
//! $PESP,NTRIP,SRV2,CONNECTING,caster.example.com:2101,TEST*XX\r\n
//! ```
//!
//! `XX` is the XOR of every byte between `$` and `*`, two upper-case hex digits.

use crate::services::SerialSink;

/// Build a complete sentence (checksum and CRLF appended) from its body
pub fn nmea_sentence(body: &str) -> String {
    format!("{}*{:02X}\r\n", body, nmea_checksum(body))
}

/// XOR of the bytes after the leading `$`
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes()
        .skip_while(|&b| b == b'$')
        .fold(0u8, |acc, b| acc ^ b)
}

/// Uplink lifecycle sentence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkEvent<'a> {
    Waiting,
    Connecting { host: &'a str, port: u16, mountpoint: &'a str },
    Connected { host: &'a str, port: u16, mountpoint: &'a str },
    Disconnected { host: &'a str, port: u16, mountpoint: &'a str },
}

impl UplinkEvent<'_> {
    /// Sentence body for the endpoint tagged `tag`
    pub fn body(&self, tag: &str) -> String {
        match self {
            UplinkEvent::Waiting => format!("$PESP,NTRIP,{},WAITING", tag),
            UplinkEvent::Connecting { host, port, mountpoint } => {
                format!("$PESP,NTRIP,{},CONNECTING,{}:{},{}", tag, host, port, mountpoint)
            }
            UplinkEvent::Connected { host, port, mountpoint } => {
                format!("$PESP,NTRIP,{},CONNECTED,{}:{},{}", tag, host, port, mountpoint)
            }
            UplinkEvent::Disconnected { host, port, mountpoint } => {
                format!("$PESP,NTRIP,{},DISCONNECTED,{}:{},{}", tag, host, port, mountpoint)
            }
        }
    }
}

/// Write a sentence to the serial sink. A sink failure is logged and dropped.
pub fn announce(sink: &dyn SerialSink, body: &str) {
    let sentence = nmea_sentence(body);
    if let Err(e) = sink.write(sentence.as_bytes()) {
        log::debug!("Failed to write status sentence: {}", e);
    }
}

/// Boot sentence `$PESP,INIT,START,<version>,<reason>`
pub fn init_start_body(version: &str, reason: &str) -> String {
    format!("$PESP,INIT,START,{},{}", version, reason)
}

pub const INIT_COMPLETE_BODY: &str = "$PESP,INIT,COMPLETE";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemorySink;

    #[test]
    fn test_checksum_excludes_dollar() {
        // Known value: XOR of "GPGLL,5300.97914,N,00259.98174,E,125926,A"
        assert_eq!(
            nmea_checksum("$GPGLL,5300.97914,N,00259.98174,E,125926,A"),
            0x28
        );
    }

    #[test]
    fn test_sentence_layout() {
        let s = nmea_sentence("$PESP,INIT,COMPLETE");
        assert!(s.starts_with("$PESP,INIT,COMPLETE*"));
        assert!(s.ends_with("\r\n"));
        assert_eq!(s.len(), "$PESP,INIT,COMPLETE".len() + 5);
        let hex = &s[s.len() - 4..s.len() - 2];
        assert_eq!(hex, format!("{:02X}", nmea_checksum("$PESP,INIT,COMPLETE")));
    }

    #[test]
    fn test_uplink_event_bodies_carry_tag() {
        let connected = UplinkEvent::Connected {
            host: "caster.example.com",
            port: 2101,
            mountpoint: "TEST",
        };
        assert_eq!(
            connected.body("SRV"),
            "$PESP,NTRIP,SRV,CONNECTED,caster.example.com:2101,TEST"
        );
        assert_eq!(UplinkEvent::Waiting.body("SRV2"), "$PESP,NTRIP,SRV2,WAITING");

        let disconnected = UplinkEvent::Disconnected {
            host: "h",
            port: 1,
            mountpoint: "m",
        };
        assert_eq!(disconnected.body("SRV2"), "$PESP,NTRIP,SRV2,DISCONNECTED,h:1,m");
    }

    #[test]
    fn test_announce_writes_sentence() {
        let sink = MemorySink::new();
        announce(&sink, &init_start_body("0.1.0", "POWERON"));
        let text = sink.text();
        assert!(text.starts_with("$PESP,INIT,START,0.1.0,POWERON*"));
        assert!(text.ends_with("\r\n"));
    }
}
