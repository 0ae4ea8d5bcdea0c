//! Up-channel command framing.
//!
//! Each command travels on its own connection as a single record:
//!
//! ```text
//! <period> <ip> <port> <payload>
//! ```
//!
//! where `payload` ends with the only terminator of the record. A period
//! of `0` asks the site manager to deliver the command once.

use crate::ProtocolError;

/// Record terminator shared by both channels.
pub const LINE_TERMINATOR: char = '\n';

/// Checks that `payload` has exactly one terminator, at its end.
pub fn validate_payload(payload: &str) -> Result<(), ProtocolError> {
    let count = payload.matches(LINE_TERMINATOR).count();
    if !payload.ends_with(LINE_TERMINATOR) {
        return Err(ProtocolError::InvalidCommand {
            reason: "a command must end with a newline".to_string(),
        });
    }
    if count != 1 {
        return Err(ProtocolError::InvalidCommand {
            reason: format!("a command must contain exactly one newline, found {count}"),
        });
    }
    Ok(())
}

/// Frames a command addressed to the node client at `ip:port`.
pub fn encode_command(
    period: u32,
    ip: &str,
    port: u16,
    payload: &str,
) -> Result<String, ProtocolError> {
    validate_payload(payload)?;
    Ok(format!("{period} {ip} {port} {payload}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let framed = encode_command(0, "10.0.0.7", 5000, "CTRL_NET_DOWN_REQ\n").unwrap();
        assert_eq!(framed, "0 10.0.0.7 5000 CTRL_NET_DOWN_REQ\n");
    }

    #[test]
    fn test_encode_with_period() {
        let framed = encode_command(30, "10.0.0.7", 5000, "CTRL_SEND_TO_APP ping\n").unwrap();
        assert!(framed.starts_with("30 "));
    }

    #[test]
    fn test_missing_terminator_rejected() {
        assert!(encode_command(0, "10.0.0.7", 5000, "CTRL_NET_DOWN_REQ").is_err());
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(validate_payload("").is_err());
    }

    #[test]
    fn test_embedded_terminator_rejected() {
        let err = validate_payload("first\nsecond\n").unwrap_err();
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn test_bare_terminator_accepted() {
        assert!(validate_payload("\n").is_ok());
    }
}
