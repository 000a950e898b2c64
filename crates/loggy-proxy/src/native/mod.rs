//! Native messaging host for the browser extension.
//!
//! Chrome launches this binary with no arguments and speaks a framed
//! protocol over stdio: each message is a 4-byte little-endian length
//! followed by that many bytes of UTF-8 JSON, in both directions. The
//! loop services one message at a time and exits on stdin EOF.
//!
//! Nothing in this process may write to stdout except the framed
//! responses; logging goes to stderr.

pub mod install;
pub mod supervisor;

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tracing::debug;

/// Upper bound on a single frame; Chrome itself caps host-bound
/// messages well below this.
const MAX_FRAME_BYTES: u32 = 1024 * 1024;

/// An incoming request from the extension.
#[derive(Debug, Deserialize)]
pub struct HostRequest {
    pub action: String,
}

/// A response to the extension.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_launched: Option<bool>,
}

impl HostResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Read one framed message. Returns `Ok(None)` on clean EOF.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let length = u32::from_le_bytes(length_bytes);
    if length > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame of {} bytes exceeds limit", length),
        ));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Write one framed response.
pub fn write_frame<W: Write>(writer: &mut W, response: &HostResponse) -> io::Result<()> {
    let payload = serde_json::to_vec(response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Service the extension until stdin closes.
pub fn run() -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    loop {
        let payload = match read_frame(&mut input)? {
            Some(payload) => payload,
            None => {
                debug!("stdin closed, native host exiting");
                return Ok(());
            }
        };

        let response = match serde_json::from_slice::<HostRequest>(&payload) {
            Ok(request) => supervisor::handle(&request.action),
            Err(e) => {
                debug!("Unparseable native message: {}", e);
                HostResponse::err("Invalid message")
            }
        };

        match write_frame(&mut output, &response) {
            Ok(()) => {}
            // The browser hung up; nothing left to answer
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let mut buffer = Vec::new();
        write_frame(
            &mut buffer,
            &HostResponse {
                pid: Some(42),
                ..HostResponse::ok()
            },
        )
        .unwrap();

        // 4-byte little-endian length prefix
        let expected_len = u32::from_le_bytes(buffer[..4].try_into().unwrap());
        assert_eq!(expected_len as usize, buffer.len() - 4);

        let payload = read_frame(&mut Cursor::new(&buffer)).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["pid"], 42);
    }

    #[test]
    fn test_read_frame_eof_is_none() {
        assert!(read_frame(&mut Cursor::new(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn test_read_frame_rejects_oversized_length() {
        let mut data = Vec::new();
        data.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_le_bytes());
        data.extend_from_slice(b"xx");
        assert!(read_frame(&mut Cursor::new(data)).is_err());
    }

    #[test]
    fn test_read_frame_parses_request() {
        let json = br#"{"action":"ping"}"#;
        let mut data = Vec::new();
        data.extend_from_slice(&(json.len() as u32).to_le_bytes());
        data.extend_from_slice(json);

        let payload = read_frame(&mut Cursor::new(data)).unwrap().unwrap();
        let request: HostRequest = serde_json::from_slice(&payload).unwrap();
        assert_eq!(request.action, "ping");
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let value = serde_json::to_value(HostResponse::ok()).unwrap();
        assert_eq!(value, serde_json::json!({"success": true}));

        let value = serde_json::to_value(HostResponse::err("boom")).unwrap();
        assert_eq!(value, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[test]
    fn test_response_camel_case_fields() {
        let response = HostResponse {
            auto_launched: Some(true),
            running: Some(false),
            ..HostResponse::ok()
        };
        let value = serde_json::to_value(response).unwrap();
        assert!(value.get("autoLaunched").is_some());
        assert!(value.get("running").is_some());
    }
}
