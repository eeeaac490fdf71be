//! Upload socket wire format.
//!
//! Control traffic is JSON in text frames, keyed by message name
//! (`{"RequestChunk":{...}}`). File data travels in binary frames made of a
//! 4-byte little-endian offset followed by the payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::UpdateError;

/// Length of the offset header in front of every chunk payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Reason sent with the status message when the server asks past the end.
pub const EOF_REASON: &str = "reaching eof";

/// One message on the duplex socket, independent of the socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

// --- Client -> server ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadFile {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadStatus {
    #[serde(rename = "Error")]
    pub error: bool,
    #[serde(rename = "Reason")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClientMessage {
    /// Start-of-upload handshake.
    UploadFile(UploadFile),
    /// Client-side termination, used for end-of-file.
    UploadStatus(UploadStatus),
    AbortUpload(bool),
    #[serde(rename = "ping")]
    Ping(bool),
}

impl ClientMessage {
    pub fn start(name: &str, size: u64) -> Self {
        ClientMessage::UploadFile(UploadFile { name: name.to_string(), size })
    }

    pub fn end_of_file() -> Self {
        ClientMessage::UploadStatus(UploadStatus { error: true, reason: EOF_REASON.to_string() })
    }

    pub fn abort() -> Self {
        ClientMessage::AbortUpload(true)
    }

    pub fn ping() -> Self {
        ClientMessage::Ping(true)
    }

    /// Serialize with the outbound sequence id attached as `msgId`.
    pub fn encode(&self, msg_id: u64) -> Result<String, UpdateError> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.insert("msgId".to_string(), Value::from(msg_id));
        }
        Ok(serde_json::to_string(&value)?)
    }
}

// --- Server -> client ---

/// Advisory number the server may send as a number, a string such as
/// `"12.3%"`, or `"n/a"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Number(f64),
    Text(String),
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Number(n) => Some(*n),
            Reading::Text(text) => text.trim().trim_end_matches('%').trim().parse().ok(),
        }
    }
}

/// Pull request for the byte range `[offset, offset + size)`.
///
/// The server does not guarantee the range lies inside the asset.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunkRequest {
    #[serde(rename = "Pos")]
    pub offset: u64,
    #[serde(rename = "Size")]
    pub size: u32,
    #[serde(rename = "Progress", default)]
    pub progress: Option<Reading>,
    #[serde(rename = "EffTransferRate", default)]
    pub effective_rate: Option<Reading>,
    #[serde(rename = "RealTransferRate", default)]
    pub real_rate: Option<Reading>,
    #[serde(rename = "EtaSec", default)]
    pub eta_sec: Option<Reading>,
}

impl ChunkRequest {
    pub fn new(offset: u64, size: u32) -> Self {
        Self { offset, size, progress: None, effective_rate: None, real_rate: None, eta_sec: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StopDownload {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Reason", default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Pong,
    RequestChunk(ChunkRequest),
    StopDownload(StopDownload),
    Statistic(Value),
    /// A JSON object with none of the known keys.
    Unrecognized(Vec<String>),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, UpdateError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| UpdateError::ProtocolViolation(format!("unparseable server message: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| UpdateError::ProtocolViolation(format!("server message is not an object: {}", text)))?;

        if object.contains_key("pong") {
            return Ok(ServerMessage::Pong);
        }
        if let Some(body) = object.get("RequestChunk") {
            return Ok(ServerMessage::RequestChunk(decode_body("RequestChunk", body)?));
        }
        if let Some(body) = object.get("StopDownload") {
            return Ok(ServerMessage::StopDownload(decode_body("StopDownload", body)?));
        }
        if let Some(body) = object.get("Statistic") {
            return Ok(ServerMessage::Statistic(body.clone()));
        }
        Ok(ServerMessage::Unrecognized(object.keys().cloned().collect()))
    }
}

fn decode_body<T: for<'de> Deserialize<'de>>(kind: &str, body: &Value) -> Result<T, UpdateError> {
    T::deserialize(body).map_err(|e| UpdateError::ProtocolViolation(format!("malformed {}: {}", kind, e)))
}

/// Build the binary frame for a chunk: `offset` as u32 LE, then exactly
/// `payload.len()` bytes. No padding is ever added.
pub fn encode_chunk_frame(offset: u64, payload: &[u8]) -> Result<Bytes, UpdateError> {
    let header = u32::try_from(offset)
        .map_err(|_| UpdateError::ProtocolViolation(format!("chunk offset {} exceeds 32-bit frame header", offset)))?;
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32_le(header);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_message_shape() {
        let text = ClientMessage::start("update.swu", 1_000_000).encode(7).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["UploadFile"]["Name"], "update.swu");
        assert_eq!(value["UploadFile"]["Size"], 1_000_000);
        assert_eq!(value["msgId"], 7);
    }

    #[test]
    fn test_eof_message_shape() {
        let text = ClientMessage::end_of_file().encode(1).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["UploadStatus"]["Error"], true);
        assert_eq!(value["UploadStatus"]["Reason"], "reaching eof");
    }

    #[test]
    fn test_ping_and_abort_shape() {
        let ping: Value = serde_json::from_str(&ClientMessage::ping().encode(2).unwrap()).unwrap();
        assert_eq!(ping["ping"], true);
        let abort: Value = serde_json::from_str(&ClientMessage::abort().encode(3).unwrap()).unwrap();
        assert_eq!(abort["AbortUpload"], true);
    }

    #[test]
    fn test_parse_request_chunk_with_advisory_fields() {
        let text = r#"{"RequestChunk":{"Pos":200000,"Size":100000,"Progress":"20.0%","EffTransferRate":51200,"RealTransferRate":"n/a","EtaSec":"n/a"}}"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::RequestChunk(request) => {
                assert_eq!(request.offset, 200_000);
                assert_eq!(request.size, 100_000);
                assert_eq!(request.progress.and_then(|p| p.value()), Some(20.0));
                assert_eq!(request.effective_rate.and_then(|r| r.value()), Some(51200.0));
                assert_eq!(request.real_rate.and_then(|r| r.value()), None);
                assert_eq!(request.eta_sec.and_then(|r| r.value()), None);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_minimal_request_chunk() {
        match ServerMessage::parse(r#"{"RequestChunk":{"Pos":0,"Size":4096}}"#).unwrap() {
            ServerMessage::RequestChunk(request) => assert_eq!(request, ChunkRequest::new(0, 4096)),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_stop_pong_statistic() {
        assert_eq!(
            ServerMessage::parse(r#"{"StopDownload":{"Success":false,"Reason":"disk full"}}"#).unwrap(),
            ServerMessage::StopDownload(StopDownload { success: false, reason: "disk full".to_string() })
        );
        assert_eq!(ServerMessage::parse(r#"{"pong":true,"msgId":4}"#).unwrap(), ServerMessage::Pong);
        assert!(matches!(
            ServerMessage::parse(r#"{"Statistic":{"Chunks":12}}"#).unwrap(),
            ServerMessage::Statistic(_)
        ));
        assert_eq!(
            ServerMessage::parse(r#"{"Hello":1}"#).unwrap(),
            ServerMessage::Unrecognized(vec!["Hello".to_string()])
        );
    }

    #[test]
    fn test_parse_malformed_is_violation() {
        assert!(matches!(ServerMessage::parse("not json"), Err(UpdateError::ProtocolViolation(_))));
        assert!(matches!(ServerMessage::parse("[1,2]"), Err(UpdateError::ProtocolViolation(_))));
        assert!(matches!(
            ServerMessage::parse(r#"{"RequestChunk":{"Pos":-5,"Size":10}}"#),
            Err(UpdateError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_chunk_frame_layout() {
        let frame = encode_chunk_frame(0x0102_0304, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(&frame[..], &[0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 3);
    }

    #[test]
    fn test_chunk_frame_rejects_wide_offset() {
        let result = encode_chunk_frame(u64::from(u32::MAX) + 1, &[0]);
        assert!(matches!(result, Err(UpdateError::ProtocolViolation(_))));
    }
}
