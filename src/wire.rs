//! The line-oriented JSON wire protocol spoken between a session and its
//! connected client: one JSON object per line.
//!
//! Framing is simpler than the teacher's DAP Content-Length framing (see
//! `debug_adapter::codec::decoder`) since the wire protocol here is a flat
//! newline-delimited stream rather than headers-plus-body; `Frame` plays the
//! role that crate's `Message` enum plays, with manual (de)serialization so
//! the discriminant key (`command`/`response`/`error`) and its payload land
//! in the same JSON object instead of a nested `{"type": ..., "body": ...}`.

use std::io::{BufRead, Write};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One parsed line of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `{"command": <name>, ...params}`
    Request { command: String, params: Map<String, Value> },
    /// `{"response": <name>, ...fields}`
    Response { response: String, fields: Map<String, Value> },
    /// `{"error": <kind>, "message": <text>}`
    Error { kind: String, message: String },
}

impl Frame {
    pub fn request(command: impl Into<String>, params: Map<String, Value>) -> Self {
        Frame::Request { command: command.into(), params }
    }

    pub fn response(name: impl Into<String>, fields: Map<String, Value>) -> Self {
        Frame::Response { response: name.into(), fields }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Error { kind: kind.into(), message: message.into() }
    }
}

impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = Map::new();
        match self {
            Frame::Request { command, params } => {
                map.insert("command".to_string(), Value::String(command.clone()));
                map.extend(params.clone());
            }
            Frame::Response { response, fields } => {
                map.insert("response".to_string(), Value::String(response.clone()));
                map.extend(fields.clone());
            }
            Frame::Error { kind, message } => {
                map.insert("error".to_string(), Value::String(kind.clone()));
                map.insert("message".to_string(), Value::String(message.clone()));
            }
        }
        Value::Object(map).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut map = Map::deserialize(deserializer)?;
        if let Some(Value::String(command)) = map.remove("command") {
            return Ok(Frame::Request { command, params: map });
        }
        if let Some(Value::String(response)) = map.remove("response") {
            return Ok(Frame::Response { response, fields: map });
        }
        if let Some(Value::String(kind)) = map.remove("error") {
            let message = match map.remove("message") {
                Some(Value::String(m)) => m,
                _ => String::new(),
            };
            return Ok(Frame::Error { kind, message });
        }
        Err(D::Error::custom(
            "wire message is missing a `command`, `response`, or `error` key",
        ))
    }
}

/// Read one `Frame` off a line-buffered reader, blocking until a full line
/// (or EOF) arrives. Returns `Ok(None)` on a clean EOF between messages.
pub fn read_frame(reader: &mut impl BufRead) -> Result<Option<Frame>, serde_json::Error> {
    let mut line = String::new();
    let bytes_read = reader
        .read_line(&mut line)
        .map_err(serde_json::Error::io)?;
    if bytes_read == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']);
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Write one `Frame` terminated by `\n`, flushing immediately so the peer
/// sees it without buffering delay.
pub fn write_frame(writer: &mut impl Write, frame: &Frame) -> Result<(), serde_json::Error> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).map_err(serde_json::Error::io)?;
    writer.flush().map_err(serde_json::Error::io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_through_a_line() {
        let mut params = Map::new();
        params.insert("addr".to_string(), json!(0x1000));
        let frame = Frame::request("read_dp", params);

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        assert!(buf.ends_with(b"\n"));

        let mut reader = std::io::BufReader::new(&buf[..]);
        let parsed = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn response_keeps_its_extra_fields() {
        let mut fields = Map::new();
        fields.insert("result".to_string(), json!("ARM"));
        let frame = Frame::response("dap_info", fields.clone());

        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["response"], json!("dap_info"));
        assert_eq!(value["result"], json!("ARM"));
    }

    #[test]
    fn error_frame_has_kind_and_message() {
        let frame = Frame::error("TransferError", "ack=FAULT executed 0 of 3");
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["error"], json!("TransferError"));
        assert_eq!(value["message"], json!("ack=FAULT executed 0 of 3"));
    }

    #[test]
    fn missing_discriminant_is_rejected() {
        let line = "{\"foo\": 1}\n";
        let mut reader = std::io::BufReader::new(line.as_bytes());
        assert!(read_frame(&mut reader).unwrap_err().is_data());
    }

    #[test]
    fn eof_yields_none() {
        let mut reader = std::io::BufReader::new(&b""[..]);
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }
}
