//! Length-prefixed binary frame codec for the RPC upstream variant.
//!
//! Frame layout: 1-byte flags (`0x00` for a normal message), a 4-byte
//! big-endian payload length, then the UTF-8 JSON payload. Responses arrive
//! as one complete body holding many consecutive frames, so decoding treats
//! a short buffer as "incomplete" rather than an error.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const HEADER_LEN: usize = 5;
const FLAG_MESSAGE: u8 = 0x00;

/// One decoded RPC message; fields the transcoder does not care about are
/// dropped during deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub block: Option<RpcBlock>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub chat: Option<RpcChat>,
    #[serde(default)]
    pub message: Option<RpcMessageInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcBlock {
    #[serde(default)]
    pub text: Option<RpcText>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcText {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcChat {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcMessageInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl RpcMessage {
    pub fn text_content(&self) -> Option<&str> {
        self.block
            .as_ref()?
            .text
            .as_ref()?
            .content
            .as_deref()
            .filter(|content| !content.is_empty())
    }

    /// Whether this message's text participates in output accumulation.
    pub fn appends_text(&self) -> bool {
        matches!(self.op.as_deref(), Some("set") | Some("append"))
    }
}

/// Encodes one payload into a framed message.
pub fn encode_message<T: Serialize>(payload: &T) -> serde_json::Result<Bytes> {
    let json = serde_json::to_vec(payload)?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + json.len());
    frame.put_u8(FLAG_MESSAGE);
    frame.put_u32(json.len() as u32);
    frame.put_slice(&json);
    Ok(frame.freeze())
}

/// Decodes the frame at the start of `data`.
///
/// Returns `None` for a short buffer (incomplete frame) or malformed JSON;
/// neither is an error at this layer.
pub fn decode_message(data: &[u8]) -> Option<Value> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let declared = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    if data.len() < HEADER_LEN + declared {
        return None;
    }
    serde_json::from_slice(&data[HEADER_LEN..HEADER_LEN + declared]).ok()
}

/// Walks a complete response body and decodes every whole frame in it.
///
/// A trailing partial frame is tolerated silently; frames whose payload is
/// not valid JSON are skipped.
pub fn parse_stream(data: &[u8]) -> Vec<RpcMessage> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + HEADER_LEN <= data.len() {
        let declared =
            u32::from_be_bytes([data[offset + 1], data[offset + 2], data[offset + 3], data[offset + 4]])
                as usize;
        if offset + HEADER_LEN + declared > data.len() {
            break;
        }
        if let Some(value) = decode_message(&data[offset..offset + HEADER_LEN + declared])
            && let Ok(message) = serde_json::from_value::<RpcMessage>(value)
        {
            messages.push(message);
        }
        offset += HEADER_LEN + declared;
    }

    messages
}

/// Concatenates `set`/`append` text across messages, stopping at the first
/// terminal marker.
pub fn extract_text(messages: &[RpcMessage]) -> String {
    let mut text = String::new();
    for message in messages {
        if message.appends_text()
            && let Some(content) = message.text_content()
        {
            text.push_str(content);
        }
        if message.done {
            break;
        }
    }
    text
}

pub fn extract_chat_id(messages: &[RpcMessage]) -> Option<&str> {
    messages
        .iter()
        .find_map(|message| message.chat.as_ref()?.id.as_deref())
}

pub fn extract_message_id(messages: &[RpcMessage]) -> Option<&str> {
    messages.iter().find_map(|message| {
        let info = message.message.as_ref()?;
        (info.role.as_deref() == Some("assistant")).then_some(info.id.as_deref()?)
    })
}
