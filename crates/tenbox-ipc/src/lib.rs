//! The manager <-> runtime wire protocol: one tab-separated key=value
//! record per line, backslash escaping for `\\`, `\t`, `\n` and `=`, and
//! an optional binary payload announced by a `payload_size` field whose
//! bytes immediately follow the line.

use std::collections::BTreeMap;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Control,
    Console,
    Input,
    Display,
    Audio,
    Clipboard,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Control => "control",
            Channel::Console => "console",
            Channel::Input => "input",
            Channel::Display => "display",
            Channel::Audio => "audio",
            Channel::Clipboard => "clipboard",
        }
    }

    pub fn from_str(value: &str) -> Option<Channel> {
        Some(match value {
            "control" => Channel::Control,
            "console" => Channel::Console,
            "input" => Channel::Input,
            "display" => Channel::Display,
            "audio" => Channel::Audio,
            "clipboard" => Channel::Clipboard,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
    Event,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Event => "event",
        }
    }

    pub fn from_str(value: &str) -> Option<Kind> {
        Some(match value {
            "request" => Kind::Request,
            "response" => Kind::Response,
            "event" => Kind::Event,
            _ => return None,
        })
    }
}

/// One protocol message. `fields` is ordered so encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u32,
    pub channel: Channel,
    pub kind: Kind,
    pub msg_type: String,
    pub vm_id: String,
    pub request_id: u64,
    pub fields: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(channel: Channel, kind: Kind, msg_type: &str, vm_id: &str, request_id: u64) -> Self {
        Message {
            version: PROTOCOL_VERSION,
            channel,
            kind,
            msg_type: msg_type.to_string(),
            vm_id: vm_id.to_string(),
            request_id,
            fields: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

fn escape_into(out: &mut String, value: &str) {
    for ch in value.chars() {
        if matches!(ch, '\\' | '\t' | '\n' | '=') {
            out.push('\\');
        }
        out.push(ch);
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut escaped = false;
    for ch in value.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Split a line on unescaped tabs.
fn split_fields(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut token = String::new();
    let mut escaped = false;
    for ch in line.chars() {
        if escaped {
            token.push('\\');
            token.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '\t' => out.push(std::mem::take(&mut token)),
            _ => token.push(ch),
        }
    }
    out.push(token);
    out
}

/// Find the key=value separator: the first unescaped '='.
fn split_key_value(token: &str) -> Option<(String, String)> {
    let mut escaped = false;
    for (i, ch) in token.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '=' => {
                return Some((unescape(&token[..i]), unescape(&token[i + 1..])));
            }
            _ => {}
        }
    }
    None
}

/// Encode a message, payload included.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut line = String::new();
    line.push_str("version=");
    line.push_str(&message.version.to_string());
    line.push_str("\tchannel=");
    line.push_str(message.channel.as_str());
    line.push_str("\tkind=");
    line.push_str(message.kind.as_str());
    line.push_str("\ttype=");
    escape_into(&mut line, &message.msg_type);
    line.push_str("\tvm_id=");
    escape_into(&mut line, &message.vm_id);
    line.push_str("\trequest_id=");
    line.push_str(&message.request_id.to_string());

    for (key, value) in &message.fields {
        line.push('\t');
        escape_into(&mut line, key);
        line.push('=');
        escape_into(&mut line, value);
    }
    if !message.payload.is_empty() {
        line.push_str("\tpayload_size=");
        line.push_str(&message.payload.len().to_string());
    }
    line.push('\n');

    let mut out = line.into_bytes();
    out.extend_from_slice(&message.payload);
    out
}

/// Decode a single header line (no payload bytes). Returns the message and
/// the announced payload size.
fn decode_line(line: &str) -> Option<(Message, usize)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let tokens = split_fields(line);
    if tokens.len() < 6 {
        return None;
    }

    let mut message = Message::new(Channel::Control, Kind::Request, "", "", 0);
    let mut payload_size = 0usize;
    for token in &tokens {
        let Some((key, value)) = split_key_value(token) else {
            continue;
        };
        match key.as_str() {
            "version" => message.version = value.parse().ok()?,
            "channel" => message.channel = Channel::from_str(&value)?,
            "kind" => message.kind = Kind::from_str(&value)?,
            "type" => message.msg_type = value,
            "vm_id" => message.vm_id = value,
            "request_id" => message.request_id = value.parse().ok()?,
            "payload_size" => payload_size = value.parse().ok()?,
            _ => {
                message.fields.insert(key, value);
            }
        }
    }

    if message.version != PROTOCOL_VERSION || message.msg_type.is_empty() {
        return None;
    }
    Some((message, payload_size))
}

/// Incremental decoder: push raw bytes in, pop complete messages out. A
/// `payload_size` line leaves the decoder waiting for exactly that many
/// raw bytes before the message completes.
#[derive(Default)]
pub struct Decoder {
    buffer: Vec<u8>,
    pending: Option<(Message, usize)>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if let Some((message, needed)) = self.pending.take() {
                if self.buffer.len() < needed {
                    self.pending = Some((message, needed));
                    return None;
                }
                let mut message = message;
                message.payload = self.buffer.drain(..needed).collect();
                return Some(message);
            }

            let newline = self.buffer.iter().position(|b| *b == b'\n')?;
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let Ok(line) = std::str::from_utf8(&line) else {
                continue; // skip undecodable lines
            };
            let Some((message, payload_size)) = decode_line(line) else {
                continue;
            };
            if payload_size > 0 {
                self.pending = Some((message, payload_size));
                continue;
            }
            return Some(message);
        }
    }
}
