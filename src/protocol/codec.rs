use crate::protocol::message::{InboundMessage, OutboundMessage};
use serde::{Serialize, de::DeserializeOwned};

/// Longest accepted frame line, newline excluded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug)]
pub enum ProtocolError {
    Empty,
    LineTooLong { limit: usize, actual: usize },
    Decode { source: serde_json::Error },
    Encode { source: serde_json::Error },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::LineTooLong { limit, actual } => {
                write!(f, "frame too long: {actual} > {limit}")
            }
            Self::Decode { source } => write!(f, "failed decoding frame: {source}"),
            Self::Encode { source } => write!(f, "failed encoding frame: {source}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode { source } | Self::Encode { source } => Some(source),
            Self::Empty | Self::LineTooLong { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

pub fn encode_outbound(msg: &OutboundMessage) -> Result<Vec<u8>> {
    encode_line(msg)
}

pub fn encode_inbound(msg: &InboundMessage) -> Result<Vec<u8>> {
    encode_line(msg)
}

pub fn decode_inbound(line: &[u8]) -> Result<InboundMessage> {
    decode_line(line)
}

pub fn decode_outbound(line: &[u8]) -> Result<OutboundMessage> {
    decode_line(line)
}

fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(msg).map_err(|source| ProtocolError::Encode { source })?;
    out.push(b'\n');
    Ok(out)
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    let line = trim_line_end(line);
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(ProtocolError::LineTooLong {
            limit: MAX_LINE_LEN,
            actual: line.len(),
        });
    }
    serde_json::from_slice(line).map_err(|source| ProtocolError::Decode { source })
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}
