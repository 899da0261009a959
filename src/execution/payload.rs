//! Task Payload Wire Format
//!
//! The file a task hands to its runner:
//!
//! ```text
//! <u32 LE registry-len><u32 LE function-len><registry bytes><function bytes><JSON call>
//! ```
//!
//! The header is read first so a runner can refuse a payload meant for
//! another registry before decoding any arguments. The call body is
//! `{"args": [...], "kwargs": {...}}`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{Kwargs, Value};

/// Size of the fixed part of the header.
const HEADER_LEN: usize = 8;

/// Arguments of one function invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Call {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
}

/// A decoded payload: which function to run and with what.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub registry: String,
    pub function: String,
    pub call: Call,
}

impl Payload {
    pub fn new(registry: impl Into<String>, function: impl Into<String>, call: Call) -> Self {
        Self {
            registry: registry.into(),
            function: function.into(),
            call,
        }
    }

    /// Serializes the payload into its wire representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let registry = self.registry.as_bytes();
        let function = self.function.as_bytes();
        let body = serde_json::to_vec(&self.call)?;

        let mut buf = Vec::with_capacity(HEADER_LEN + registry.len() + function.len() + body.len());
        buf.extend_from_slice(&header_len(registry.len())?.to_le_bytes());
        buf.extend_from_slice(&header_len(function.len())?.to_le_bytes());
        buf.extend_from_slice(registry);
        buf.extend_from_slice(function);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parses the wire representation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (registry, function, rest) = decode_header(bytes)?;
        let call: Call = serde_json::from_slice(rest)?;
        Ok(Self {
            registry,
            function,
            call,
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.encode()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Self::decode(&fs::read(path)?)
    }
}

/// Splits the header from the body, returning `(registry, function, body)`.
pub fn decode_header(bytes: &[u8]) -> Result<(String, String, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Payload(format!(
            "expected at least {} header bytes, found {}",
            HEADER_LEN,
            bytes.len()
        )));
    }

    let registry_len = read_u32(&bytes[0..4]) as usize;
    let function_len = read_u32(&bytes[4..8]) as usize;
    let strings_end = HEADER_LEN + registry_len + function_len;

    if bytes.len() < strings_end {
        return Err(Error::Payload(format!(
            "header announces {} bytes of names but only {} remain",
            registry_len + function_len,
            bytes.len() - HEADER_LEN
        )));
    }

    let registry = utf8(&bytes[HEADER_LEN..HEADER_LEN + registry_len], "registry")?;
    let function = utf8(&bytes[HEADER_LEN + registry_len..strings_end], "function")?;

    Ok((registry, function, &bytes[strings_end..]))
}

fn header_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Payload(format!("name of {} bytes is too long", len)))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

fn utf8(bytes: &[u8], field: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Payload(format!("{} name is not UTF-8: {}", field, e)))
}
