//! Wire-level command framing and fixed-capacity argument frames.
//!
//! ## Command format
//!
//! `"<command-name>[ <args>]"`: the name runs to the first space; the
//! argument bytes start immediately after it. Arguments are either raw
//! text or, for structured RPCs, a postcard-encoded payload.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Default capacity for structured argument/result frames.
pub const DEFAULT_ARG_CAP: usize = 1024;

/// Errors during structured encode/decode.
#[derive(Debug, Error)]
pub enum WireError {
    /// Serialization failed or the value exceeds the frame capacity.
    #[error("argument encode failed: {0}")]
    Encode(postcard::Error),
    /// Deserialization failed.
    #[error("argument decode failed: {0}")]
    Decode(postcard::Error),
}

/// Splits a framed command into `(name, args)`.
///
/// The name is everything up to the first space; the args are everything
/// after it (empty when there is no space). Returns `None` when the name
/// is not valid UTF-8 or is empty.
#[must_use]
pub fn split_command(data: &[u8]) -> Option<(&str, &[u8])> {
    let (name, args) = match data.iter().position(|&b| b == b' ') {
        Some(at) => (&data[..at], &data[at + 1..]),
        None => (data, &data[data.len()..]),
    };
    if name.is_empty() {
        return None;
    }
    std::str::from_utf8(name).ok().map(|name| (name, args))
}

/// Frames a command name and argument bytes for the wire.
#[must_use]
pub fn frame_command(name: &str, args: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(name.len() + 1 + args.len());
    framed.extend_from_slice(name.as_bytes());
    if !args.is_empty() {
        framed.push(b' ');
        framed.extend_from_slice(args);
    }
    framed
}

/// Fixed-capacity buffer for structured argument/result encoding.
///
/// Values are encoded in place; a value that does not fit is an encode
/// failure, reported to the peer as an ordinary failed RPC result.
pub struct ArgFrame<const N: usize = DEFAULT_ARG_CAP> {
    len: u16,
    buf: [u8; N],
}

impl<const N: usize> ArgFrame<N> {
    /// Encodes `value` into a fresh frame.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, WireError> {
        let mut buf = [0u8; N];
        let used = postcard::to_slice(value, &mut buf).map_err(WireError::Encode)?;
        let len = used.len() as u16;
        Ok(Self { len, buf })
    }

    /// The encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }
}

/// Decodes a structured value from raw argument bytes.
pub fn decode_args<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    postcard::from_bytes(bytes).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Caps {
        version: u32,
        display: bool,
    }

    #[test]
    fn split_name_and_args() {
        let (name, args) = split_command(b"tools.set.version 12345").unwrap();
        assert_eq!(name, "tools.set.version");
        assert_eq!(args, b"12345");
    }

    #[test]
    fn split_bare_name() {
        let (name, args) = split_command(b"ping").unwrap();
        assert_eq!(name, "ping");
        assert!(args.is_empty());
    }

    #[test]
    fn split_preserves_later_spaces() {
        let (name, args) = split_command(b"log hello world").unwrap();
        assert_eq!(name, "log");
        assert_eq!(args, b"hello world");
    }

    #[test]
    fn split_rejects_empty_and_non_utf8_names() {
        assert!(split_command(b"").is_none());
        assert!(split_command(b" args-only").is_none());
        assert!(split_command(&[0xff, 0xfe, b' ', b'x']).is_none());
    }

    #[test]
    fn frame_without_args_has_no_trailing_space() {
        assert_eq!(frame_command("ping", b""), b"ping");
        assert_eq!(frame_command("log", b"hi"), b"log hi");
    }

    #[test]
    fn frame_and_split_roundtrip() {
        let framed = frame_command("caps.set", b"\x01\x02");
        let (name, args) = split_command(&framed).unwrap();
        assert_eq!(name, "caps.set");
        assert_eq!(args, b"\x01\x02");
    }

    #[test]
    fn arg_frame_roundtrip() {
        let caps = Caps {
            version: 9,
            display: true,
        };
        let frame: ArgFrame<64> = ArgFrame::encode(&caps).unwrap();
        let back: Caps = decode_args(frame.as_bytes()).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn arg_frame_rejects_oversized_values() {
        let big = vec![7u8; 128];
        let result: Result<ArgFrame<16>, _> = ArgFrame::encode(&big);
        assert!(matches!(result, Err(WireError::Encode(_))));
    }

    #[test]
    fn decode_garbage_fails() {
        let result: Result<Caps, _> = decode_args(&[0xde, 0xad]);
        assert!(matches!(result, Err(WireError::Decode(_))));
    }
}
