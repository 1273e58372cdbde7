// Wire layout (little-endian, identical to the native 64-bit struct):
//
// | offset | size | field                              |
// |--------|------|------------------------------------|
// | 0      | 4    | size tag, always [`ENVELOPE_SIZE`] |
// | 4      | 4    | reserved (padding)                 |
// | 8      | 8    | origin window handle               |
// | 16     | 64   | command text, NUL-terminated       |
// | 80     | 256  | argument text, NUL-terminated      |
//
// Receivers must check the size tag before reading anything else.

use crate::messages::WindowHandle;

pub const MAX_BANGCOMMAND: usize = 64;
pub const MAX_BANGARGS: usize = 256;

const SIZE_OFFSET: usize = 0;
const WINDOW_OFFSET: usize = 8;
const COMMAND_OFFSET: usize = 16;
const ARGS_OFFSET: usize = COMMAND_OFFSET + MAX_BANGCOMMAND;

pub const ENVELOPE_SIZE: usize = ARGS_OFFSET + MAX_BANGARGS;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope truncated: {0} bytes")]
    Truncated(usize),
    #[error("envelope size tag mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("envelope command text is empty")]
    EmptyCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BangEnvelope {
    pub origin: WindowHandle,
    pub command: String,
    pub args: String,
}

impl BangEnvelope {
    pub fn new(origin: WindowHandle, command: &str, args: &str) -> Self {
        Self {
            origin,
            command: truncate_to(command, MAX_BANGCOMMAND - 1).to_string(),
            args: truncate_to(args, MAX_BANGARGS - 1).to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; ENVELOPE_SIZE];
        out[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&(ENVELOPE_SIZE as u32).to_le_bytes());
        out[WINDOW_OFFSET..WINDOW_OFFSET + 8]
            .copy_from_slice(&(self.origin.0 as i64).to_le_bytes());
        write_text(&mut out[COMMAND_OFFSET..ARGS_OFFSET], &self.command);
        write_text(&mut out[ARGS_OFFSET..ENVELOPE_SIZE], &self.args);
        out
    }

    /// Decodes an envelope, validating the size tag first.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let actual = read_size_tag(bytes)?;
        if actual != ENVELOPE_SIZE {
            return Err(EnvelopeError::SizeMismatch {
                expected: ENVELOPE_SIZE,
                actual,
            });
        }
        if bytes.len() < ENVELOPE_SIZE {
            return Err(EnvelopeError::Truncated(bytes.len()));
        }

        let mut window = [0_u8; 8];
        window.copy_from_slice(&bytes[WINDOW_OFFSET..WINDOW_OFFSET + 8]);
        let origin = WindowHandle(i64::from_le_bytes(window) as isize);

        let command = read_text(&bytes[COMMAND_OFFSET..ARGS_OFFSET]);
        if command.trim().is_empty() {
            return Err(EnvelopeError::EmptyCommand);
        }
        let args = read_text(&bytes[ARGS_OFFSET..ENVELOPE_SIZE]);

        Ok(Self {
            origin,
            command,
            args,
        })
    }
}

pub fn read_size_tag(bytes: &[u8]) -> Result<usize, EnvelopeError> {
    if bytes.len() < 4 {
        return Err(EnvelopeError::Truncated(bytes.len()));
    }
    let mut tag = [0_u8; 4];
    tag.copy_from_slice(&bytes[SIZE_OFFSET..SIZE_OFFSET + 4]);
    Ok(u32::from_le_bytes(tag) as usize)
}

fn truncate_to(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn write_text(field: &mut [u8], text: &str) {
    let text = truncate_to(text, field.len() - 1);
    field[..text.len()].copy_from_slice(text.as_bytes());
    field[text.len()] = 0;
}

fn read_text(field: &[u8]) -> String {
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
