//! ISO 7816-4 command and response APDU value types.
//!
//! The bridge never interprets APDU contents. These types only exist so callers
//! can use the structured calling convention of `card.transmit`; the driver
//! always receives the encoded bytes.

use serde::{Deserialize, Serialize};

use crate::core::error::{BridgeError, Result};
use crate::core::utils::{describe_status_word, format_hex_spaced};

const SHORT_MAX_LC: usize = 0xFF;
const SHORT_MAX_LE: u32 = 0x100;
const EXTENDED_MAX_LC: usize = 0xFFFF;
const EXTENDED_MAX_LE: u32 = 0x10000;

/// A command APDU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    #[serde(default)]
    pub data: Vec<u8>,
    /// Expected response length; 256 (short) and 65536 (extended) encode as zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub le: Option<u32>,
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_le(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    /// Whether this command needs the extended length encoding
    pub fn is_extended(&self) -> bool {
        self.data.len() > SHORT_MAX_LC || self.le.is_some_and(|le| le > SHORT_MAX_LE)
    }

    /// Encode the command, picking short or extended form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > EXTENDED_MAX_LC {
            return Err(BridgeError::InvalidRequest(format!(
                "Command data too long: {} bytes",
                self.data.len()
            )));
        }
        if let Some(le) = self.le {
            if le > EXTENDED_MAX_LE {
                return Err(BridgeError::InvalidRequest(format!("Le out of range: {le}")));
            }
        }

        let mut bytes = vec![self.cla, self.ins, self.p1, self.p2];

        if self.is_extended() {
            if !self.data.is_empty() {
                bytes.push(0x00);
                bytes.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                bytes.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                if self.data.is_empty() {
                    bytes.push(0x00);
                }
                bytes.extend_from_slice(&((le % EXTENDED_MAX_LE) as u16).to_be_bytes());
            }
        } else {
            if !self.data.is_empty() {
                bytes.push(self.data.len() as u8);
                bytes.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                bytes.push((le % SHORT_MAX_LE) as u8);
            }
        }

        Ok(bytes)
    }

    /// Parse an encoded command (cases 1 to 4, short and extended)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(BridgeError::InvalidRequest(format!(
                "Command APDU too short: {} bytes",
                bytes.len()
            )));
        }

        let mut command = CommandApdu::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[4..];

        match body {
            [] => {}
            [le] => command.le = Some(short_le(*le)),
            [0x00, hi, lo] => command.le = Some(extended_le(*hi, *lo)),
            [0x00, hi, lo, rest @ ..] => {
                let lc = u16::from_be_bytes([*hi, *lo]) as usize;
                if lc == 0 {
                    return Err(malformed(bytes));
                }
                if rest.len() == lc {
                    command.data = rest.to_vec();
                } else if rest.len() == lc + 2 {
                    command.data = rest[..lc].to_vec();
                    command.le = Some(extended_le(rest[lc], rest[lc + 1]));
                } else {
                    return Err(malformed(bytes));
                }
            }
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                if lc == 0 {
                    return Err(malformed(bytes));
                }
                if rest.len() == lc {
                    command.data = rest.to_vec();
                } else if rest.len() == lc + 1 {
                    command.data = rest[..lc].to_vec();
                    command.le = Some(short_le(rest[lc]));
                } else {
                    return Err(malformed(bytes));
                }
            }
        }

        Ok(command)
    }
}

impl std::fmt::Display for CommandApdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => f.write_str(&format_hex_spaced(&bytes)),
            Err(_) => write!(
                f,
                "{:02X} {:02X} {:02X} {:02X} (+{} bytes)",
                self.cla,
                self.ins,
                self.p1,
                self.p2,
                self.data.len()
            ),
        }
    }
}

fn short_le(byte: u8) -> u32 {
    if byte == 0 {
        SHORT_MAX_LE
    } else {
        byte as u32
    }
}

fn extended_le(hi: u8, lo: u8) -> u32 {
    match u16::from_be_bytes([hi, lo]) {
        0 => EXTENDED_MAX_LE,
        n => n as u32,
    }
}

fn malformed(bytes: &[u8]) -> BridgeError {
    BridgeError::InvalidRequest(format!(
        "Malformed command APDU: {}",
        format_hex_spaced(bytes)
    ))
}

/// A response APDU: body followed by the SW1/SW2 status bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseApdu {
    #[serde(default)]
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ResponseApdu {
    pub fn new(data: impl Into<Vec<u8>>, sw1: u8, sw2: u8) -> Self {
        Self {
            data: data.into(),
            sw1,
            sw2,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [data @ .., sw1, sw2] => Ok(Self::new(data.to_vec(), *sw1, *sw2)),
            _ => Err(BridgeError::InvalidRequest(format!(
                "Response APDU shorter than its status word: {} bytes",
                bytes.len()
            ))),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 2);
        bytes.extend_from_slice(&self.data);
        bytes.push(self.sw1);
        bytes.push(self.sw2);
        bytes
    }

    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// 90 00, or 61 xx (more data available)
    pub fn is_success(&self) -> bool {
        matches!((self.sw1, self.sw2), (0x90, 0x00) | (0x61, _))
    }

    pub fn describe_status(&self) -> String {
        describe_status_word(self.sw1, self.sw2)
    }
}
