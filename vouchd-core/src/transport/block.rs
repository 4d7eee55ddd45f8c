//! Block option arithmetic for block-wise transfers (RFC 7959).
//!
//! A block option value packs the block number, the "more blocks" flag and
//! the size exponent into one unsigned integer:
//! `value = num << 4 | more << 3 | szx`, encoded big-endian with leading
//! zero bytes elided.

use crate::error::{Error, Result};

/// Largest representable block number (20 bits).
const MAX_BLOCK_NUM: u32 = 0x000F_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockValue {
    pub fn new(num: u32, more: bool, size: usize) -> Result<Self> {
        if num > MAX_BLOCK_NUM {
            return Err(Error::Transport(format!("block number {num} out of range")));
        }
        Ok(Self {
            num,
            more,
            szx: szx_for(size)?,
        })
    }

    /// Block payload size in bytes.
    pub fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx);
        if value == 0 {
            return Vec::new();
        }
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        bytes[skip..].to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() > 3 {
            return Err(Error::Transport(format!(
                "block option of {} bytes is too long",
                raw.len()
            )));
        }
        let mut value: u32 = 0;
        for &b in raw {
            value = (value << 8) | u32::from(b);
        }
        let szx = (value & 0x7) as u8;
        if szx == 7 {
            return Err(Error::Transport("reserved block size exponent 7".into()));
        }
        Ok(Self {
            num: value >> 4,
            more: value & 0x8 != 0,
            szx,
        })
    }
}

/// Size exponent for a power-of-two block size in 16..=1024.
pub fn szx_for(size: usize) -> Result<u8> {
    match size {
        16 => Ok(0),
        32 => Ok(1),
        64 => Ok(2),
        128 => Ok(3),
        256 => Ok(4),
        512 => Ok(5),
        1024 => Ok(6),
        _ => Err(Error::Transport(format!("unsupported block size {size}"))),
    }
}
