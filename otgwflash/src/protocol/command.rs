//! Bootloader commands and responses.
//!
//! Every command starts with the same four byte header; responses echo it
//! back followed by the requested data:
//!
//! ```text
//! +--------+--------+---------+---------+-----------------+
//! | opcode | length | addr lo | addr hi | payload         |
//! +--------+--------+---------+---------+-----------------+
//! ```
//!
//! The meaning of `length` depends on the command: rows of four words for
//! program writes, words for program reads and bytes for data memory. Words
//! are sent little-endian. The VERSION query is the only command without an
//! address.

use crate::image::hex::WORD_MASK;
use crate::protocol::frame;
use byteorder::{LittleEndian, WriteBytesExt};

/// Size of the opcode/length/address header.
pub const HEADER_LEN: usize = 4;

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Query bootloader version and protected range.
    Version = 0,
    /// Read program memory.
    ReadProgram = 1,
    /// Write program memory.
    WriteProgram = 2,
    /// Erase a block of program memory.
    EraseProgram = 3,
    /// Read data memory.
    ReadData = 4,
    /// Write data memory.
    WriteData = 5,
    /// Read configuration words.
    ReadConfig = 6,
    /// Write configuration words.
    WriteConfig = 7,
    /// Leave the bootloader and start the application.
    Reset = 8,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Version,
            1 => Self::ReadProgram,
            2 => Self::WriteProgram,
            3 => Self::EraseProgram,
            4 => Self::ReadData,
            5 => Self::WriteData,
            6 => Self::ReadConfig,
            7 => Self::WriteConfig,
            8 => Self::Reset,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Version => "VERSION",
            Self::ReadProgram => "READPROG",
            Self::WriteProgram => "WRITEPROG",
            Self::EraseProgram => "ERASEPROG",
            Self::ReadData => "READDATA",
            Self::WriteData => "WRITEDATA",
            Self::ReadConfig => "READCFG",
            Self::WriteConfig => "WRITECFG",
            Self::Reset => "RESET",
        };
        f.write_str(name)
    }
}

/// Command frame builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: Opcode,
    data: Vec<u8>,
}

impl CommandFrame {
    fn with_header(opcode: Opcode, len: u8, addr: u16) -> Self {
        let mut data = Vec::with_capacity(HEADER_LEN);
        data.push(opcode as u8);
        data.push(len);
        data.extend_from_slice(&addr.to_le_bytes());
        Self { opcode, data }
    }

    /// Build the version query.
    pub fn version() -> Self {
        Self {
            opcode: Opcode::Version,
            data: vec![Opcode::Version as u8, 3],
        }
    }

    /// Build an erase of the program block starting at word `addr`.
    pub fn erase_program(addr: u16) -> Self {
        Self::with_header(Opcode::EraseProgram, 1, addr)
    }

    /// Build a program write of `words` at word `addr`.
    ///
    /// Words are masked to 14 bits; the length field counts rows of four words.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_program(addr: u16, words: &[u16]) -> Self {
        debug_assert!(words.len() % 4 == 0 && words.len() <= 32);
        let mut frame = Self::with_header(Opcode::WriteProgram, (words.len() / 4) as u8, addr);
        for &word in words {
            frame
                .data
                .write_u16::<LittleEndian>(word & WORD_MASK)
                .unwrap();
        }
        frame
    }

    /// Build a read of `len` program words at word `addr`.
    pub fn read_program(addr: u16, len: u8) -> Self {
        Self::with_header(Opcode::ReadProgram, len, addr)
    }

    /// Build a data memory write of `bytes` at `addr`.
    pub fn write_data(addr: u16, bytes: &[u8]) -> Self {
        let mut frame = Self::with_header(Opcode::WriteData, bytes.len() as u8, addr);
        frame.data.extend_from_slice(bytes);
        frame
    }

    /// Build a read of `len` data memory bytes at `addr`.
    pub fn read_data(addr: u8, len: u8) -> Self {
        Self::with_header(Opcode::ReadData, len, u16::from(addr))
    }

    /// Build the command that leaves the bootloader.
    pub fn reset() -> Self {
        Self {
            opcode: Opcode::Reset,
            data: vec![Opcode::Reset as u8, 0],
        }
    }

    /// Get the command opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Unframed command bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Build the complete, framed command.
    pub fn build(&self) -> Vec<u8> {
        frame::encode(&self.data)
    }
}

/// Response frame parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw opcode byte echoed by the target.
    pub opcode: u8,
    /// Length field.
    pub len: u8,
    /// Address field.
    pub address: u16,
    /// Data following the header.
    pub payload: Vec<u8>,
}

impl Response {
    /// Parse a decoded frame payload. Returns `None` when it is shorter than a header.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            opcode: frame[0],
            len: frame[1],
            address: u16::from_le_bytes([frame[2], frame[3]]),
            payload: frame[HEADER_LEN..].to_vec(),
        })
    }

    /// Opcode of the command this response belongs to, if known.
    pub fn command(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }

    /// Payload interpreted as little-endian words.
    pub fn words(&self) -> impl Iterator<Item = u16> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
    }

    /// Word `idx` of the payload.
    pub fn word(&self, idx: usize) -> Option<u16> {
        let bytes = self.payload.get(2 * idx..2 * idx + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}
