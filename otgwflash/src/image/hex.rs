//! Intel-HEX style firmware images for the gateway PIC.
//!
//! The PIC toolchain emits one record per line:
//!
//! ```text
//! :LLAAAATT<data><CC>
//!  |  |   | |     +-- checksum (two's complement of all preceding bytes)
//!  |  |   | +-------- LL data bytes
//!  |  |   +---------- record type (0 = data, 1 = end of file)
//!  |  +-------------- 16-bit byte address
//!  +----------------- byte count (always even: data is 16-bit cells)
//! ```
//!
//! ## Address map
//!
//! ```text
//! 0x0000 - 0x3FFF   program memory (word index = address / 2)
//! 0x4000 - 0x41FF   configuration bits (only loaded on request)
//! 0x4200 - 0x43FF   data EEPROM (one byte per 16-bit cell)
//! 0x4400 -          ignored
//! ```
//!
//! Every cell is stored little-endian in the file, so the two hex bytes of a
//! cell are swapped before use.

use log::{debug, trace};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of 14-bit words in program memory.
pub const PROGRAM_WORDS: usize = 4096;

/// Number of bytes in data memory.
pub const DATA_BYTES: usize = 256;

/// Number of words in the configuration region.
pub const CONFIG_WORDS: usize = 256;

/// Value of an erased program word.
pub const ERASED_WORD: u16 = 0xFFFF;

/// Value of an erased data byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Mask applied to program words before they are written or compared.
pub const WORD_MASK: u16 = 0x3FFF;

/// First byte address of the configuration region.
pub const CONFIG_BASE: u16 = 0x4000;

/// First byte address of the data memory region.
pub const DATA_BASE: u16 = 0x4200;

/// Addresses at or above this value are ignored.
pub const PADDING_BASE: u16 = 0x4400;

/// Record type of a data record.
pub const RECORD_DATA: u8 = 0x00;

/// Record type of the end-of-file record.
pub const RECORD_EOF: u8 = 0x01;

/// First word of a bootloader-compatible image (`BSF PCLATH,3`).
pub const MAGIC_WORD: u16 = 0x158A;

/// Bits of the second word checked against [`MAGIC_PATTERN`].
pub const MAGIC_MASK: u16 = 0x3E00;

/// Expected value of `program[1] & MAGIC_MASK`.
pub const MAGIC_PATTERN: u16 = 0x2600;

/// Number of data bytes per record produced by [`MemoryImage::to_hex`].
const RECORD_BYTES: usize = 16;

/// Errors produced while loading a hex image.
///
/// Line numbers are 1-based.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Reading the image failed.
    #[error("failed to read image: {0}")]
    Io(#[from] io::Error),

    /// A line does not have the `:LLAAAATT...` structure or holds non-hex characters.
    #[error("line {line}: malformed record")]
    Parse {
        /// Offending line.
        line: usize,
    },

    /// The byte count of a record is odd.
    #[error("line {line}: invalid byte count {count} (must be even)")]
    InvalidLength {
        /// Offending line.
        line: usize,
        /// Byte count found in the record.
        count: u8,
    },

    /// The record checksum does not add up.
    #[error("line {line}: checksum mismatch (expected {expected:#04x}, found {actual:#04x})")]
    Checksum {
        /// Offending line.
        line: usize,
        /// Checksum computed from the record contents.
        expected: u8,
        /// Checksum stored in the record.
        actual: u8,
    },

    /// The record holds fewer bytes than its byte count promises.
    #[error("line {line}: record truncated")]
    Truncated {
        /// Offending line.
        line: usize,
    },

    /// The record would write outside of its memory region.
    #[error("line {line}: address {address:#06x} is outside of the memory region")]
    Range {
        /// Offending line.
        line: usize,
        /// Byte address of the record.
        address: u16,
    },

    /// The image ended without an end-of-file record.
    #[error("missing end-of-file record")]
    MissingEof,
}

/// One parsed line of a hex image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Number of data bytes.
    pub byte_count: u8,
    /// Byte address of the first data byte.
    pub address: u16,
    /// Record type.
    pub record_type: u8,
    /// Data bytes.
    pub payload: Vec<u8>,
    /// Checksum byte as stored in the record.
    pub checksum: u8,
}

impl HexRecord {
    /// Parse a single line. `line` is the 1-based line number used in errors.
    pub fn parse(text: &str, line: usize) -> Result<Self, LoadError> {
        let text = text.trim_end();
        let body = text.strip_prefix(':').ok_or(LoadError::Parse { line })?;
        if body.len() < 8 || !body.is_ascii() {
            return Err(LoadError::Parse { line });
        }

        let byte_count = hex_byte(&body[0..2]).ok_or(LoadError::Parse { line })?;
        let address = hex_byte(&body[2..4])
            .zip(hex_byte(&body[4..6]))
            .map(|(hi, lo)| u16::from_be_bytes([hi, lo]))
            .ok_or(LoadError::Parse { line })?;
        let record_type = hex_byte(&body[6..8]).ok_or(LoadError::Parse { line })?;

        if byte_count & 1 != 0 {
            return Err(LoadError::InvalidLength {
                line,
                count: byte_count,
            });
        }

        // Data bytes plus the trailing checksum.
        let rest = &body[8..];
        let needed = 2 * (usize::from(byte_count) + 1);
        if rest.len() < needed {
            return Err(LoadError::Truncated { line });
        }
        if rest.len() > needed {
            return Err(LoadError::Parse { line });
        }

        let bytes = rest
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).ok().and_then(hex_byte))
            .collect::<Option<Vec<u8>>>()
            .ok_or(LoadError::Parse { line })?;
        let (payload, checksum) = bytes.split_at(bytes.len() - 1);
        let checksum = checksum[0];

        let [addr_hi, addr_lo] = address.to_be_bytes();
        let sum = [byte_count, addr_hi, addr_lo, record_type]
            .iter()
            .chain(payload)
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        let expected = sum.wrapping_neg();
        if expected != checksum {
            return Err(LoadError::Checksum {
                line,
                expected,
                actual: checksum,
            });
        }

        Ok(Self {
            byte_count,
            address,
            record_type,
            payload: payload.to_vec(),
            checksum,
        })
    }

    /// Iterate over the 16-bit cells of the payload, already byte-swapped.
    fn cells(&self) -> impl ExactSizeIterator<Item = u16> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|cell| u16::from_le_bytes([cell[0], cell[1]]))
    }
}

fn hex_byte(s: &str) -> Option<u8> {
    // from_str_radix alone would accept a leading '+'.
    if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(s, 16).ok()
}

/// Program and data memory contents of one firmware image.
///
/// Both regions start out erased and have fixed sizes.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryImage {
    program: Vec<u16>,
    data: Vec<u8>,
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImage {
    /// Create an erased image.
    pub fn new() -> Self {
        Self {
            program: vec![ERASED_WORD; PROGRAM_WORDS],
            data: vec![ERASED_BYTE; DATA_BYTES],
        }
    }

    /// Load an image from a file on disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        debug!("Loading hex image from: {}", path.display());
        let store = FileStore::new(path);
        load(store.open_lines()?)
    }

    /// Load an image from hex text held in memory.
    pub fn from_hex_str(text: &str) -> Result<Self, LoadError> {
        load(text.lines().map(Ok))
    }

    /// Program memory words.
    pub fn program(&self) -> &[u16] {
        &self.program
    }

    /// Mutable access to program memory words.
    pub fn program_mut(&mut self) -> &mut [u16] {
        &mut self.program
    }

    /// Data memory bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to data memory bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether every word in `program[start..start + len]` is erased.
    ///
    /// Ranges running past the end of program memory only consider the part
    /// inside it.
    pub fn is_blank(&self, start: usize, len: usize) -> bool {
        let end = (start + len).min(PROGRAM_WORDS);
        self.program
            .get(start..end)
            .is_none_or(|words| words.iter().all(|&w| w == ERASED_WORD))
    }

    /// Whether the image starts with the jump into the bootloader-aware reset vector.
    pub fn has_magic(&self) -> bool {
        self.program[0] == MAGIC_WORD && self.program[1] & MAGIC_MASK == MAGIC_PATTERN
    }

    /// Number of program words that are not erased.
    pub fn used_program_words(&self) -> usize {
        self.program.iter().filter(|&&w| w != ERASED_WORD).count()
    }

    /// Number of data bytes that are not erased.
    pub fn used_data_bytes(&self) -> usize {
        self.data.iter().filter(|&&b| b != ERASED_BYTE).count()
    }

    /// Render the image back into hex text.
    ///
    /// Fully erased rows are left out; loading the result yields an
    /// identical image.
    pub fn to_hex(&self) -> String {
        let mut out = String::new();

        for (row, words) in self.program.chunks(RECORD_BYTES / 2).enumerate() {
            if words.iter().all(|&w| w == ERASED_WORD) {
                continue;
            }
            let payload: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            push_record(&mut out, (row * RECORD_BYTES) as u16, RECORD_DATA, &payload);
        }

        for (row, bytes) in self.data.chunks(RECORD_BYTES / 2).enumerate() {
            if bytes.iter().all(|&b| b == ERASED_BYTE) {
                continue;
            }
            let payload: Vec<u8> = bytes.iter().flat_map(|&b| [b, 0x00]).collect();
            let address = DATA_BASE + (row * RECORD_BYTES) as u16;
            push_record(&mut out, address, RECORD_DATA, &payload);
        }

        push_record(&mut out, 0, RECORD_EOF, &[]);
        out
    }
}

impl std::fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImage")
            .field("used_program_words", &self.used_program_words())
            .field("used_data_bytes", &self.used_data_bytes())
            .finish()
    }
}

#[allow(clippy::unwrap_used)] // Writing to String cannot fail
fn push_record(out: &mut String, address: u16, record_type: u8, payload: &[u8]) {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    let count = payload.len() as u8;
    let sum = [count, addr_hi, addr_lo, record_type]
        .iter()
        .chain(payload)
        .fold(0u8, |acc, b| acc.wrapping_add(*b));

    write!(out, ":{count:02X}{address:04X}{record_type:02X}").unwrap();
    for b in payload {
        write!(out, "{b:02X}").unwrap();
    }
    writeln!(out, "{:02X}", sum.wrapping_neg()).unwrap();
}

/// Source of hex image lines.
pub trait ImageStore {
    /// Open the image and return its lines in order.
    fn open_lines(&self) -> io::Result<Box<dyn Iterator<Item = io::Result<String>> + '_>>;
}

/// Hex image stored in a file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a store reading from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the image file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageStore for FileStore {
    fn open_lines(&self) -> io::Result<Box<dyn Iterator<Item = io::Result<String>> + '_>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(file).lines()))
    }
}

impl ImageStore for str {
    fn open_lines(&self) -> io::Result<Box<dyn Iterator<Item = io::Result<String>> + '_>> {
        Ok(Box::new(self.lines().map(|l| Ok(l.to_string()))))
    }
}

impl ImageStore for String {
    fn open_lines(&self) -> io::Result<Box<dyn Iterator<Item = io::Result<String>> + '_>> {
        self.as_str().open_lines()
    }
}

/// Load program and data memory from hex lines.
///
/// Configuration records are skipped. Loading stops at the end-of-file
/// record; a single bad line fails the whole load.
pub fn load<I, S>(lines: I) -> Result<MemoryImage, LoadError>
where
    I: IntoIterator<Item = io::Result<S>>,
    S: AsRef<str>,
{
    load_inner(lines, None)
}

/// Like [`load`], but also fills `config` from the configuration region.
pub fn load_with_config<I, S>(
    lines: I,
    config: &mut [u16; CONFIG_WORDS],
) -> Result<MemoryImage, LoadError>
where
    I: IntoIterator<Item = io::Result<S>>,
    S: AsRef<str>,
{
    load_inner(lines, Some(config))
}

fn load_inner<I, S>(
    lines: I,
    mut config: Option<&mut [u16; CONFIG_WORDS]>,
) -> Result<MemoryImage, LoadError>
where
    I: IntoIterator<Item = io::Result<S>>,
    S: AsRef<str>,
{
    let mut image = MemoryImage::new();

    for (idx, text) in lines.into_iter().enumerate() {
        let line = idx + 1;
        let text = text?;
        let text = text.as_ref();
        if text.trim().is_empty() {
            continue;
        }

        let record = HexRecord::parse(text, line)?;
        trace!(
            "line {line}: type {} @ {:#06x}, {} bytes",
            record.record_type, record.address, record.byte_count
        );

        match record.record_type {
            RECORD_EOF => {
                debug!(
                    "Hex image loaded: {} program words, {} data bytes",
                    image.used_program_words(),
                    image.used_data_bytes()
                );
                return Ok(image);
            },
            RECORD_DATA => {
                let address = record.address;
                if address >= PADDING_BASE {
                    continue;
                } else if address >= DATA_BASE {
                    let start = usize::from((address - DATA_BASE) / 2);
                    // Only the low byte of each swapped cell is meaningful.
                    let cells = record.cells().map(|c| (c & 0x00FF) as u8);
                    store(&mut image.data, start, cells).ok_or(LoadError::Range { line, address })?;
                } else if address >= CONFIG_BASE {
                    let Some(config) = config.as_deref_mut() else {
                        continue;
                    };
                    let start = usize::from((address - CONFIG_BASE) / 2);
                    store(config, start, record.cells()).ok_or(LoadError::Range { line, address })?;
                } else {
                    let start = usize::from(address / 2);
                    store(&mut image.program, start, record.cells())
                        .ok_or(LoadError::Range { line, address })?;
                }
            },
            other => trace!("line {line}: ignoring record type {other:#04x}"),
        }
    }

    Err(LoadError::MissingEof)
}

fn store<T>(region: &mut [T], start: usize, values: impl ExactSizeIterator<Item = T>) -> Option<()> {
    let slots = region.get_mut(start..start + values.len())?;
    for (slot, value) in slots.iter_mut().zip(values) {
        *slot = value;
    }
    Some(())
}
