//! State carried through one upgrade attempt.

use crate::image::hex::{MemoryImage, PROGRAM_WORDS};
use crate::protocol::command::Opcode;

/// Word address the failsafe patch is written to.
pub const FAILSAFE_ADDR: u16 = 0x20;

/// Number of words in the failsafe patch.
pub const FAILSAFE_WORDS: usize = 4;

/// Program words per erase/write/read block.
pub const CODE_BLOCK_WORDS: u16 = 32;

/// Data bytes per write/read block.
pub const DATA_BLOCK_BYTES: u16 = 64;

/// Upgrade phases, in the order they are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Phase {
    /// No session.
    Idle,
    /// Target reset pulsed, waiting for the bootloader to speak.
    Reset,
    /// Waiting for the version/protection response.
    Version,
    /// Writing the failsafe patch.
    Prep,
    /// Writing program memory.
    Code,
    /// Writing data memory.
    Data,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Reset => "reset",
            Self::Version => "version",
            Self::Prep => "prep",
            Self::Code => "code",
            Self::Data => "data",
        };
        f.write_str(name)
    }
}

impl Phase {
    /// Retries allowed in this phase before the session fails.
    pub fn retry_limit(self) -> u16 {
        match self {
            Self::Idle => 0,
            Self::Reset | Self::Prep => 5,
            Self::Version => 10,
            Self::Code | Self::Data => 100,
        }
    }
}

/// Inclusive word range holding the bootloader's self-programming routine.
///
/// The range comes from the target's VERSION answer. A range touching the
/// failsafe block at [`FAILSAFE_ADDR`] cannot be honoured, since the patch
/// would overwrite the bootloader. Such an answer is logged and retried like
/// a missing one, so a target that keeps reporting it ends with
/// [`Outcome::Retries`](crate::engine::Outcome::Retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionBoundary {
    /// First protected word.
    pub low: u16,
    /// Last protected word.
    pub high: u16,
}

impl ProtectionBoundary {
    /// Create a boundary; `None` unless `low <= high` and both lie in program memory.
    pub fn new(low: u16, high: u16) -> Option<Self> {
        (low <= high && usize::from(high) < PROGRAM_WORDS).then_some(Self { low, high })
    }

    /// Whether the `len` words starting at `start` touch the protected range.
    pub fn overlaps(&self, start: u16, len: u16) -> bool {
        len > 0 && start + (len - 1) >= self.low && start <= self.high
    }
}

/// Instructions written at [`FAILSAFE_ADDR`] before the real image.
///
/// They call the bootloader entry point and loop, so a target that loses
/// power halfway through the upgrade comes back up in the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailsafePatch([u16; FAILSAFE_WORDS]);

impl FailsafePatch {
    /// Compute the patch jumping into `boundary.low`.
    pub fn for_boundary(boundary: ProtectionBoundary) -> Self {
        let entry = boundary.low;
        // BSF/BCF PCLATH,3 selects the code page of the entry point.
        let page = if entry & 0x800 != 0 { 0x158A } else { 0x118A };
        Self([
            page,
            0x2000 | (entry & 0x7FF), // CALL entry
            0x118A,                   // BCF PCLATH,3
            0x2800 | FAILSAFE_ADDR,   // GOTO FAILSAFE_ADDR
        ])
    }

    /// Patch words.
    pub fn words(&self) -> &[u16; FAILSAFE_WORDS] {
        &self.0
    }
}

/// Mutable state of the active upgrade.
#[derive(Debug)]
pub struct UpgradeSession {
    /// Current phase.
    pub phase: Phase,
    /// Word (program) or byte (data) address being worked on.
    pub pc: u16,
    /// Retries spent in the current phase.
    pub retries: u16,
    /// Words/bytes that failed verification so far.
    pub mismatches: u32,
    /// Last command sent to the target.
    pub last_command: Option<Opcode>,
    /// Protected range reported by the bootloader.
    pub boundary: Option<ProtectionBoundary>,
    /// Failsafe patch derived from `boundary`.
    pub failsafe: Option<FailsafePatch>,
    /// Skip program blocks that are fully erased in the image.
    pub skip_blank_blocks: bool,
    /// Image being written.
    pub image: MemoryImage,
}

impl UpgradeSession {
    /// Create an idle session owning `image`.
    pub fn new(image: MemoryImage, skip_blank_blocks: bool) -> Self {
        Self {
            phase: Phase::Idle,
            pc: 0,
            retries: 0,
            mismatches: 0,
            last_command: None,
            boundary: None,
            failsafe: None,
            skip_blank_blocks,
            image,
        }
    }

    /// Move to `phase`, clearing the retry counter.
    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.retries = 0;
    }

    /// Count a failed round trip. Returns `false` once the phase budget is spent.
    pub fn retry(&mut self) -> bool {
        self.retries += 1;
        self.retries <= self.phase.retry_limit()
    }
}
