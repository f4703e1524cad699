//! Upgrade state machine.
//!
//! ```text
//!  Idle -> Reset -> Version -> Prep -> Code -> Data -> Idle
//!            ^         ^        ^       ^       ^
//!            +- retry -+- retry-+-retry-+-retry-+
//! ```
//!
//! [`step`] consumes one [`Event`] and returns the [`Action`]s the caller has
//! to carry out. It performs no I/O of its own.

use crate::engine::Outcome;
use crate::engine::session::{
    CODE_BLOCK_WORDS, DATA_BLOCK_BYTES, FAILSAFE_ADDR, FAILSAFE_WORDS, FailsafePatch, Phase,
    ProtectionBoundary, UpgradeSession,
};
use crate::image::hex::{DATA_BYTES, PROGRAM_WORDS, WORD_MASK};
use crate::protocol::command::{CommandFrame, Opcode, Response};
use log::{debug, info, warn};

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A checksum-valid frame arrived.
    Frame(Vec<u8>),
    /// No frame arrived within the round-trip budget.
    Timeout,
}

/// Work requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Pulse the target's reset line.
    PulseReset,
    /// Transmit a command.
    Send(CommandFrame),
    /// A block was verified; `pc` is the next address to program.
    Progress {
        /// Phase the block belongs to.
        phase: Phase,
        /// Next address.
        pc: u16,
    },
    /// The session is over.
    Finish(Outcome),
}

/// Start a fresh session: clear the counters and reset the target.
pub fn begin(session: &mut UpgradeSession) -> Vec<Action> {
    session.mismatches = 0;
    session.last_command = None;
    session.enter(Phase::Reset);
    info!("Resetting target into the bootloader");
    vec![Action::PulseReset]
}

/// Advance the session by one event.
///
/// Stale frames produce no actions, so the pending deadline stands.
pub fn step(session: &mut UpgradeSession, event: Event) -> Vec<Action> {
    let mut actions = Vec::new();
    if is_stale(session, &event) {
        return actions;
    }

    match session.phase {
        Phase::Idle => {},
        Phase::Reset => on_reset(session, &event, &mut actions),
        Phase::Version => on_version(session, &event, &mut actions),
        Phase::Prep => on_prep(session, &event, &mut actions),
        Phase::Code => on_code(session, &event, &mut actions),
        Phase::Data => on_data(session, &event, &mut actions),
    }

    for action in &actions {
        if let Action::Send(cmd) = action {
            session.last_command = Some(cmd.opcode());
        }
    }
    actions
}

/// Whether `event` is a frame that does not answer the outstanding command.
///
/// Late answers to a command that already timed out look like this. They
/// are dropped without spending a retry.
fn is_stale(session: &UpgradeSession, event: &Event) -> bool {
    let Event::Frame(frame) = event else {
        return false;
    };
    if matches!(session.phase, Phase::Idle | Phase::Reset) {
        return false;
    }
    let Some(response) = Response::parse(frame) else {
        debug!("Ignoring short frame in {} phase", session.phase);
        return true;
    };
    let command = response.command();
    let is_read = matches!(command, Some(Opcode::ReadProgram | Opcode::ReadData));
    let stale = command != session.last_command || (is_read && response.address != session.pc);
    if stale {
        debug!(
            "Ignoring stale response {:#04x} at {:#06x} in {} phase",
            response.opcode, response.address, session.phase
        );
    }
    stale
}

/// Parse `event` as the response to the last command.
fn expected_response(session: &UpgradeSession, event: &Event) -> Option<Response> {
    let Event::Frame(frame) = event else {
        if let Some(cmd) = session.last_command {
            warn!("No response to {cmd} in {} phase", session.phase);
        }
        return None;
    };
    Response::parse(frame)
}

/// Spend a retry, or fail the session once the phase budget is exhausted.
fn retry_or_fail(session: &mut UpgradeSession, actions: &mut Vec<Action>) -> bool {
    if session.retry() {
        warn!(
            "Retrying {} phase at {:#06x} ({}/{})",
            session.phase,
            session.pc,
            session.retries,
            session.phase.retry_limit()
        );
        true
    } else {
        warn!("Giving up after {} retries in {} phase", session.retries - 1, session.phase);
        actions.push(Action::Finish(Outcome::Retries));
        false
    }
}

fn on_reset(session: &mut UpgradeSession, event: &Event, actions: &mut Vec<Action>) {
    // Any framed output means the bootloader is running.
    if let Event::Frame(_) = event {
        session.enter(Phase::Version);
        actions.push(Action::Send(CommandFrame::version()));
    } else if retry_or_fail(session, actions) {
        actions.push(Action::PulseReset);
    }
}

fn on_version(session: &mut UpgradeSession, event: &Event, actions: &mut Vec<Action>) {
    let boundary = expected_response(session, event)
        .and_then(|r| ProtectionBoundary::new(r.word(0)?, r.word(1)?))
        .filter(|b| {
            let usable = !b.overlaps(FAILSAFE_ADDR, CODE_BLOCK_WORDS);
            if !usable {
                warn!(
                    "Rejecting protected range {:#06x}..={:#06x}: it overlaps the failsafe block at {FAILSAFE_ADDR:#06x}",
                    b.low, b.high
                );
            }
            usable
        });

    match boundary {
        Some(boundary) => {
            let failsafe = FailsafePatch::for_boundary(boundary);
            info!(
                "Bootloader protects {:#06x}..={:#06x}",
                boundary.low, boundary.high
            );
            debug!("Failsafe patch: {:04X?}", failsafe.words());
            session.boundary = Some(boundary);
            session.failsafe = Some(failsafe);
            session.pc = FAILSAFE_ADDR;
            session.enter(Phase::Prep);
            actions.push(Action::Send(CommandFrame::erase_program(session.pc)));
        },
        None => {
            if retry_or_fail(session, actions) {
                actions.push(Action::Send(CommandFrame::version()));
            }
        },
    }
}

fn on_prep(session: &mut UpgradeSession, event: &Event, actions: &mut Vec<Action>) {
    let Some(failsafe) = session.failsafe else {
        actions.push(Action::Finish(Outcome::Retries));
        return;
    };
    let pc = session.pc;

    match expected_response(session, event) {
        Some(r) if r.command() == Some(Opcode::EraseProgram) => {
            actions.push(Action::Send(CommandFrame::write_program(pc, failsafe.words())));
            return;
        },
        Some(r) if r.command() == Some(Opcode::WriteProgram) => {
            actions.push(Action::Send(CommandFrame::read_program(pc, FAILSAFE_WORDS as u8)));
            return;
        },
        Some(r)
            if usize::from(r.len) == FAILSAFE_WORDS
                && r.address == pc
                && verify_words(session, failsafe.words(), &r) =>
        {
            info!("Failsafe patch in place");
            session.enter(Phase::Code);
            match next_code_block(session, 0) {
                Some(pc) => {
                    session.pc = pc;
                    actions.push(Action::Send(CommandFrame::erase_program(pc)));
                },
                None => start_data(session, actions),
            }
            return;
        },
        _ => {},
    }

    if retry_or_fail(session, actions) {
        actions.push(Action::Send(CommandFrame::erase_program(pc)));
    }
}

fn on_code(session: &mut UpgradeSession, event: &Event, actions: &mut Vec<Action>) {
    let pc = session.pc;
    let start = usize::from(pc);
    let end = start + usize::from(CODE_BLOCK_WORDS);

    match expected_response(session, event) {
        Some(r) if r.command() == Some(Opcode::EraseProgram) => {
            let block = &session.image.program()[start..end];
            actions.push(Action::Send(CommandFrame::write_program(pc, block)));
            return;
        },
        Some(r) if r.command() == Some(Opcode::WriteProgram) => {
            actions.push(Action::Send(CommandFrame::read_program(pc, CODE_BLOCK_WORDS as u8)));
            return;
        },
        Some(r) if r.len == CODE_BLOCK_WORDS as u8 && r.address == pc => {
            let expected = session.image.program()[start..end].to_vec();
            if verify_words(session, &expected, &r) {
                match next_code_block(session, pc + CODE_BLOCK_WORDS) {
                    Some(next) => {
                        debug!("Block {pc:#06x} verified, next {next:#06x}");
                        session.pc = next;
                        actions.push(Action::Progress {
                            phase: Phase::Code,
                            pc: next,
                        });
                        actions.push(Action::Send(CommandFrame::erase_program(next)));
                    },
                    None => {
                        actions.push(Action::Progress {
                            phase: Phase::Code,
                            pc: PROGRAM_WORDS as u16,
                        });
                        start_data(session, actions);
                    },
                }
                return;
            }
        },
        _ => {},
    }

    if retry_or_fail(session, actions) {
        actions.push(Action::Send(CommandFrame::erase_program(pc)));
    }
}

fn on_data(session: &mut UpgradeSession, event: &Event, actions: &mut Vec<Action>) {
    let pc = session.pc;

    match expected_response(session, event) {
        Some(r) if r.command() == Some(Opcode::WriteData) => {
            actions.push(Action::Send(CommandFrame::read_data(pc as u8, DATA_BLOCK_BYTES as u8)));
            return;
        },
        Some(r) if r.len == DATA_BLOCK_BYTES as u8 && r.address == pc => {
            if verify_bytes(session, &r) {
                let next = pc + DATA_BLOCK_BYTES;
                actions.push(Action::Progress {
                    phase: Phase::Data,
                    pc: next,
                });
                if usize::from(next) < DATA_BYTES {
                    session.pc = next;
                    actions.push(Action::Send(data_block(session)));
                } else {
                    info!("Upgrade complete, starting application");
                    actions.push(Action::Send(CommandFrame::reset()));
                    actions.push(Action::Finish(Outcome::None));
                }
                return;
            }
        },
        _ => {},
    }

    if retry_or_fail(session, actions) {
        actions.push(Action::Send(data_block(session)));
    }
}

fn start_data(session: &mut UpgradeSession, actions: &mut Vec<Action>) {
    info!("Program memory written, writing data memory");
    session.pc = 0;
    session.enter(Phase::Data);
    actions.push(Action::Send(data_block(session)));
}

fn data_block(session: &UpgradeSession) -> CommandFrame {
    let start = usize::from(session.pc);
    let end = start + usize::from(DATA_BLOCK_BYTES);
    CommandFrame::write_data(session.pc, &session.image.data()[start..end])
}

/// First block at or after `pc` that may be programmed, or `None` past the end.
fn next_code_block(session: &UpgradeSession, mut pc: u16) -> Option<u16> {
    while usize::from(pc) < PROGRAM_WORDS {
        let protected = session
            .boundary
            .is_some_and(|b| b.overlaps(pc, CODE_BLOCK_WORDS));
        let blank = session.skip_blank_blocks
            && session
                .image
                .is_blank(usize::from(pc), usize::from(CODE_BLOCK_WORDS));
        if !protected && !blank {
            return Some(pc);
        }
        debug!(
            "Skipping {} block {pc:#06x}",
            if protected { "protected" } else { "blank" }
        );
        pc += CODE_BLOCK_WORDS;
    }
    None
}

/// Compare read-back words with `expected`, counting every mismatch.
fn verify_words(session: &mut UpgradeSession, expected: &[u16], response: &Response) -> bool {
    let actual: Vec<u16> = response.words().collect();
    if actual.len() < expected.len() {
        session.mismatches += expected.len() as u32;
        warn!("Short read-back at {:#06x}", response.address);
        return false;
    }
    let bad = expected
        .iter()
        .zip(&actual)
        .filter(|&(want, got)| *got != want & WORD_MASK)
        .count() as u32;
    if bad > 0 {
        session.mismatches += bad;
        warn!("{bad} words differ at {:#06x}", response.address);
    }
    bad == 0
}

fn verify_bytes(session: &mut UpgradeSession, response: &Response) -> bool {
    let start = usize::from(session.pc);
    let expected = &session.image.data()[start..start + usize::from(DATA_BLOCK_BYTES)];
    let Some(actual) = response.payload.get(..expected.len()) else {
        session.mismatches += expected.len() as u32;
        warn!("Short read-back at data {:#06x}", response.address);
        return false;
    };
    let bad = expected.iter().zip(actual).filter(|(a, b)| a != b).count() as u32;
    if bad > 0 {
        session.mismatches += bad;
        warn!("{bad} bytes differ at data {:#06x}", response.address);
    }
    bad == 0
}
