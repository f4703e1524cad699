//! Firmware upgrade engine.
//!
//! The [`Engine`] is purely reactive. It never blocks and never reads the
//! clock itself; the embedding code hands it received bytes with
//! [`Engine::feed`] and the current time with [`Engine::tick`]. Outgoing
//! traffic goes through a [`Transport`], and the result of every session is
//! reported exactly once to an [`Indicator`].
//!
//! ```rust,no_run
//! use otgwflash::engine::{Engine, Indicator, Outcome, Transport, UpgradeConfig};
//! use otgwflash::{FileStore, Result};
//! use std::time::Instant;
//!
//! struct Led;
//!
//! impl Indicator for Led {
//!     fn finished(&mut self, outcome: Outcome) {
//!         println!("upgrade finished: {outcome}");
//!     }
//! }
//!
//! fn drive<T: Transport>(transport: T, incoming: &[u8]) -> Result<()> {
//!     let mut engine = Engine::new(transport, Led, UpgradeConfig::default());
//!     engine.start(&FileStore::new("gateway.hex"), Instant::now())?;
//!     for &byte in incoming {
//!         engine.feed(byte, Instant::now());
//!     }
//!     engine.tick(Instant::now());
//!     Ok(())
//! }
//! ```

pub mod machine;
pub mod session;
pub mod watchdog;

use crate::error::{Error, Result};
use crate::image::hex::{self, ImageStore, LoadError, MemoryImage};
use crate::protocol::frame::{FrameDecoder, STX};
use log::{debug, info, trace, warn};
use machine::{Action, Event};
use session::{Phase, ProtectionBoundary, UpgradeSession};
use std::time::{Duration, Instant};
use watchdog::Watchdog;

/// Final result of an upgrade session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Outcome {
    /// The target was upgraded and restarted.
    None,
    /// The image could not be read or parsed.
    ReadFile,
    /// The image is not meant for this bootloader.
    Magic,
    /// The session was aborted from outside.
    Reset,
    /// A phase ran out of retries.
    Retries,
    /// Reserved; verify mismatches are only counted.
    Mismatches,
}

impl Outcome {
    /// Whether the upgrade completed.
    pub fn is_success(self) -> bool {
        self == Self::None
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::None => "success",
            Self::ReadFile => "could not read firmware image",
            Self::Magic => "image is not compatible with the bootloader",
            Self::Reset => "aborted",
            Self::Retries => "too many retries",
            Self::Mismatches => "too many verify mismatches",
        };
        f.write_str(text)
    }
}

/// Outgoing side of the serial link.
pub trait Transport {
    /// Write one complete frame (or the single-byte resync nudge).
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Hold the target in reset for `width`, then release it.
    fn pulse_reset(&mut self, width: Duration) -> Result<()>;
}

/// Receives progress and the final result of each session.
pub trait Indicator {
    /// A block was verified. `pc` is the next address to be written.
    fn progress(&mut self, _phase: Phase, _pc: u16) {}

    /// The session ended.
    fn finished(&mut self, outcome: Outcome);
}

impl<I: Indicator + ?Sized> Indicator for &mut I {
    fn progress(&mut self, phase: Phase, pc: u16) {
        (**self).progress(phase, pc);
    }

    fn finished(&mut self, outcome: Outcome) {
        (**self).finished(outcome);
    }
}

/// Timing and behaviour knobs of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// Time allowed for each command/response round trip.
    pub response_timeout: Duration,
    /// How long the reset line is held.
    pub reset_pulse: Duration,
    /// Leave fully erased program blocks alone.
    pub skip_blank_blocks: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            reset_pulse: Duration::from_millis(100),
            skip_blank_blocks: false,
        }
    }
}

/// Upgrade engine: one optional session plus its decoder and watchdog.
pub struct Engine<T, I> {
    transport: T,
    indicator: I,
    config: UpgradeConfig,
    decoder: FrameDecoder,
    watchdog: Watchdog,
    session: Option<UpgradeSession>,
    last_outcome: Option<Outcome>,
    last_mismatches: u32,
}

impl<T: Transport, I: Indicator> Engine<T, I> {
    /// Create an idle engine.
    pub fn new(transport: T, indicator: I, config: UpgradeConfig) -> Self {
        let watchdog = Watchdog::new(config.response_timeout);
        Self {
            transport,
            indicator,
            config,
            decoder: FrameDecoder::new(),
            watchdog,
            session: None,
            last_outcome: None,
            last_mismatches: 0,
        }
    }

    /// Load an image from `store` and start upgrading the target.
    ///
    /// Returns [`Error::Busy`] while another session is running. A load
    /// failure is reported as [`Outcome::ReadFile`] and also returned.
    pub fn start<S>(&mut self, store: &S, now: Instant) -> Result<()>
    where
        S: ImageStore + ?Sized,
    {
        if self.session.is_some() {
            return Err(Error::Busy);
        }

        let loaded = store
            .open_lines()
            .map_err(LoadError::from)
            .and_then(hex::load);
        match loaded {
            Ok(image) => self.start_with_image(image, now),
            Err(e) => {
                warn!("Failed to load firmware image: {e}");
                self.finish(Outcome::ReadFile);
                Err(e.into())
            },
        }
    }

    /// Start upgrading the target with an already loaded image.
    ///
    /// Images failing the magic check end the session with
    /// [`Outcome::Magic`] before anything is sent.
    pub fn start_with_image(&mut self, image: MemoryImage, now: Instant) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::Busy);
        }
        if !image.has_magic() {
            warn!(
                "Image does not start with the bootloader signature ({:#06x} {:#06x})",
                image.program()[0],
                image.program()[1]
            );
            self.finish(Outcome::Magic);
            return Ok(());
        }

        info!("Starting firmware upgrade");
        self.decoder.reset();
        self.last_outcome = None;
        self.last_mismatches = 0;

        let mut session = UpgradeSession::new(image, self.config.skip_blank_blocks);
        let actions = machine::begin(&mut session);
        self.session = Some(session);
        self.apply(actions, now);
        Ok(())
    }

    /// Feed one byte received from the target.
    pub fn feed(&mut self, byte: u8, now: Instant) {
        if self.session.is_none() {
            return;
        }
        if let Some(frame) = self.decoder.push(byte) {
            trace!("<- {frame:02X?}");
            self.dispatch(Event::Frame(frame), now);
        }
    }

    /// Feed a run of received bytes.
    pub fn feed_bytes(&mut self, bytes: &[u8], now: Instant) {
        for &byte in bytes {
            self.feed(byte, now);
        }
    }

    /// Let the watchdog observe the current time.
    ///
    /// On expiry a lone start marker is sent, so a target waiting for the
    /// byte after an escape resynchronises, and the session retries.
    pub fn tick(&mut self, now: Instant) {
        if self.session.is_none() || !self.watchdog.expired(now) {
            return;
        }
        if let Err(e) = self.transport.send(&[STX]) {
            warn!("Failed to send resync byte: {e}");
        }
        self.decoder.reset();
        self.dispatch(Event::Timeout, now);
    }

    /// Abort the running session with `outcome`.
    ///
    /// Returns `false` if no session was running.
    pub fn stop(&mut self, outcome: Outcome) -> bool {
        if self.session.is_none() {
            return false;
        }
        self.finish(outcome);
        true
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.session.as_ref().map_or(Phase::Idle, |s| s.phase)
    }

    /// Whether no session is running.
    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }

    /// Current program/data address.
    pub fn pc(&self) -> Option<u16> {
        self.session.as_ref().map(|s| s.pc)
    }

    /// Retries spent in the current phase.
    pub fn retries(&self) -> u16 {
        self.session.as_ref().map_or(0, |s| s.retries)
    }

    /// Verify mismatches of the running, or else the last, session.
    pub fn mismatches(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.last_mismatches, |s| s.mismatches)
    }

    /// Protected range reported by the target.
    pub fn boundary(&self) -> Option<ProtectionBoundary> {
        self.session.as_ref().and_then(|s| s.boundary)
    }

    /// When the pending round trip times out.
    pub fn deadline(&self) -> Option<Instant> {
        self.watchdog.deadline()
    }

    /// Result of the last finished session.
    pub fn last_outcome(&self) -> Option<Outcome> {
        self.last_outcome
    }

    /// Engine configuration.
    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Get the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the transport mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Get the indicator.
    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    /// Consume the engine, returning its transport and indicator.
    pub fn into_parts(self) -> (T, I) {
        (self.transport, self.indicator)
    }

    fn dispatch(&mut self, event: Event, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let actions = machine::step(session, event);
        self.apply(actions, now);
    }

    fn apply(&mut self, actions: Vec<Action>, now: Instant) {
        // Nothing sent, so the outstanding deadline still applies.
        if actions.is_empty() {
            return;
        }
        for action in actions {
            match action {
                Action::PulseReset => {
                    debug!("Pulsing reset for {:?}", self.config.reset_pulse);
                    self.decoder.reset();
                    if let Err(e) = self.transport.pulse_reset(self.config.reset_pulse) {
                        warn!("Failed to reset target: {e}");
                    }
                },
                Action::Send(cmd) => {
                    trace!("-> {} {:02X?}", cmd.opcode(), cmd.payload());
                    if let Err(e) = self.transport.send(&cmd.build()) {
                        warn!("Failed to send {}: {e}", cmd.opcode());
                    }
                },
                Action::Progress { phase, pc } => self.indicator.progress(phase, pc),
                Action::Finish(outcome) => {
                    self.finish(outcome);
                    return;
                },
            }
        }
        self.watchdog.arm(now);
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(session) = self.session.take() {
            self.last_mismatches = session.mismatches;
            info!(
                "Upgrade finished in {} phase: {outcome} ({} mismatches)",
                session.phase, session.mismatches
            );
        } else {
            info!("Upgrade not started: {outcome}");
        }
        self.watchdog.cancel();
        self.decoder.reset();
        self.last_outcome = Some(outcome);
        self.indicator.finished(outcome);
    }
}

impl<T, I> std::fmt::Debug for Engine<T, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("phase", &self.session.as_ref().map(|s| s.phase))
            .field("deadline", &self.watchdog.deadline())
            .field("last_outcome", &self.last_outcome)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::hex::{MAGIC_WORD, PROGRAM_WORDS, WORD_MASK};
    use crate::protocol::frame::{self, DLE, ETX};
    use super::session::CODE_BLOCK_WORDS;
    use std::collections::{HashSet, VecDeque};

    /// Bootloader stand-in answering the engine's commands.
    struct SimTarget {
        decoder: FrameDecoder,
        boundary: (u16, u16),
        responsive: bool,
        program: Vec<u16>,
        data: Vec<u8>,
        replies: VecDeque<u8>,
        commands: Vec<Vec<u8>>,
        pulses: usize,
        nudges: usize,
        sent_replies: usize,
        corrupt: HashSet<usize>,
        drop: HashSet<usize>,
        late: HashSet<usize>,
        held: Vec<u8>,
        flaky_write: Option<u16>,
    }

    impl SimTarget {
        fn new(low: u16, high: u16) -> Self {
            Self {
                decoder: FrameDecoder::new(),
                boundary: (low, high),
                responsive: true,
                program: vec![WORD_MASK; PROGRAM_WORDS],
                data: vec![0xFF; 256],
                replies: VecDeque::new(),
                commands: Vec::new(),
                pulses: 0,
                nudges: 0,
                sent_replies: 0,
                corrupt: HashSet::new(),
                drop: HashSet::new(),
                late: HashSet::new(),
                held: Vec::new(),
                flaky_write: None,
            }
        }

        fn silent() -> Self {
            Self {
                responsive: false,
                ..Self::new(0xF00, 0xFFF)
            }
        }

        fn reply(&mut self, payload: Vec<u8>) {
            let idx = self.sent_replies;
            self.sent_replies += 1;
            if self.drop.contains(&idx) {
                return;
            }
            if self.late.contains(&idx) {
                // Delivered just before the answer to the next command.
                self.held = frame::encode(&payload);
                return;
            }
            let bytes = if self.corrupt.contains(&idx) {
                // Damage the opcode after the checksum has been computed.
                let sum = frame::checksum(&payload);
                let mut damaged = payload;
                damaged[0] ^= 0x80;
                damaged.push(sum);
                let mut out = vec![STX];
                for b in damaged {
                    if frame::is_marker(b) {
                        out.push(DLE);
                    }
                    out.push(b);
                }
                out.push(ETX);
                out
            } else {
                frame::encode(&payload)
            };
            self.replies.extend(bytes);
        }

        fn handle(&mut self, cmd: Vec<u8>) {
            self.commands.push(cmd.clone());
            if !self.responsive {
                return;
            }
            let held = std::mem::take(&mut self.held);
            self.replies.extend(held);
            let byte = |i: usize| cmd.get(i).copied().unwrap_or(0);
            let addr = u16::from_le_bytes([byte(2), byte(3)]);
            let start = usize::from(addr);
            let mut reply = cmd[..4.min(cmd.len())].to_vec();
            match cmd[0] {
                0 => {
                    reply = vec![0, 3, 0, 0];
                    reply.extend(self.boundary.0.to_le_bytes());
                    reply.extend(self.boundary.1.to_le_bytes());
                },
                1 => {
                    for i in 0..usize::from(cmd[1]) {
                        reply.extend(self.program[start + i].to_le_bytes());
                    }
                },
                2 => {
                    for (i, w) in cmd[4..].chunks_exact(2).enumerate() {
                        self.program[start + i] = u16::from_le_bytes([w[0], w[1]]) & WORD_MASK;
                    }
                    if self.flaky_write.take_if(|pc| *pc == addr).is_some() {
                        self.program[start] ^= 1;
                    }
                },
                3 => {
                    let block = start..start + usize::from(CODE_BLOCK_WORDS);
                    self.program[block].fill(WORD_MASK);
                },
                4 => reply.extend_from_slice(&self.data[start..start + 64]),
                5 => self.data[start..start + 64].copy_from_slice(&cmd[4..68]),
                _ => return,
            }
            self.reply(reply);
        }

        fn count(&self, opcode: u8) -> usize {
            self.commands.iter().filter(|c| c[0] == opcode).count()
        }
    }

    impl Transport for SimTarget {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            if bytes == [STX] {
                self.nudges += 1;
            }
            for &b in bytes {
                if let Some(cmd) = self.decoder.push(b) {
                    self.handle(cmd);
                }
            }
            Ok(())
        }

        fn pulse_reset(&mut self, _width: Duration) -> Result<()> {
            self.pulses += 1;
            self.replies.clear();
            if self.responsive {
                self.reply(Vec::new());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        finished: Vec<Outcome>,
        progress: Vec<(Phase, u16)>,
    }

    impl Indicator for Recorder {
        fn progress(&mut self, phase: Phase, pc: u16) {
            self.progress.push((phase, pc));
        }

        fn finished(&mut self, outcome: Outcome) {
            self.finished.push(outcome);
        }
    }

    fn test_image() -> MemoryImage {
        let mut image = MemoryImage::new();
        for (i, w) in image.program_mut().iter_mut().enumerate() {
            *w = (i as u16).wrapping_mul(7) & WORD_MASK;
        }
        image.program_mut()[0] = MAGIC_WORD;
        image.program_mut()[1] = 0x2612;
        for (i, b) in image.data_mut().iter_mut().enumerate() {
            *b = i as u8;
        }
        image
    }

    fn engine(target: SimTarget) -> Engine<SimTarget, Recorder> {
        Engine::new(target, Recorder::default(), UpgradeConfig::default())
    }

    /// Pump replies into the engine, letting time pass when the line is quiet.
    fn run(engine: &mut Engine<SimTarget, Recorder>, mut now: Instant) -> Outcome {
        for _ in 0..10_000 {
            if engine.is_idle() {
                break;
            }
            let bytes: Vec<u8> = engine.transport_mut().replies.drain(..).collect();
            if bytes.is_empty() {
                now += Duration::from_millis(1001);
                engine.tick(now);
            } else {
                engine.feed_bytes(&bytes, now);
            }
        }
        assert!(engine.is_idle(), "session did not terminate");
        engine.last_outcome().unwrap()
    }

    #[test]
    fn test_upgrade_completes() {
        let now = Instant::now();
        let image = test_image();
        let mut engine = engine(SimTarget::new(0xF00, 0xFFF));
        engine.start_with_image(image.clone(), now).unwrap();
        assert_eq!(run(&mut engine, now), Outcome::None);

        let target = engine.transport();
        // 128 blocks minus the eight protected ones, plus the failsafe block.
        assert_eq!(target.count(3), 120 + 1);
        assert_eq!(target.count(2), 120 + 1);
        assert_eq!(target.count(1), 120 + 1);
        assert_eq!(target.count(5), 4);
        assert_eq!(target.count(4), 4);
        assert_eq!(target.commands.last().unwrap(), &vec![8, 0]);
        assert_eq!(target.pulses, 1);
        assert_eq!(target.nudges, 0);

        for i in 0..0xF00 {
            assert_eq!(target.program[i], image.program()[i] & WORD_MASK);
        }
        assert_eq!(target.data, image.data());
        assert_eq!(engine.indicator().finished, vec![Outcome::None]);
        assert_eq!(
            engine.indicator().progress.last(),
            Some(&(Phase::Data, 0x100))
        );
        assert_eq!(engine.mismatches(), 0);
        assert_eq!(engine.deadline(), None);
    }

    #[test]
    fn test_silent_target_exhausts_reset_retries() {
        let now = Instant::now();
        let mut engine = engine(SimTarget::silent());
        engine.start_with_image(test_image(), now).unwrap();
        assert_eq!(engine.phase(), Phase::Reset);
        assert!(engine.deadline().is_some());

        assert_eq!(run(&mut engine, now), Outcome::Retries);
        let target = engine.transport();
        assert_eq!(target.pulses, 6);
        assert_eq!(target.nudges, 6);
        assert!(target.commands.is_empty());
        assert_eq!(engine.indicator().finished, vec![Outcome::Retries]);
    }

    #[test]
    fn test_protected_blocks_never_touched() {
        let boundaries = [
            (0x0040, 0x005F),
            (0x0123, 0x0456),
            (0x0700, 0x07FF),
            (0x0800, 0x0FFF),
            (0x0F10, 0x0F4F),
            (0x0FFF, 0x0FFF),
        ];
        for (low, high) in boundaries {
            let now = Instant::now();
            let mut engine = engine(SimTarget::new(low, high));
            engine.start_with_image(test_image(), now).unwrap();
            assert_eq!(run(&mut engine, now), Outcome::None, "{low:#x}..{high:#x}");

            let boundary = ProtectionBoundary::new(low, high).unwrap();
            let expected = (0..PROGRAM_WORDS as u16)
                .step_by(usize::from(CODE_BLOCK_WORDS))
                .filter(|&pc| !boundary.overlaps(pc, CODE_BLOCK_WORDS))
                .count();

            let target = engine.transport();
            assert_eq!(target.count(3), expected + 1);
            for cmd in target.commands.iter().filter(|c| c[0] == 2 || c[0] == 3) {
                let addr = u16::from_le_bytes([cmd[2], cmd[3]]);
                assert!(
                    !boundary.overlaps(addr, CODE_BLOCK_WORDS),
                    "block {addr:#x} overlaps {low:#x}..{high:#x}"
                );
            }
        }
    }

    #[test]
    fn test_magic_gate_sends_nothing() {
        let mut image = test_image();
        image.program_mut()[0] = 0x3FFF;
        let mut engine = engine(SimTarget::new(0xF00, 0xFFF));
        engine.start_with_image(image, Instant::now()).unwrap();

        assert!(engine.is_idle());
        assert_eq!(engine.last_outcome(), Some(Outcome::Magic));
        assert_eq!(engine.indicator().finished, vec![Outcome::Magic]);
        assert_eq!(engine.transport().pulses, 0);
        assert!(engine.transport().commands.is_empty());
    }

    #[test]
    fn test_unreadable_image_reports_read_file() {
        let mut engine = engine(SimTarget::new(0xF00, 0xFFF));
        let result = engine.start(":0200000000", Instant::now());
        assert!(matches!(result, Err(Error::Load(_))));
        assert_eq!(engine.indicator().finished, vec![Outcome::ReadFile]);
        assert_eq!(engine.transport().pulses, 0);
    }

    #[test]
    fn test_start_from_store() {
        let mut engine = engine(SimTarget::new(0xF00, 0xFFF));
        let text = test_image().to_hex();
        let now = Instant::now();
        engine.start(text.as_str(), now).unwrap();
        assert_eq!(run(&mut engine, now), Outcome::None);
    }

    #[test]
    fn test_second_start_is_busy() {
        let now = Instant::now();
        let mut engine = engine(SimTarget::new(0xF00, 0xFFF));
        engine.start_with_image(test_image(), now).unwrap();
        assert!(matches!(
            engine.start_with_image(test_image(), now),
            Err(Error::Busy)
        ));
        assert_eq!(engine.phase(), Phase::Reset);
        assert_eq!(run(&mut engine, now), Outcome::None);
        assert_eq!(engine.indicator().finished.len(), 1);
    }

    #[test]
    fn test_recovers_from_damaged_and_lost_replies() {
        let now = Instant::now();
        let mut target = SimTarget::new(0xF00, 0xFFF);
        target.corrupt.extend([1, 5, 40, 200, 370]);
        target.drop.extend([3, 99, 365]);
        let mut engine = engine(target);
        engine.start_with_image(test_image(), now).unwrap();

        assert_eq!(run(&mut engine, now), Outcome::None);
        assert_eq!(engine.transport().nudges, 8);
        assert_eq!(engine.mismatches(), 0);
    }

    #[test]
    fn test_verify_mismatch_is_counted_and_retried() {
        let now = Instant::now();
        let mut target = SimTarget::new(0xF00, 0xFFF);
        target.flaky_write = Some(0x40);
        let mut engine = engine(target);
        engine.start_with_image(test_image(), now).unwrap();

        assert_eq!(run(&mut engine, now), Outcome::None);
        assert_eq!(engine.mismatches(), 1);
        // The failing block is erased, written and read twice.
        assert_eq!(engine.transport().count(3), 122);
        assert_eq!(engine.transport().nudges, 0);
    }

    #[test]
    fn test_late_ack_does_not_cascade() {
        let now = Instant::now();
        let mut target = SimTarget::new(0xF00, 0xFFF);
        // Write acknowledgement for block 0x40, held past one watchdog expiry.
        target.late.insert(12);
        let mut engine = engine(target);
        engine.start_with_image(test_image(), now).unwrap();

        assert_eq!(run(&mut engine, now), Outcome::None);
        let target = engine.transport();
        assert_eq!(target.nudges, 1);
        // Block 0x40 is erased and written once more, then read once.
        assert_eq!(target.count(3), 122);
        assert_eq!(target.count(2), 122);
        assert_eq!(target.count(1), 121);
        assert_eq!(engine.mismatches(), 0);
    }

    #[test]
    fn test_stale_frame_keeps_deadline() {
        let now = Instant::now();
        let mut engine = engine(SimTarget::new(0xF00, 0xFFF));
        engine.start_with_image(test_image(), now).unwrap();
        let hello: Vec<u8> = engine.transport_mut().replies.drain(..).collect();
        engine.feed_bytes(&hello, now);
        assert_eq!(engine.phase(), Phase::Version);
        let deadline = engine.deadline();

        // An erase acknowledgement while the version query is outstanding.
        let later = now + Duration::from_millis(600);
        engine.feed_bytes(&frame::encode(&[3, 1, 0x20, 0x00]), later);
        assert_eq!(engine.deadline(), deadline);
        assert_eq!(engine.phase(), Phase::Version);
        assert_eq!(engine.retries(), 0);

        engine.tick(later + Duration::from_millis(500));
        assert_eq!(engine.transport().nudges, 1);
        assert_eq!(engine.retries(), 1);
    }

    #[test]
    fn test_stop_reports_once() {
        let now = Instant::now();
        let mut engine = engine(SimTarget::new(0xF00, 0xFFF));
        assert!(!engine.stop(Outcome::Reset));
        engine.start_with_image(test_image(), now).unwrap();
        assert!(engine.stop(Outcome::Reset));
        assert!(!engine.stop(Outcome::Reset));
        assert!(engine.is_idle());
        assert_eq!(engine.deadline(), None);
        assert_eq!(engine.indicator().finished, vec![Outcome::Reset]);

        // Bytes arriving after the stop are ignored.
        let replies: Vec<u8> = engine.transport_mut().replies.drain(..).collect();
        engine.feed_bytes(&replies, now);
        assert!(engine.transport().commands.is_empty());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::None.to_string(), "success");
        assert_eq!(Outcome::Retries.to_string(), "too many retries");
        assert!(Outcome::None.is_success());
        assert!(!Outcome::Magic.is_success());
    }
}
