//! Runtime configuration snapshot.
//!
//! The caller (CLI / config-file layer, outside this crate) fills a
//! [`TncConfig`] and hands it to [`crate::Tnc::new`]. Everything here is
//! read-mostly after startup; the per-channel timing block is the one
//! exception, KISS commands may adjust it live (see [`crate::Tnc`]).

use crate::ax25::CallLabel;

/// Radio channels the core can address. Queue storage and server tables
/// are sized from this.
pub const MAX_CHANS: usize = 4;

/// Simultaneous clients per network server.
pub const MAX_CLIENTS: usize = 3;

pub const KISS_PORT_DEFAULT: u16 = 8001;
pub const AGW_PORT_DEFAULT: u16 = 8000;

/// What is attached to a channel. All enqueue and routing decisions
/// consult this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Medium {
    /// Unconfigured; traffic for it is refused.
    None,
    /// A modem/PTT pair served by a transmit scheduler.
    Radio,
    /// Traffic is handed to the IGate collaborator.
    Igate,
    /// Traffic is handed to a network TNC collaborator.
    NetTnc,
}

/// Modulation family of the channel, as far as the bit-level decoder
/// cares: whether the stream is G3RUH-scrambled and whether AIS framing
/// rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModemType {
    /// 1200 baud AFSK and friends: plain NRZI.
    Afsk,
    /// 9600+ baud G3RUH: NRZI under an LFSR scrambler.
    Scrambled,
    /// AIS reception: FCS must match and the length table applies.
    Ais,
}

impl ModemType {
    pub fn is_scrambled(&self) -> bool {
        matches!(self, ModemType::Scrambled)
    }
}

/// How hard the HDLC decoder tries to repair a failed CRC.
/// Levels are cumulative: `Double` also tries `Single` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FixBits {
    None = 0,
    /// Invert one bit at each position in turn.
    Single = 1,
    /// Invert two adjacent bits.
    Double = 2,
    /// Invert three adjacent bits.
    Triple = 3,
    /// Invert two non-adjacent bits. Quadratic; documented as a last
    /// resort for experimentation.
    TwoSep = 4,
}

impl From<u8> for FixBits {
    fn from(value: u8) -> Self {
        match value {
            1 => FixBits::Single,
            2 => FixBits::Double,
            3 => FixBits::Triple,
            4 => FixBits::TwoSep,
            _ => FixBits::None,
        }
    }
}

/// Plausibility test applied after a CRC match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SanityTest {
    /// Full APRS shape: UI frame, PID F0, printable info.
    Aprs,
    /// Address block checks only; for connected-mode channels.
    Ax25,
    /// Accept anything with a good CRC.
    None,
}

/// Channel-access and keying times. All units of 10 ms except `persist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelTiming {
    /// Extra wait after the channel clears, before persistence begins.
    pub dwait: u8,
    /// Wait between persistence attempts.
    pub slottime: u8,
    /// Transmit probability per slot, scaled to 0..=255.
    pub persist: u8,
    /// Key-up lead-in before data.
    pub txdelay: u8,
    /// Trailing time before unkeying.
    pub txtail: u8,
    /// Skip carrier sensing entirely.
    pub fulldup: bool,
}

impl Default for ChannelTiming {
    fn default() -> Self {
        Self { dwait: 0, slottime: 10, persist: 63, txdelay: 30, txtail: 10, fulldup: false }
    }
}

/// Per-channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub medium: Medium,
    pub modem_type: ModemType,
    pub mycall: CallLabel,
    pub fix_bits: FixBits,
    pub sanity_test: SanityTest,
    /// Emit frames that fail every recovery attempt, marked
    /// [`crate::ax25::RETRY_PASSALL`]. Strongly discouraged outside
    /// experiments.
    pub passall: bool,
    pub timing: ChannelTiming,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let mut mycall = CallLabel::new();
        mycall.push_str("NOCALL").ok();
        Self {
            medium: Medium::None,
            modem_type: ModemType::Afsk,
            mycall,
            fix_bits: FixBits::None,
            sanity_test: SanityTest::Aprs,
            passall: false,
            timing: ChannelTiming::default(),
        }
    }
}

/// Whole-TNC configuration.
#[derive(Debug, Clone)]
pub struct TncConfig {
    pub chans: [ChannelConfig; MAX_CHANS],
    /// Mirror frames received from one KISS TCP client to the others on
    /// the same port.
    pub kiss_copy: bool,
}

impl Default for TncConfig {
    fn default() -> Self {
        Self { chans: core::array::from_fn(|_| ChannelConfig::default()), kiss_copy: false }
    }
}

impl TncConfig {
    /// Single radio channel 0, everything else unconfigured.
    pub fn single_radio() -> Self {
        let mut cfg = Self::default();
        cfg.chans[0].medium = Medium::Radio;
        cfg
    }

    pub fn chan(&self, chan: u8) -> Option<&ChannelConfig> {
        self.chans.get(chan as usize)
    }

    pub fn medium(&self, chan: u8) -> Medium {
        self.chan(chan).map(|c| c.medium).unwrap_or(Medium::None)
    }
}
