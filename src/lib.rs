//! Software TNC core.
//!
//! Turns a demodulated bit stream into validated AX.25 packets and back:
//! HDLC frame recovery with optional bit fix-up, the AX.25 packet object,
//! per-channel transmit queues with CSMA channel access, and the KISS and
//! AGW client protocols over TCP or a serial stream.
//!
//! The crate is deliberately blind to hardware. Demodulators push
//! candidate bit blocks into [`recv::process_candidate`]; the transmit
//! side drives any [`xmit::Modulator`] and keys any `OutputPin`. All
//! shared state lives in a [`Tnc`] value created once by the composition
//! root and borrowed by every service loop:
//!
//! ```ignore
//! static TNC: StaticCell<Tnc> = StaticCell::new();
//! let tnc = TNC.init(Tnc::new(config));
//! spawner.must_spawn(radio0(tnc, ptt, modem));   // xmit::transmit_loop
//! spawner.must_spawn(kiss(tnc, stack));          // kiss::tcp::kiss_tcp_server
//! spawner.must_spawn(agw(tnc, stack));           // agw::agw_server
//! ```

#![cfg_attr(not(test), no_std)]

// This must go first so the macros are visible to the other modules.
mod fmt;

pub mod ais;
pub mod agw;
pub mod ax25;
pub mod bits;
pub mod config;
pub mod fcs;
pub mod framesync;
pub mod hdlc;
pub mod kiss;
pub mod recv;
pub mod txq;
pub mod xmit;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::pubsub::PubSubChannel;
use embassy_time::{Duration, Instant};

use crate::config::{ChannelTiming, TncConfig, MAX_CHANS};
use crate::recv::RxEvent;
use crate::txq::TxQueue;

pub use crate::config::{ChannelConfig, FixBits, Medium, ModemType, SanityTest};

pub const SOFTWARE_NAME: &str = "AXTNC";
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;

/// Frames buffered for slow fan-out subscribers before they start
/// losing packets.
pub const RX_EVENT_DEPTH: usize = 8;
/// KISS clients + AGW clients + serial front-end + one spare.
pub const MAX_SUBSCRIBERS: usize = 8;

pub type RxEvents =
    PubSubChannel<CriticalSectionRawMutex, RxEvent, RX_EVENT_DEPTH, MAX_SUBSCRIBERS, 1>;

/// Receive-pipeline counters. The swallowed error kinds are counted here
/// rather than reported per-occurrence.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxStats {
    pub clean: u32,
    pub fixed: u32,
    pub bad_fcs: u32,
    pub sanity_failed: u32,
    pub passall: u32,
}

#[derive(Clone, Copy)]
struct DcdState {
    carrier: bool,
    last_clear: Instant,
}

/// The TNC context: configuration snapshot, transmit queue, receive
/// fan-out, carrier-detect state and counters. One per TNC; everything
/// takes a shared borrow.
pub struct Tnc {
    config: TncConfig,
    txq: TxQueue,
    timing: Mutex<CriticalSectionRawMutex, RefCell<[ChannelTiming; MAX_CHANS]>>,
    dcd: Mutex<CriticalSectionRawMutex, RefCell<[DcdState; MAX_CHANS]>>,
    events: RxEvents,
    stats: Mutex<CriticalSectionRawMutex, RefCell<RxStats>>,
}

impl Tnc {
    pub fn new(config: TncConfig) -> Self {
        let txq = TxQueue::new(&config);
        let timing = core::array::from_fn(|i| config.chans[i].timing);
        let now = Instant::now();
        Self {
            config,
            txq,
            timing: Mutex::new(RefCell::new(timing)),
            dcd: Mutex::new(RefCell::new(
                [DcdState { carrier: false, last_clear: now }; MAX_CHANS],
            )),
            events: PubSubChannel::new(),
            stats: Mutex::new(RefCell::new(RxStats::default())),
        }
    }

    pub fn config(&self) -> &TncConfig {
        &self.config
    }

    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    pub fn events(&self) -> &RxEvents {
        &self.events
    }

    /// Current channel-access timing. Starts from the configuration and
    /// may be adjusted at runtime by KISS commands.
    pub fn timing(&self, chan: u8) -> ChannelTiming {
        let idx = (chan as usize).min(MAX_CHANS - 1);
        self.timing.lock(|t| t.borrow()[idx])
    }

    pub fn update_timing(&self, chan: u8, f: impl FnOnce(&mut ChannelTiming)) {
        let idx = chan as usize;
        if idx < MAX_CHANS {
            self.timing.lock(|t| f(&mut t.borrow_mut()[idx]));
        }
    }

    /// Carrier-detect input from the demodulator.
    pub fn set_dcd(&self, chan: u8, carrier: bool) {
        let idx = chan as usize;
        if idx >= MAX_CHANS {
            return;
        }
        self.dcd.lock(|d| {
            let mut d = d.borrow_mut();
            if d[idx].carrier && !carrier {
                d[idx].last_clear = Instant::now();
            }
            d[idx].carrier = carrier;
        });
    }

    pub fn dcd(&self, chan: u8) -> bool {
        let idx = chan as usize;
        idx < MAX_CHANS && self.dcd.lock(|d| d.borrow()[idx].carrier)
    }

    /// How long the channel has been free of carrier.
    pub fn clear_for(&self, chan: u8) -> Duration {
        let idx = chan as usize;
        if idx >= MAX_CHANS {
            return Duration::from_ticks(0);
        }
        let (carrier, since) = self.dcd.lock(|d| {
            let d = d.borrow()[idx];
            (d.carrier, d.last_clear)
        });
        if carrier {
            Duration::from_ticks(0)
        } else {
            Duration::from_ticks(Instant::now().as_ticks().saturating_sub(since.as_ticks()))
        }
    }

    pub fn stats(&self) -> RxStats {
        self.stats.lock(|s| *s.borrow())
    }

    pub(crate) fn stats_update(&self, f: impl FnOnce(&mut RxStats)) {
        self.stats.lock(|s| f(&mut s.borrow_mut()));
    }
}
