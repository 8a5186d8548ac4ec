//! Transmit queue: per-channel, two priorities, bounded.
//!
//! Client protocol servers (and the digipeater/IGate collaborators) push
//! packets in; one transmit scheduler per radio channel drains them.
//! Every enqueue first consults the medium table: traffic for an IGate or
//! network-TNC channel is handed to that collaborator instead of a radio.
//!
//! A single blocking mutex guards all the lists and is held only for the
//! splice; the per-channel wakeup is a latching `Signal`, so a wakeup
//! raced against the scheduler's emptiness check is simply re-observed at
//! the top of its loop.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use heapless::Deque;

use crate::ax25::{Ax25Packet, FrameType, AX25_MIN_PACKET_LEN, AX25_PID_NO_LAYER_3};
use crate::config::{Medium, TncConfig, MAX_CHANS};

/// Expedited traffic (digipeated frames, raw client frames with a used
/// via path). Kept shallow; it exists to jump the line, not to buffer.
pub const TXQ_HI_CAP: usize = 64;
/// Ordinary traffic.
pub const TXQ_LO_CAP: usize = 256;

/// APRS packets allowed per channel across both priorities. More than
/// this means the channel cannot drain and old positions are stale
/// anyway, so the newest is dropped.
pub const APRS_QUEUE_LIMIT: usize = 100;
/// Non-APRS traffic is not capped short of queue capacity, but a backlog
/// this deep gets a warning.
pub const NONAPRS_QUEUE_WARN: usize = 250;

/// Hand-off depth toward the IGate / network-TNC collaborators.
pub const HANDOFF_CAP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxqError {
    /// Channel index out of range or medium `None`.
    InvalidChannel,
    /// Below the AX.25 minimum; nothing that short belongs on the air.
    TooShort,
    /// Per-channel APRS limit hit; packet dropped.
    QueueFullAprs,
    /// Queue storage exhausted.
    QueueFull,
}

struct ChanQueues {
    hi: Deque<Ax25Packet, TXQ_HI_CAP>,
    lo: Deque<Ax25Packet, TXQ_LO_CAP>,
}

impl ChanQueues {
    fn is_empty(&self) -> bool {
        self.hi.is_empty() && self.lo.is_empty()
    }

    fn len(&self) -> usize {
        self.hi.len() + self.lo.len()
    }
}

type QueueCell = Mutex<CriticalSectionRawMutex, RefCell<[ChanQueues; MAX_CHANS]>>;

pub struct TxQueue {
    chans: QueueCell,
    wake: [Signal<CriticalSectionRawMutex, ()>; MAX_CHANS],
    media: [Medium; MAX_CHANS],
    igate: Channel<CriticalSectionRawMutex, Ax25Packet, HANDOFF_CAP>,
    nettnc: Channel<CriticalSectionRawMutex, Ax25Packet, HANDOFF_CAP>,
}

fn is_aprs(pkt: &Ax25Packet) -> bool {
    pkt.frame_type().frame_type == FrameType::Ui && pkt.pid() == Some(AX25_PID_NO_LAYER_3)
}

impl TxQueue {
    pub fn new(config: &TncConfig) -> Self {
        Self {
            chans: Mutex::new(RefCell::new(core::array::from_fn(|_| ChanQueues {
                hi: Deque::new(),
                lo: Deque::new(),
            }))),
            wake: core::array::from_fn(|_| Signal::new()),
            media: core::array::from_fn(|i| config.chans[i].medium),
            igate: Channel::new(),
            nettnc: Channel::new(),
        }
    }

    /// Route and enqueue a packet from a client application.
    pub fn append(&self, chan: u8, prio: Priority, pkt: Ax25Packet) -> Result<(), TxqError> {
        self.enqueue(chan, prio, pkt, true)
    }

    /// Enqueue from the connected-mode data link machine: identical to
    /// [`append`](Self::append) but exempt from the APRS limit.
    pub fn lm_data_request(&self, chan: u8, prio: Priority, pkt: Ax25Packet) -> Result<(), TxqError> {
        self.enqueue(chan, prio, pkt, false)
    }

    /// Ask the scheduler to run a transmission cycle even with nothing
    /// queued, so the data link machine gets an opening for an ack.
    pub fn lm_seize_request(&self, chan: u8) -> Result<(), TxqError> {
        if self.radio_chan(chan).is_none() {
            return Err(TxqError::InvalidChannel);
        }
        let ok = self.chans.lock(|c| {
            c.borrow_mut()[chan as usize]
                .lo
                .push_back(Ax25Packet::seize_sentinel(chan))
                .is_ok()
        });
        if !ok {
            return Err(TxqError::QueueFull);
        }
        self.wake[chan as usize].signal(());
        Ok(())
    }

    fn radio_chan(&self, chan: u8) -> Option<usize> {
        let idx = chan as usize;
        (idx < MAX_CHANS && self.media[idx] == Medium::Radio).then_some(idx)
    }

    fn enqueue(&self, chan: u8, prio: Priority, mut pkt: Ax25Packet, aprs_limit: bool) -> Result<(), TxqError> {
        let idx = chan as usize;
        match self.media.get(idx) {
            Some(Medium::Radio) => {}
            Some(Medium::Igate) => {
                if self.igate.try_send(pkt).is_err() {
                    warn!("igate hand-off full, dropping packet for chan {}", chan);
                }
                return Ok(());
            }
            Some(Medium::NetTnc) => {
                if self.nettnc.try_send(pkt).is_err() {
                    warn!("network TNC hand-off full, dropping packet for chan {}", chan);
                }
                return Ok(());
            }
            _ => {
                warn!("transmit attempted on unconfigured channel {}", chan);
                return Err(TxqError::InvalidChannel);
            }
        }
        if pkt.len() < AX25_MIN_PACKET_LEN {
            warn!("refusing to queue runt packet ({} bytes) on chan {}", pkt.len(), chan);
            return Err(TxqError::TooShort);
        }
        pkt.chan = chan;

        let aprs = is_aprs(&pkt);
        let res = self.chans.lock(|c| {
            let mut c = c.borrow_mut();
            let q = &mut c[idx];
            if aprs_limit && aprs && q.len() >= APRS_QUEUE_LIMIT {
                return Err(TxqError::QueueFullAprs);
            }
            if !aprs && q.len() >= NONAPRS_QUEUE_WARN {
                warn!("transmit backlog on chan {} is {} frames", chan, q.len());
            }
            let pushed = match prio {
                Priority::High => q.hi.push_back(pkt).is_ok(),
                Priority::Low => q.lo.push_back(pkt).is_ok(),
            };
            if pushed {
                Ok(())
            } else {
                Err(TxqError::QueueFull)
            }
        });
        match res {
            Ok(()) => {
                self.wake[idx].signal(());
                Ok(())
            }
            Err(e) => {
                warn!("dropping packet for chan {}, queue limit reached", chan);
                Err(e)
            }
        }
    }

    /// Detach and return the head of one priority list.
    pub fn remove(&self, chan: u8, prio: Priority) -> Option<Ax25Packet> {
        let idx = chan as usize;
        if idx >= MAX_CHANS {
            return None;
        }
        self.chans.lock(|c| {
            let mut c = c.borrow_mut();
            match prio {
                Priority::High => c[idx].hi.pop_front(),
                Priority::Low => c[idx].lo.pop_front(),
            }
        })
    }

    /// Copy of the head without removing it.
    pub fn peek(&self, chan: u8, prio: Priority) -> Option<Ax25Packet> {
        let idx = chan as usize;
        if idx >= MAX_CHANS {
            return None;
        }
        self.chans.lock(|c| {
            let c = c.borrow();
            match prio {
                Priority::High => c[idx].hi.front().cloned(),
                Priority::Low => c[idx].lo.front().cloned(),
            }
        })
    }

    /// Park until either priority for the channel has something.
    pub async fn wait_while_empty(&self, chan: u8) {
        let idx = chan as usize;
        if idx >= MAX_CHANS {
            return;
        }
        loop {
            let occupied = self.chans.lock(|c| !c.borrow()[idx].is_empty());
            if occupied {
                return;
            }
            self.wake[idx].wait().await;
        }
    }

    /// Count queued traffic. `prio` None means both priorities; optional
    /// source/destination filters compare against `CALL-SSID`; `as_bytes`
    /// sums frame lengths instead of packets.
    pub fn count(
        &self,
        chan: u8,
        prio: Option<Priority>,
        src: Option<&str>,
        dst: Option<&str>,
        as_bytes: bool,
    ) -> usize {
        let idx = chan as usize;
        if idx >= MAX_CHANS {
            return 0;
        }
        let matches = |p: &Ax25Packet| -> usize {
            if p.is_sentinel() {
                return 0;
            }
            if let Some(want) = src {
                match p.addr_with_ssid(crate::ax25::AX25_SOURCE) {
                    Some(a) if a.as_str() == want => {}
                    _ => return 0,
                }
            }
            if let Some(want) = dst {
                match p.addr_with_ssid(crate::ax25::AX25_DESTINATION) {
                    Some(a) if a.as_str() == want => {}
                    _ => return 0,
                }
            }
            if as_bytes {
                p.len()
            } else {
                1
            }
        };
        self.chans.lock(|c| {
            let c = c.borrow();
            let q = &c[idx];
            let hi: usize = q.hi.iter().map(&matches).sum();
            let lo: usize = q.lo.iter().map(&matches).sum();
            match prio {
                Some(Priority::High) => hi,
                Some(Priority::Low) => lo,
                None => hi + lo,
            }
        })
    }

    /// Frames waiting to reach the APRS-IS bridge.
    pub fn igate_handoff(&self) -> &Channel<CriticalSectionRawMutex, Ax25Packet, HANDOFF_CAP> {
        &self.igate
    }

    /// Frames waiting to reach the network TNC.
    pub fn nettnc_handoff(&self) -> &Channel<CriticalSectionRawMutex, Ax25Packet, HANDOFF_CAP> {
        &self.nettnc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> &'static TxQueue {
        let mut cfg = TncConfig::default();
        cfg.chans[0].medium = Medium::Radio;
        cfg.chans[1].medium = Medium::Igate;
        cfg.chans[2].medium = Medium::NetTnc;
        Box::leak(Box::new(TxQueue::new(&cfg)))
    }

    fn aprs(n: usize) -> Ax25Packet {
        let mut text = std::string::String::from("N1ABC>APRS:>msg ");
        text.push_str(&n.to_string());
        Ax25Packet::from_text(&text).unwrap()
    }

    #[test]
    fn fifo_within_priority() {
        let q = queue();
        for n in 0..5 {
            q.append(0, Priority::Low, aprs(n)).unwrap();
        }
        for n in 0..5 {
            let p = q.remove(0, Priority::Low).unwrap();
            assert_eq!(p.info(), aprs(n).info(), "out of order at {}", n);
        }
        assert!(q.remove(0, Priority::Low).is_none());
    }

    #[test]
    fn high_priority_is_seen_first() {
        let q = queue();
        q.append(0, Priority::Low, aprs(1)).unwrap();
        q.append(0, Priority::High, aprs(2)).unwrap();
        // The scheduler always drains High first; peek agrees.
        let head = q.peek(0, Priority::High).unwrap();
        assert_eq!(head.info(), aprs(2).info());
        assert_eq!(q.remove(0, Priority::High).unwrap().info(), aprs(2).info());
        assert_eq!(q.remove(0, Priority::Low).unwrap().info(), aprs(1).info());
    }

    #[test]
    fn aprs_cap_drops_the_101st() {
        let q = queue();
        for n in 0..APRS_QUEUE_LIMIT {
            q.append(0, Priority::Low, aprs(n)).unwrap();
        }
        assert_eq!(q.append(0, Priority::Low, aprs(999)), Err(TxqError::QueueFullAprs));
        assert_eq!(q.count(0, Some(Priority::Low), None, None, false), APRS_QUEUE_LIMIT);
        // The connected-mode path is exempt.
        q.lm_data_request(0, Priority::Low, aprs(1000)).unwrap();
        assert_eq!(q.count(0, None, None, None, false), APRS_QUEUE_LIMIT + 1);
    }

    #[test]
    fn count_filters_and_bytes() {
        let q = queue();
        let a = Ax25Packet::from_text("N1ABC-7>APRS:one").unwrap();
        let b = Ax25Packet::from_text("W2DEF>APRS:two!").unwrap();
        let alen = a.len();
        let blen = b.len();
        q.append(0, Priority::Low, a).unwrap();
        q.append(0, Priority::High, b).unwrap();
        assert_eq!(q.count(0, None, None, None, false), 2);
        assert_eq!(q.count(0, None, None, None, true), alen + blen);
        assert_eq!(q.count(0, None, Some("N1ABC-7"), None, false), 1);
        assert_eq!(q.count(0, None, Some("NOBODY"), None, false), 0);
        assert_eq!(q.count(0, Some(Priority::High), None, Some("APRS"), false), 1);
    }

    #[test]
    fn media_routing() {
        let q = queue();
        // IGate channel: packet goes to the hand-off, not the radio queue.
        q.append(1, Priority::Low, aprs(1)).unwrap();
        assert_eq!(q.count(1, None, None, None, false), 0);
        assert!(q.igate_handoff().try_receive().is_ok());
        // Network TNC channel.
        q.append(2, Priority::Low, aprs(2)).unwrap();
        assert!(q.nettnc_handoff().try_receive().is_ok());
        // Unconfigured channel refused.
        assert_eq!(q.append(3, Priority::Low, aprs(3)), Err(TxqError::InvalidChannel));
        assert_eq!(q.append(9, Priority::Low, aprs(4)), Err(TxqError::InvalidChannel));
    }

    #[test]
    fn runt_refused() {
        let q = queue();
        let full = aprs(0);
        let minimal = Ax25Packet::from_frame_bytes(&full.frame()[..AX25_MIN_PACKET_LEN]).unwrap();
        assert!(q.append(0, Priority::Low, minimal).is_ok()); // exactly minimum is fine
        let s = Ax25Packet::seize_sentinel(0);
        assert_eq!(q.append(0, Priority::Low, s), Err(TxqError::TooShort));
    }

    #[test]
    fn seize_sentinel_wakes_without_counting() {
        let q = queue();
        q.lm_seize_request(0).unwrap();
        assert_eq!(q.count(0, None, None, None, false), 0);
        let p = q.remove(0, Priority::Low).unwrap();
        assert!(p.is_sentinel());
        assert_eq!(q.lm_seize_request(3), Err(TxqError::InvalidChannel));
    }

    #[test]
    fn wait_while_empty_returns_when_filled() {
        let q = queue();
        q.append(0, Priority::Low, aprs(7)).unwrap();
        embassy_futures::block_on(q.wait_while_empty(0));
    }
}
