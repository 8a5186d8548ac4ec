//! Receive fan-out.
//!
//! Every validated frame is published once and consumed by whoever
//! subscribed: KISS clients, AGW clients, the serial front-end, or the
//! digipeater/IGate collaborators outside this crate. Publication never
//! blocks; a subscriber that cannot keep up loses old frames rather than
//! stalling the pipeline or the other clients.

use crate::ax25::{Ax25Packet, RETRY_PASSALL};
use crate::bits::BitBuf;
use crate::config::MAX_CHANS;
use crate::hdlc::{decode_candidate, Candidate, Decoded};
use crate::Tnc;
use embassy_sync::pubsub::PubSubBehavior;

/// One fan-out message.
#[derive(Clone)]
pub enum RxEvent {
    /// Frame demodulated off the air.
    Received(Ax25Packet),
    /// Frame this station just transmitted.
    Transmitted(Ax25Packet),
    /// Frame one of the KISS TCP clients asked us to transmit; mirrored
    /// to the other clients when KISSCOPY is on.
    KissClient { slot: u8, packet: Ax25Packet },
}

/// Decode one candidate bit block from a demodulator and, on success,
/// hand the packet to every enabled sink. Returns the packet so the
/// caller can feed co-resident consumers (digipeater, logging).
pub fn process_candidate(
    tnc: &Tnc,
    chan: u8,
    subchan: u8,
    slice: u8,
    audio_level: i32,
    cand: &Candidate<'_>,
) -> Option<Ax25Packet> {
    let cfg = tnc.config().chan(chan)?;
    match decode_candidate(cand, cfg) {
        Decoded::Frame(f) => {
            let mut pkt = match Ax25Packet::from_frame_bytes(&f.bytes) {
                Ok(p) => p,
                Err(_) => {
                    // Good CRC but not a representable AX.25 frame.
                    warn!("chan {} frame with invalid address block dropped", chan);
                    tnc.stats_update(|s| s.sanity_failed += 1);
                    return None;
                }
            };
            pkt.chan = chan;
            pkt.subchan = subchan;
            pkt.slice = slice;
            pkt.audio_level = audio_level;
            pkt.retries = f.retries;
            tnc.stats_update(|s| match f.retries {
                0 => s.clean += 1,
                RETRY_PASSALL => s.passall += 1,
                _ => s.fixed += 1,
            });
            deliver_received(tnc, pkt.clone());
            Some(pkt)
        }
        Decoded::BadFcs => {
            tnc.stats_update(|s| s.bad_fcs += 1);
            None
        }
        Decoded::SanityFailed => {
            tnc.stats_update(|s| s.sanity_failed += 1);
            None
        }
        // Aborts and partial octets are routine on a noisy channel.
        Decoded::Invalid => None,
    }
}

/// Convenience wrapper building the [`Candidate`] from a bit block.
pub fn process_block(
    tnc: &Tnc,
    chan: u8,
    subchan: u8,
    slice: u8,
    audio_level: i32,
    bits: &BitBuf,
) -> Option<Ax25Packet> {
    if chan as usize >= MAX_CHANS {
        return None;
    }
    let cfg = tnc.config().chan(chan)?;
    let cand = Candidate::new(bits, cfg);
    process_candidate(tnc, chan, subchan, slice, audio_level, &cand)
}

/// Publish a received frame to all subscribers.
pub fn deliver_received(tnc: &Tnc, pkt: Ax25Packet) {
    debug!("chan {} rx frame, {} bytes, retries {}", pkt.chan, pkt.len(), pkt.retries);
    tnc.events().publish_immediate(RxEvent::Received(pkt));
}

/// Publish a frame this station transmitted (AGW monitor 'T' path).
pub fn deliver_transmitted(tnc: &Tnc, pkt: Ax25Packet) {
    tnc.events().publish_immediate(RxEvent::Transmitted(pkt));
}

/// Publish a KISS-client-originated frame for mirroring.
pub fn deliver_kiss_client(tnc: &Tnc, slot: u8, pkt: Ax25Packet) {
    tnc.events().publish_immediate(RxEvent::KissClient { slot, packet: pkt });
}
