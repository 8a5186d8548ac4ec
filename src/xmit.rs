//! Transmit scheduler: one logical task per radio channel.
//!
//! Drains the transmit queue, arbitrating the half-duplex medium with
//! CSMA p-persistence: wait for the channel to stay clear, then transmit
//! with probability PERSIST/256 per SLOTTIME. Keying and timing follow
//! the classic TNC parameters, all in 10 ms units.

use embassy_time::{Instant, Timer};
use embedded_hal::digital::OutputPin;

use crate::config::ChannelTiming;
use crate::recv::deliver_transmitted;
use crate::txq::Priority;
use crate::Tnc;

/// Seam toward the HDLC encoder / modulator stack. The modulator owns
/// flag generation: it idles flags while keyed and separates consecutive
/// frames of a burst with flags on its own.
#[allow(async_fn_in_trait)]
pub trait Modulator {
    /// Hand over one frame (without FCS) for encoding and modulation.
    /// May block until the modulator can accept it.
    async fn send_frame(&mut self, frame: &[u8]);
    /// Resolve once everything handed over has actually left the
    /// transmitter.
    async fn drain(&mut self);
}

/// Small deterministic generator for the persistence dice roll.
struct XorShift32(u32);

impl XorShift32 {
    fn new(seed: u32) -> Self {
        Self(seed | 1)
    }

    fn next_byte(&mut self) -> u8 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        (x >> 24) as u8
    }
}

/// Block until the medium has been quiet for DWAIT and the persistence
/// dice allow transmission. A carrier appearing mid-wait starts the
/// sequence over.
async fn wait_for_clear_channel(tnc: &Tnc, chan: u8, t: &ChannelTiming, rng: &mut XorShift32) {
    let dwait_ms = t.dwait as u64 * 10;
    loop {
        while tnc.dcd(chan) || tnc.clear_for(chan).as_millis() < dwait_ms {
            Timer::after_millis(10).await;
        }
        if rng.next_byte() <= t.persist {
            return;
        }
        Timer::after_millis(t.slottime as u64 * 10).await;
    }
}

/// Run the channel-access loop forever. `chan` must be a RADIO-medium
/// channel; `ptt` is the key line, `modem` the modulator seam.
///
/// Within one key-up burst the HIGH queue drains before LOW, and a
/// packet once dequeued is always transmitted to completion; there is no
/// mid-frame abort.
pub async fn transmit_loop<P, M>(tnc: &Tnc, chan: u8, mut ptt: P, mut modem: M) -> !
where
    P: OutputPin,
    M: Modulator,
{
    let mut rng = XorShift32::new(
        (Instant::now().as_ticks() as u32) ^ 0x9E37_79B9u32.wrapping_mul(chan as u32 + 1),
    );
    info!("transmit scheduler up on chan {}", chan);
    loop {
        tnc.txq().wait_while_empty(chan).await;
        let t = tnc.timing(chan);
        if !t.fulldup {
            wait_for_clear_channel(tnc, chan, &t, &mut rng).await;
        }

        ptt.set_high().ok();
        Timer::after_millis(t.txdelay as u64 * 10).await;

        let mut sent = 0u32;
        loop {
            let pkt = tnc
                .txq()
                .remove(chan, Priority::High)
                .or_else(|| tnc.txq().remove(chan, Priority::Low));
            let Some(pkt) = pkt else { break };
            if pkt.is_sentinel() {
                // Seize request: the keyed carrier is the whole point;
                // real data, if any, follows in this same burst.
                continue;
            }
            modem.send_frame(pkt.frame()).await;
            sent += 1;
            deliver_transmitted(tnc, pkt);
        }
        modem.drain().await;
        Timer::after_millis(t.txtail as u64 * 10).await;
        ptt.set_low().ok();
        debug!("chan {} key-up done, {} frames", chan, sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::Ax25Packet;
    use crate::config::{Medium, TncConfig};
    use embassy_futures::select::{select, Either};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    struct MockPtt(Rc<RefCell<Vec<bool>>>);

    impl embedded_hal::digital::ErrorType for MockPtt {
        type Error = core::convert::Infallible;
    }

    impl OutputPin for MockPtt {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0.borrow_mut().push(false);
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0.borrow_mut().push(true);
            Ok(())
        }
    }

    struct MockModem(Rc<RefCell<Vec<Vec<u8>>>>);

    impl Modulator for MockModem {
        async fn send_frame(&mut self, frame: &[u8]) {
            self.0.borrow_mut().push(frame.to_vec());
        }
        async fn drain(&mut self) {}
    }

    fn fast_tnc() -> &'static Tnc {
        let mut cfg = TncConfig::default();
        cfg.chans[0].medium = Medium::Radio;
        cfg.chans[0].timing.dwait = 0;
        cfg.chans[0].timing.slottime = 1;
        cfg.chans[0].timing.persist = 255; // always transmit when clear
        cfg.chans[0].timing.txdelay = 1;
        cfg.chans[0].timing.txtail = 1;
        Box::leak(Box::new(Tnc::new(cfg)))
    }

    async fn run_burst(tnc: &'static Tnc, keyed: Rc<RefCell<Vec<bool>>>, frames: Rc<RefCell<Vec<Vec<u8>>>>) {
        let fut = transmit_loop(tnc, 0, MockPtt(keyed), MockModem(frames));
        match select(fut, Timer::after_millis(300)).await {
            Either::First(never) => match never {},
            Either::Second(()) => {}
        }
    }

    #[test]
    fn burst_drains_high_before_low() {
        let tnc = fast_tnc();
        let hi = Ax25Packet::from_text("N1ABC>APRS:first out").unwrap();
        let lo = Ax25Packet::from_text("N1ABC>APRS:second out").unwrap();
        tnc.txq().append(0, Priority::Low, lo.clone()).unwrap();
        tnc.txq().append(0, Priority::High, hi.clone()).unwrap();

        let keyed = Rc::new(RefCell::new(Vec::new()));
        let frames = Rc::new(RefCell::new(Vec::new()));
        embassy_futures::block_on(run_burst(tnc, keyed.clone(), frames.clone()));

        let frames = frames.borrow();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], hi.frame());
        assert_eq!(frames[1], lo.frame());
        // Keyed up before the frames, unkeyed after.
        let keyed = keyed.borrow();
        assert_eq!(keyed.first(), Some(&true));
        assert_eq!(keyed.last(), Some(&false));
    }

    #[test]
    fn seize_keys_up_without_data() {
        let tnc = fast_tnc();
        tnc.txq().lm_seize_request(0).unwrap();

        let keyed = Rc::new(RefCell::new(Vec::new()));
        let frames = Rc::new(RefCell::new(Vec::new()));
        embassy_futures::block_on(run_burst(tnc, keyed.clone(), frames.clone()));

        assert!(frames.borrow().is_empty());
        let keyed = keyed.borrow();
        assert!(keyed.contains(&true));
        assert_eq!(keyed.last(), Some(&false));
    }
}
