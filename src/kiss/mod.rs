//! KISS framing and command handling.
//!
//! Frames are delimited by FEND with the usual two-byte escapes. The
//! first payload octet carries the radio channel in the high nibble and
//! the command in the low nibble. Beyond data frames, the commands adjust
//! live channel-access timing, and the "Set Hardware" sub-protocol
//! answers a couple of ASCII queries.
//!
//! The receive state machine also copes with clients that are not
//! speaking KISS yet: accumulated line noise ending in CR gets a `cmd:`
//! prompt, and the literal lines `restart`/`reset` get the two-FEND
//! answer that legacy TNC applications expect when leaving text mode.

pub mod serial;
pub mod tcp;

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::ax25::{Ax25Packet, AX25_MAX_PACKET_LEN};
use crate::config::{Medium, MAX_CHANS};
use crate::recv::deliver_kiss_client;
use crate::txq::Priority;
use crate::Tnc;

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// Type byte plus a maximum AX.25 frame.
pub const MAX_KISS_FRAME: usize = AX25_MAX_PACKET_LEN + 1;
/// Worst case on the wire: everything escaped, plus both FENDs.
pub const MAX_KISS_WIRE: usize = 2 * MAX_KISS_FRAME + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KissCmd {
    Data = 0,
    TxDelay = 1,
    Persist = 2,
    SlotTime = 3,
    TxTail = 4,
    FullDuplex = 5,
    SetHardware = 6,
    /// End of KISS mode; acknowledged by ignoring it.
    Return = 15,
    Unknown = 14,
}

impl From<u8> for KissCmd {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0 => KissCmd::Data,
            1 => KissCmd::TxDelay,
            2 => KissCmd::Persist,
            3 => KissCmd::SlotTime,
            4 => KissCmd::TxTail,
            5 => KissCmd::FullDuplex,
            6 => KissCmd::SetHardware,
            15 => KissCmd::Return,
            _ => KissCmd::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KissError {
    /// FESC not followed by TFEND or TFESC.
    BadEscape,
    /// Unescaped FEND inside the body.
    MidFrameEnd,
    /// Frame larger than any legal KISS payload.
    Overflow,
}

/// Escape-encode `payload` between two FENDs.
pub fn kiss_wrap<const N: usize>(payload: &[u8], out: &mut Vec<u8, N>) -> Result<(), KissError> {
    out.clear();
    out.push(FEND).map_err(|_| KissError::Overflow)?;
    for &b in payload {
        match b {
            FEND => {
                out.push(FESC).map_err(|_| KissError::Overflow)?;
                out.push(TFEND).map_err(|_| KissError::Overflow)?;
            }
            FESC => {
                out.push(FESC).map_err(|_| KissError::Overflow)?;
                out.push(TFESC).map_err(|_| KissError::Overflow)?;
            }
            _ => out.push(b).map_err(|_| KissError::Overflow)?,
        }
    }
    out.push(FEND).map_err(|_| KissError::Overflow)?;
    Ok(())
}

/// Reverse [`kiss_wrap`]: tolerate a missing leading FEND, require the
/// body to be clean. Framing FENDs at either end are consumed.
pub fn kiss_unwrap<const N: usize>(wire: &[u8], out: &mut Vec<u8, N>) -> Result<(), KissError> {
    out.clear();
    let mut body = wire;
    if body.first() == Some(&FEND) {
        body = &body[1..];
    }
    if body.last() == Some(&FEND) {
        body = &body[..body.len() - 1];
    } else {
        // Tolerated, but worth telling the operator about.
        warn!("KISS frame without closing FEND");
    }
    let mut it = body.iter();
    while let Some(&b) = it.next() {
        let decoded = match b {
            FEND => return Err(KissError::MidFrameEnd),
            FESC => match it.next() {
                Some(&TFEND) => FEND,
                Some(&TFESC) => FESC,
                _ => return Err(KissError::BadEscape),
            },
            _ => b,
        };
        out.push(decoded).map_err(|_| KissError::Overflow)?;
    }
    Ok(())
}

/// Something the per-byte decoder wants done.
pub enum KissEvent {
    /// A complete unescaped payload (type byte first).
    Frame(Vec<u8, MAX_KISS_FRAME>),
    /// Bytes to send straight back (text-mode negotiation).
    Reply(Vec<u8, 8>),
}

#[derive(PartialEq)]
enum DecState {
    /// Waiting for an opening FEND, collecting line noise.
    Searching,
    /// Between FENDs, collecting the (still escaped) body.
    Collecting,
}

/// Per-connection receive state machine.
pub struct KissDecoder {
    state: DecState,
    body: Vec<u8, MAX_KISS_WIRE>,
    noise: Vec<u8, 120>,
}

impl Default for KissDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl KissDecoder {
    pub const fn new() -> Self {
        Self { state: DecState::Searching, body: Vec::new(), noise: Vec::new() }
    }

    /// Feed one byte; occasionally produces an event.
    pub fn rec_byte(&mut self, b: u8) -> Option<KissEvent> {
        match self.state {
            DecState::Searching => {
                if b == FEND {
                    self.state = DecState::Collecting;
                    self.body.clear();
                    return None;
                }
                if b == b'\r' {
                    let reply = if self.noise.as_slice() == b"restart" || self.noise.as_slice() == b"reset" {
                        Vec::from_slice(&[FEND, FEND]).ok()?
                    } else {
                        Vec::from_slice(b"\r\ncmd:").ok()?
                    };
                    self.noise.clear();
                    return Some(KissEvent::Reply(reply));
                }
                if b != b'\n' && self.noise.push(b).is_err() {
                    self.noise.clear();
                }
                None
            }
            DecState::Collecting => {
                if b == FEND {
                    if self.body.is_empty() {
                        // Nothing between two FENDs; also covers the
                        // shared FEND between back-to-back frames.
                        return None;
                    }
                    let mut frame: Vec<u8, MAX_KISS_FRAME> = Vec::new();
                    let res = kiss_unwrap(&self.body, &mut frame);
                    self.body.clear();
                    return match res {
                        Ok(()) => Some(KissEvent::Frame(frame)),
                        Err(_) => {
                            warn!("malformed KISS frame discarded");
                            self.state = DecState::Searching;
                            None
                        }
                    };
                }
                if self.body.push(b).is_err() {
                    warn!("over-long KISS frame discarded");
                    self.body.clear();
                    self.state = DecState::Searching;
                }
                None
            }
        }
    }
}

/// Process one decoded KISS payload from a client.
///
/// `pinned` overrides the channel nibble for ports tied to a single
/// radio. `tcp_slot` identifies a network client for KISSCOPY mirroring;
/// the serial front-end passes None. The return value, if any, is a
/// ready-to-send wire reply (Set-Hardware responses).
pub fn handle_frame(
    tnc: &Tnc,
    payload: &[u8],
    pinned: Option<u8>,
    tcp_slot: Option<u8>,
) -> Option<Vec<u8, MAX_KISS_WIRE>> {
    let &type_byte = payload.first()?;
    let chan = pinned.unwrap_or(type_byte >> 4);
    let cmd = KissCmd::from(type_byte);
    match cmd {
        KissCmd::Data => {
            if (chan as usize) >= MAX_CHANS || tnc.config().medium(chan) == Medium::None {
                warn!(
                    "KISS data for invalid channel {}; if this client is the \
                     Linux kernel AX.25 stack, disable CRC with kissparms -c 1",
                    chan
                );
                return None;
            }
            let mut pkt = match Ax25Packet::from_frame_bytes(&payload[1..]) {
                Ok(p) => p,
                Err(_) => {
                    warn!("KISS client sent an unparseable AX.25 frame, discarded");
                    return None;
                }
            };
            pkt.chan = chan;
            if let Some(slot) = tcp_slot {
                if tnc.config().kiss_copy {
                    deliver_kiss_client(tnc, slot, pkt.clone());
                }
            }
            let _ = tnc.txq().append(chan, Priority::Low, pkt);
            None
        }
        KissCmd::TxDelay => {
            let v = *payload.get(1)?;
            debug!("KISS set TXDELAY {} on chan {}", v, chan);
            tnc.update_timing(chan, |t| t.txdelay = v);
            None
        }
        KissCmd::Persist => {
            let v = *payload.get(1)?;
            tnc.update_timing(chan, |t| t.persist = v);
            None
        }
        KissCmd::SlotTime => {
            let v = *payload.get(1)?;
            tnc.update_timing(chan, |t| t.slottime = v);
            None
        }
        KissCmd::TxTail => {
            let v = *payload.get(1)?;
            tnc.update_timing(chan, |t| t.txtail = v);
            None
        }
        KissCmd::FullDuplex => {
            let v = *payload.get(1)?;
            tnc.update_timing(chan, |t| t.fulldup = v != 0);
            None
        }
        KissCmd::SetHardware => set_hardware(tnc, chan, &payload[1..]),
        KissCmd::Return => None,
        KissCmd::Unknown => {
            warn!("unsupported KISS command {} ignored", type_byte & 0x0F);
            None
        }
    }
}

/// ASCII `COMMAND:[param...]` queries, answered as another Set-Hardware
/// frame on the same channel.
fn set_hardware(tnc: &Tnc, chan: u8, data: &[u8]) -> Option<Vec<u8, MAX_KISS_WIRE>> {
    let text = core::str::from_utf8(data).ok()?;
    let (command, _param) = text.split_once(':')?;
    let mut response: String<40> = String::new();
    match command {
        "TNC" => {
            write!(&mut response, "{} {}.{}", crate::SOFTWARE_NAME, crate::VERSION_MAJOR, crate::VERSION_MINOR).ok()?;
        }
        "TXBUF" => {
            let n = tnc.txq().count(chan, None, None, None, true);
            write!(&mut response, "TXBUF:{}", n).ok()?;
        }
        _ => {
            debug!("unrecognized Set Hardware request ignored");
            return None;
        }
    }
    let mut payload: Vec<u8, MAX_KISS_FRAME> = Vec::new();
    payload.push(chan << 4 | KissCmd::SetHardware as u8).ok()?;
    payload.extend_from_slice(response.as_bytes()).ok()?;
    let mut wire: Vec<u8, MAX_KISS_WIRE> = Vec::new();
    kiss_wrap(&payload, &mut wire).ok()?;
    Some(wire)
}

/// Encode a received frame for delivery to a client: command Data with
/// the originating radio channel in the high nibble.
pub fn frame_to_wire(chan: u8, frame: &[u8]) -> Option<Vec<u8, MAX_KISS_WIRE>> {
    let mut payload: Vec<u8, MAX_KISS_FRAME> = Vec::new();
    payload.push(chan << 4).ok()?;
    payload.extend_from_slice(frame).ok()?;
    let mut wire: Vec<u8, MAX_KISS_WIRE> = Vec::new();
    kiss_wrap(&payload, &mut wire).ok()?;
    Some(wire)
}

/// Serve one KISS client over any byte stream until it hangs up or
/// fails. Client bytes run through the per-connection state machine;
/// received frames from the radio side fan out to the client; lagging
/// behind the fan-out loses frames, not the connection.
pub(crate) async fn serve_client<S>(tnc: &Tnc, io: &mut S, pinned: Option<u8>, tcp_slot: Option<u8>)
where
    S: embedded_io_async::Read + embedded_io_async::Write,
{
    use embassy_futures::select::{select, Either};
    use embassy_sync::pubsub::WaitResult;

    use crate::recv::RxEvent;

    let mut sub = match tnc.events().subscriber() {
        Ok(s) => s,
        Err(_) => {
            error!("out of fan-out subscriber slots for KISS client");
            return;
        }
    };
    let mut dec = KissDecoder::new();
    let mut chunk = [0u8; 256];
    loop {
        match select(io.read(&mut chunk), sub.next_message()).await {
            Either::First(Ok(0)) | Either::First(Err(_)) => return,
            Either::First(Ok(n)) => {
                for i in 0..n {
                    match dec.rec_byte(chunk[i]) {
                        Some(KissEvent::Frame(body)) => {
                            if let Some(reply) = handle_frame(tnc, &body, pinned, tcp_slot) {
                                if io.write_all(&reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(KissEvent::Reply(r)) => {
                            if io.write_all(&r).await.is_err() {
                                return;
                            }
                        }
                        None => {}
                    }
                }
            }
            Either::Second(WaitResult::Lagged(n)) => {
                warn!("slow KISS client lost {} frames", n);
            }
            Either::Second(WaitResult::Message(ev)) => {
                let wire = match ev {
                    RxEvent::Received(p) => match pinned {
                        Some(c) if p.chan != c => None,
                        _ => frame_to_wire(p.chan, p.frame()),
                    },
                    // Mirror frames another network client originated.
                    RxEvent::KissClient { slot, packet } => {
                        let mine = tcp_slot == Some(slot);
                        let filtered = matches!(pinned, Some(c) if packet.chan != c);
                        if tcp_slot.is_none() || mine || filtered {
                            None
                        } else {
                            frame_to_wire(packet.chan, packet.frame())
                        }
                    }
                    // Own transmissions are not echoed to KISS clients.
                    RxEvent::Transmitted(_) => None,
                };
                if let Some(wire) = wire {
                    if io.write_all(&wire).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TncConfig;

    fn tnc() -> &'static Tnc {
        let mut cfg = TncConfig::default();
        cfg.chans[0].medium = Medium::Radio;
        cfg.chans[2].medium = Medium::Radio;
        Box::leak(Box::new(Tnc::new(cfg)))
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let cases: &[&[u8]] = &[
            b"plain",
            &[FEND],
            &[FESC],
            &[FESC, TFEND, FEND, TFESC],
            &[],
            &[0x00, 0xFF, 0xC0, 0xDB, 0xDC, 0xDD],
        ];
        for &data in cases {
            let mut wire: Vec<u8, 64> = Vec::new();
            kiss_wrap(data, &mut wire).unwrap();
            assert_eq!(wire.first(), Some(&FEND));
            assert_eq!(wire.last(), Some(&FEND));
            // No unescaped FEND inside
            assert!(!wire[1..wire.len() - 1].contains(&FEND));
            let mut back: Vec<u8, 64> = Vec::new();
            kiss_unwrap(&wire, &mut back).unwrap();
            assert_eq!(&back[..], data);
        }
    }

    #[test]
    fn unwrap_wrap_round_trip() {
        let wire: &[u8] = &[FEND, 0x00, 0x41, FESC, TFEND, 0x42, FEND];
        let mut body: Vec<u8, 64> = Vec::new();
        kiss_unwrap(wire, &mut body).unwrap();
        let mut rewrapped: Vec<u8, 64> = Vec::new();
        kiss_wrap(&body, &mut rewrapped).unwrap();
        assert_eq!(&rewrapped[..], wire);
    }

    #[test]
    fn unwrap_rejects_bad_escape() {
        let mut out: Vec<u8, 64> = Vec::new();
        assert_eq!(kiss_unwrap(&[FEND, FESC, 0x41, FEND], &mut out), Err(KissError::BadEscape));
        assert_eq!(kiss_unwrap(&[FEND, FESC, FEND], &mut out), Err(KissError::BadEscape));
    }

    #[test]
    fn decoder_finds_frames_in_stream() {
        let mut dec = KissDecoder::new();
        let pkt = Ax25Packet::from_text("N1ABC>APRS:Hi").unwrap();
        let mut payload: Vec<u8, MAX_KISS_FRAME> = Vec::new();
        payload.push(0x00).unwrap();
        payload.extend_from_slice(pkt.frame()).unwrap();
        let mut wire: Vec<u8, MAX_KISS_WIRE> = Vec::new();
        kiss_wrap(&payload, &mut wire).unwrap();

        let mut frames = 0;
        // Two frames back to back, sharing no bytes.
        for &b in wire.iter().chain(wire.iter()) {
            if let Some(KissEvent::Frame(f)) = dec.rec_byte(b) {
                assert_eq!(&f[..], &payload[..]);
                frames += 1;
            }
        }
        assert_eq!(frames, 2);
    }

    #[test]
    fn decoder_text_mode_negotiation() {
        let mut dec = KissDecoder::new();
        let mut replies: std::vec::Vec<std::vec::Vec<u8>> = std::vec::Vec::new();
        for &b in b"restart\r".iter() {
            if let Some(KissEvent::Reply(r)) = dec.rec_byte(b) {
                replies.push(r.to_vec());
            }
        }
        assert_eq!(replies, vec![vec![FEND, FEND]]);

        let mut dec = KissDecoder::new();
        let mut got_prompt = false;
        for &b in b"XFLOW OFF\r".iter() {
            if let Some(KissEvent::Reply(r)) = dec.rec_byte(b) {
                assert_eq!(&r[..], b"\r\ncmd:");
                got_prompt = true;
            }
        }
        assert!(got_prompt);
    }

    #[test]
    fn empty_frame_ignored() {
        let mut dec = KissDecoder::new();
        for &b in &[FEND, FEND, FEND] {
            assert!(dec.rec_byte(b).is_none());
        }
    }

    #[test]
    fn data_frame_is_enqueued_low() {
        let t = tnc();
        let pkt = Ax25Packet::from_text("N1ABC>APRS:Hi").unwrap();
        let mut payload: Vec<u8, MAX_KISS_FRAME> = Vec::new();
        payload.push(0x00).unwrap();
        payload.extend_from_slice(pkt.frame()).unwrap();

        assert!(handle_frame(t, &payload, None, None).is_none());
        assert_eq!(t.txq().count(0, Some(Priority::Low), None, None, false), 1);
        let queued = t.txq().peek(0, Priority::Low).unwrap();
        assert_eq!(queued.info(), b"Hi");
        assert_eq!(queued.chan, 0);
    }

    #[test]
    fn pinned_port_overrides_channel_nibble() {
        let t = tnc();
        let pkt = Ax25Packet::from_text("N1ABC>APRS:pin me").unwrap();
        let mut payload: Vec<u8, MAX_KISS_FRAME> = Vec::new();
        payload.push(0x00).unwrap(); // client believes it is channel 0
        payload.extend_from_slice(pkt.frame()).unwrap();

        handle_frame(t, &payload, Some(2), None);
        assert_eq!(t.txq().count(0, None, None, None, false), 0);
        assert_eq!(t.txq().count(2, None, None, None, false), 1);
    }

    #[test]
    fn invalid_channel_discards() {
        let t = tnc();
        let pkt = Ax25Packet::from_text("N1ABC>APRS:nowhere").unwrap();
        let mut payload: Vec<u8, MAX_KISS_FRAME> = Vec::new();
        payload.push(0x30).unwrap(); // channel 3 has Medium::None
        payload.extend_from_slice(pkt.frame()).unwrap();
        assert!(handle_frame(t, &payload, None, None).is_none());
        assert_eq!(t.txq().count(3, None, None, None, false), 0);
    }

    #[test]
    fn timing_commands_update_live_parameters() {
        let t = tnc();
        handle_frame(t, &[0x01, 45], None, None);
        handle_frame(t, &[0x02, 200], None, None);
        handle_frame(t, &[0x03, 7], None, None);
        handle_frame(t, &[0x04, 9], None, None);
        handle_frame(t, &[0x05, 1], None, None);
        let timing = t.timing(0);
        assert_eq!(timing.txdelay, 45);
        assert_eq!(timing.persist, 200);
        assert_eq!(timing.slottime, 7);
        assert_eq!(timing.txtail, 9);
        assert!(timing.fulldup);
        // Return command is ignored quietly.
        assert!(handle_frame(t, &[0xFF], None, None).is_none());
    }

    #[test]
    fn set_hardware_tnc_query() {
        let t = tnc();
        let mut payload: Vec<u8, 64> = Vec::new();
        payload.push(0x06).unwrap();
        payload.extend_from_slice(b"TNC:").unwrap();
        let reply = handle_frame(t, &payload, None, None).expect("reply");
        let mut body: Vec<u8, 64> = Vec::new();
        kiss_unwrap(&reply, &mut body).unwrap();
        assert_eq!(body[0], 0x06);
        let text = core::str::from_utf8(&body[1..]).unwrap();
        assert!(text.starts_with("AXTNC "), "got {:?}", text);
    }

    #[test]
    fn set_hardware_txbuf_reports_bytes() {
        let t = tnc();
        let pkt = Ax25Packet::from_text("N1ABC>APRS:fill").unwrap();
        let len = pkt.frame().len();
        t.txq().append(0, Priority::Low, pkt).unwrap();

        let mut payload: Vec<u8, 64> = Vec::new();
        payload.push(0x06).unwrap();
        payload.extend_from_slice(b"TXBUF:").unwrap();
        let reply = handle_frame(t, &payload, None, None).expect("reply");
        let mut body: Vec<u8, 64> = Vec::new();
        kiss_unwrap(&reply, &mut body).unwrap();
        let text = core::str::from_utf8(&body[1..]).unwrap();
        let expect = std::format!("TXBUF:{}", len);
        assert_eq!(text, expect);
    }

    #[test]
    fn frame_to_wire_sets_channel_nibble() {
        let pkt = Ax25Packet::from_text("N1ABC>APRS:out").unwrap();
        let wire = frame_to_wire(2, pkt.frame()).unwrap();
        let mut body: Vec<u8, MAX_KISS_FRAME> = Vec::new();
        kiss_unwrap(&wire, &mut body).unwrap();
        assert_eq!(body[0], 0x20);
        assert_eq!(&body[1..], pkt.frame());
    }
}
