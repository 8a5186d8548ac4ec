//! AGW Packet Engine protocol server.
//!
//! Binary protocol: a fixed 36-octet little-endian header, then
//! `data_len` octets of payload whose meaning depends on the datakind
//! character. Clients toggle themselves onto the raw ('k') and monitor
//! ('m') streams; transmit requests feed the transmit queue.
//!
//! The connect-family datakinds belong to the AX.25 connected-mode
//! engine, which lives outside this crate; they are acknowledged here
//! only far enough to keep clients from wedging.

pub mod monitor;

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::ax25::{Ax25Packet, FrameType, AX25_DESTINATION, AX25_MAX_REPEATERS, AX25_PID_NO_LAYER_3, AX25_REPEATER_1, AX25_SOURCE};
use crate::config::{Medium, MAX_CHANS};
use crate::txq::Priority;
use crate::Tnc;

pub const AGW_HDR_LEN: usize = 36;
/// Longest data part a client may send; anything bigger is hostile.
pub const AGW_MAX_DATA: usize = 4096;
/// Registered callsigns per client.
pub const MAX_REG_CALLSIGNS: usize = 8;

/// Reply buffer: header plus the largest non-monitor payload.
pub const AGW_RESP_CAP: usize = 512;
/// Monitor/raw frame buffer: header plus text or raw frame.
pub const AGW_MON_CAP: usize = AGW_HDR_LEN + monitor::MONITOR_TEXT_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AgwError {
    /// Port beyond the channel table; connection is dropped.
    BadPort,
    /// Advertised data length beyond [`AGW_MAX_DATA`]; dropped too.
    OversizeData,
}

/// The fixed wire header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgwHeader {
    pub port: u32,
    pub datakind: u8,
    pub pid: u8,
    pub call_from: [u8; 10],
    pub call_to: [u8; 10],
    pub data_len: u32,
    pub user_reserved: u32,
}

impl AgwHeader {
    pub fn new(port: u32, datakind: u8) -> Self {
        Self { port, datakind, ..Self::default() }
    }

    pub fn parse(bytes: &[u8; AGW_HDR_LEN]) -> Self {
        let le32 = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let mut call_from = [0u8; 10];
        call_from.copy_from_slice(&bytes[8..18]);
        let mut call_to = [0u8; 10];
        call_to.copy_from_slice(&bytes[18..28]);
        Self {
            port: le32(0),
            datakind: bytes[4],
            pid: bytes[6],
            call_from,
            call_to,
            data_len: le32(28),
            user_reserved: le32(32),
        }
    }

    pub fn to_bytes(&self) -> [u8; AGW_HDR_LEN] {
        let mut b = [0u8; AGW_HDR_LEN];
        b[0..4].copy_from_slice(&self.port.to_le_bytes());
        b[4] = self.datakind;
        b[6] = self.pid;
        b[8..18].copy_from_slice(&self.call_from);
        b[18..28].copy_from_slice(&self.call_to);
        b[28..32].copy_from_slice(&self.data_len.to_le_bytes());
        b[32..36].copy_from_slice(&self.user_reserved.to_le_bytes());
        b
    }

    pub fn call_from_str(&self) -> &str {
        nul_str(&self.call_from)
    }

    pub fn call_to_str(&self) -> &str {
        nul_str(&self.call_to)
    }
}

fn nul_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

fn call_field(label: &str) -> [u8; 10] {
    let mut f = [0u8; 10];
    for (i, b) in label.bytes().take(9).enumerate() {
        f[i] = b;
    }
    f
}

/// Incremental reader for the header+data stream of one client.
pub struct AgwReader {
    hdr: [u8; AGW_HDR_LEN],
    got: usize,
    header: Option<AgwHeader>,
    data: Vec<u8, AGW_MAX_DATA>,
}

impl Default for AgwReader {
    fn default() -> Self {
        Self::new()
    }
}

impl AgwReader {
    pub const fn new() -> Self {
        Self { hdr: [0; AGW_HDR_LEN], got: 0, header: None, data: Vec::new() }
    }

    /// Feed one byte. Yields a complete request when the header and its
    /// advertised data have both arrived. Validation happens as soon as
    /// the header is complete, before any data is accepted.
    pub fn feed(&mut self, b: u8) -> Result<Option<(AgwHeader, Vec<u8, AGW_MAX_DATA>)>, AgwError> {
        match &self.header {
            None => {
                self.hdr[self.got] = b;
                self.got += 1;
                if self.got < AGW_HDR_LEN {
                    return Ok(None);
                }
                self.got = 0;
                let h = AgwHeader::parse(&self.hdr);
                if h.data_len as usize > AGW_MAX_DATA {
                    warn!("AGW client advertised {} data bytes, closing", h.data_len);
                    return Err(AgwError::OversizeData);
                }
                if h.port as usize >= MAX_CHANS {
                    warn!("AGW request for port {} out of range, closing", h.port);
                    return Err(AgwError::BadPort);
                }
                if h.data_len == 0 {
                    return Ok(Some((h, Vec::new())));
                }
                self.data.clear();
                self.header = Some(h);
                Ok(None)
            }
            Some(h) => {
                // Capacity was checked against data_len already.
                let _ = self.data.push(b);
                if self.data.len() == h.data_len as usize {
                    let h = self.header.take().unwrap_or_default();
                    let data = core::mem::take(&mut self.data);
                    return Ok(Some((h, data)));
                }
                Ok(None)
            }
        }
    }
}

/// Per-connection state.
#[derive(Default)]
pub struct AgwClient {
    pub raw_enabled: bool,
    pub monitor_enabled: bool,
    callsigns: Vec<String<10>, MAX_REG_CALLSIGNS>,
}

impl AgwClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, call: &str) -> bool {
        self.callsigns.iter().any(|c| c.as_str() == call)
    }
}

fn push_reply<const N: usize>(out: &mut Vec<u8, N>, mut hdr: AgwHeader, data: &[u8]) {
    hdr.data_len = data.len() as u32;
    out.extend_from_slice(&hdr.to_bytes()).ok();
    out.extend_from_slice(data).ok();
}

/// Handle one complete client request. Any reply bytes are appended to
/// `out`, ready for the socket.
pub fn handle_request(
    tnc: &Tnc,
    client: &mut AgwClient,
    hdr: &AgwHeader,
    data: &[u8],
    out: &mut Vec<u8, AGW_RESP_CAP>,
) {
    let chan = hdr.port as u8;
    match hdr.datakind {
        b'P' => {
            // Application login; nothing to check, nothing to say.
            debug!("AGW login from client ignored");
        }
        b'R' => {
            let mut v = [0u8; 8];
            v[0..4].copy_from_slice(&crate::VERSION_MAJOR.to_le_bytes());
            v[4..8].copy_from_slice(&crate::VERSION_MINOR.to_le_bytes());
            push_reply(out, AgwHeader::new(0, b'R'), &v);
        }
        b'G' => {
            let mut text: String<256> = String::new();
            let radios: Vec<u8, MAX_CHANS> = (0..MAX_CHANS as u8)
                .filter(|&c| tnc.config().medium(c) == Medium::Radio)
                .collect();
            write!(&mut text, "{}", radios.len()).ok();
            for (i, c) in radios.iter().enumerate() {
                write!(&mut text, ";Port{} Radio channel {}", i + 1, c).ok();
            }
            text.push(';').ok();
            push_reply(out, AgwHeader::new(0, b'G'), text.as_bytes());
        }
        b'g' => {
            let t = tnc.timing(chan);
            let baud: u8 = match tnc.config().chan(chan).map(|c| c.modem_type) {
                Some(crate::config::ModemType::Scrambled) => 3, // 9600
                _ => 0,                                         // 1200
            };
            let bytes_waiting = tnc.txq().count(chan, None, None, None, true) as u32;
            let mut v = [0u8; 12];
            v[0] = baud;
            v[1] = 1; // traffic level: software modem has no hardware meter
            v[2] = t.txdelay;
            v[3] = t.txtail;
            v[4] = t.persist;
            v[5] = t.slottime;
            v[6] = 7; // MAXFRAME default
            v[7] = 0; // active connections live in the external engine
            v[8..12].copy_from_slice(&bytes_waiting.to_le_bytes());
            push_reply(out, AgwHeader::new(hdr.port, b'g'), &v);
        }
        b'k' => {
            client.raw_enabled = !client.raw_enabled;
            info!("AGW client raw stream now {}", client.raw_enabled);
        }
        b'm' => {
            client.monitor_enabled = !client.monitor_enabled;
            info!("AGW client monitor stream now {}", client.monitor_enabled);
        }
        b'V' => {
            if let Some(pkt) = build_ui_with_via(hdr, data) {
                let _ = tnc.txq().append(chan, Priority::Low, pkt);
            } else {
                warn!("AGW 'V' transmit request refused (bad addresses or path)");
            }
        }
        b'K' => {
            // One lead-in byte, then the raw frame without FCS.
            if data.len() < 2 {
                warn!("AGW 'K' frame too short, refused");
                return;
            }
            match Ax25Packet::from_frame_bytes(&data[1..]) {
                Ok(pkt) => {
                    let prio = if pkt.heard_idx() >= AX25_REPEATER_1 {
                        Priority::High
                    } else {
                        Priority::Low
                    };
                    let _ = tnc.txq().append(chan, prio, pkt);
                }
                Err(_) => warn!("AGW 'K' frame refused, invalid AX.25"),
            }
        }
        b'X' => {
            let call = hdr.call_from_str();
            let ok = !call.is_empty()
                && !client.is_registered(call)
                && client.callsigns.push(String::try_from(call).unwrap_or_default()).is_ok();
            push_reply(out, AgwHeader { call_from: hdr.call_from, ..AgwHeader::new(hdr.port, b'X') }, &[ok as u8]);
        }
        b'x' => {
            let call = hdr.call_from_str();
            client.callsigns.retain(|c| c.as_str() != call);
        }
        b'y' => {
            let n = tnc.txq().count(chan, None, None, None, false) as u32;
            push_reply(out, AgwHeader::new(hdr.port, b'y'), &n.to_le_bytes());
        }
        b'Y' => {
            // Outstanding connected-mode frames; that machine is external.
            push_reply(out, AgwHeader::new(hdr.port, b'Y'), &0u32.to_le_bytes());
        }
        b'M' => {
            match Ax25Packet::new_ui(hdr.call_from_str(), hdr.call_to_str(), &[], AX25_PID_NO_LAYER_3, data) {
                Ok(pkt) => {
                    let _ = tnc.txq().append(chan, Priority::Low, pkt);
                }
                Err(_) => warn!("AGW 'M' transmit request refused (bad addresses)"),
            }
        }
        b'C' | b'v' | b'c' | b'D' | b'd' => {
            warn!("AGW connected-mode request {} not handled here", hdr.datakind);
        }
        b'H' => {
            debug!("AGW heard-stations query ignored");
        }
        other => {
            warn!("unsupported AGW datakind {} ignored", other);
        }
    }
}

/// `V` payload: via count, that many 10-byte callsign fields, then info.
fn build_ui_with_via(hdr: &AgwHeader, data: &[u8]) -> Option<Ax25Packet> {
    let nvia = *data.first()? as usize;
    if nvia > AX25_MAX_REPEATERS {
        return None;
    }
    let info_off = 1 + nvia * 10;
    if data.len() < info_off {
        return None;
    }
    let mut vias: Vec<&str, AX25_MAX_REPEATERS> = Vec::new();
    for i in 0..nvia {
        let field = &data[1 + i * 10..1 + i * 10 + 10];
        let call = nul_str(field).trim_end();
        if call.is_empty() {
            return None;
        }
        vias.push(call).ok()?;
    }
    Ax25Packet::new_ui(hdr.call_from_str(), hdr.call_to_str(), &vias, AX25_PID_NO_LAYER_3, &data[info_off..]).ok()
}

/// Encode a raw-stream ('K') record for a received frame.
pub fn raw_record(pkt: &Ax25Packet, out: &mut Vec<u8, AGW_MON_CAP>) {
    let hdr = AgwHeader {
        port: pkt.chan as u32,
        datakind: b'K',
        pid: pkt.pid().unwrap_or(0),
        call_from: call_field(pkt.addr_with_ssid(AX25_SOURCE).as_deref().unwrap_or("")),
        call_to: call_field(pkt.addr_with_ssid(AX25_DESTINATION).as_deref().unwrap_or("")),
        data_len: (pkt.len() + 1) as u32,
        user_reserved: 0,
    };
    out.extend_from_slice(&hdr.to_bytes()).ok();
    // Lead-in byte mirrors the KISS type byte convention.
    out.push(pkt.chan << 4).ok();
    out.extend_from_slice(pkt.frame()).ok();
}

/// Encode a monitor-stream record. `kind` is 'U', 'I', 'S' for received
/// frames or 'T' for our own transmissions.
pub fn monitor_record(pkt: &Ax25Packet, kind: u8, uptime_secs: u64, out: &mut Vec<u8, AGW_MON_CAP>) {
    let mut text: String<{ monitor::MONITOR_TEXT_MAX }> = String::new();
    monitor::monitor_text(pkt, uptime_secs, &mut text);
    let hdr = AgwHeader {
        port: pkt.chan as u32,
        datakind: kind,
        pid: pkt.pid().unwrap_or(0),
        call_from: call_field(pkt.addr_with_ssid(AX25_SOURCE).as_deref().unwrap_or("")),
        call_to: call_field(pkt.addr_with_ssid(AX25_DESTINATION).as_deref().unwrap_or("")),
        data_len: text.len() as u32,
        user_reserved: 0,
    };
    out.extend_from_slice(&hdr.to_bytes()).ok();
    out.extend_from_slice(text.as_bytes()).ok();
}

/// Monitor datakind for a received frame.
pub fn monitor_kind(pkt: &Ax25Packet) -> u8 {
    match pkt.frame_type().frame_type {
        FrameType::Ui => b'U',
        FrameType::I => b'I',
        _ => b'S',
    }
}

/// Serve one AGW client over any byte stream until it hangs up, fails,
/// or violates the protocol. Callsign registrations die with the
/// connection.
pub(crate) async fn serve_client<S>(tnc: &Tnc, io: &mut S)
where
    S: embedded_io_async::Read + embedded_io_async::Write,
{
    use embassy_futures::select::{select, Either};
    use embassy_sync::pubsub::WaitResult;
    use embassy_time::Instant;

    use crate::recv::RxEvent;

    let mut sub = match tnc.events().subscriber() {
        Ok(s) => s,
        Err(_) => {
            error!("out of fan-out subscriber slots for AGW client");
            return;
        }
    };
    let mut reader = AgwReader::new();
    let mut client = AgwClient::new();
    let mut chunk = [0u8; 256];
    loop {
        match select(io.read(&mut chunk), sub.next_message()).await {
            Either::First(Ok(0)) | Either::First(Err(_)) => return,
            Either::First(Ok(n)) => {
                for i in 0..n {
                    match reader.feed(chunk[i]) {
                        Ok(Some((hdr, data))) => {
                            let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
                            handle_request(tnc, &mut client, &hdr, &data, &mut out);
                            if !out.is_empty() && io.write_all(&out).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(_) => return, // protocol violation: hang up
                    }
                }
            }
            Either::Second(WaitResult::Lagged(n)) => {
                warn!("slow AGW client lost {} frames", n);
            }
            Either::Second(WaitResult::Message(ev)) => {
                let uptime = Instant::now().as_secs();
                let mut out: Vec<u8, AGW_MON_CAP> = Vec::new();
                match ev {
                    RxEvent::Received(p) => {
                        if client.raw_enabled {
                            raw_record(&p, &mut out);
                            if io.write_all(&out).await.is_err() {
                                return;
                            }
                            out.clear();
                        }
                        if client.monitor_enabled {
                            monitor_record(&p, monitor_kind(&p), uptime, &mut out);
                            if io.write_all(&out).await.is_err() {
                                return;
                            }
                        }
                    }
                    RxEvent::Transmitted(p) => {
                        if client.monitor_enabled && p.frame_type().frame_type == FrameType::Ui {
                            monitor_record(&p, b'T', uptime, &mut out);
                            if io.write_all(&out).await.is_err() {
                                return;
                            }
                        }
                    }
                    RxEvent::KissClient { .. } => {}
                }
            }
        }
    }
}

/// Accept and serve AGW TCP clients forever.
pub async fn agw_server(tnc: &Tnc, stack: embassy_net::Stack<'_>, port: u16) -> ! {
    use embassy_futures::join::join3;

    info!("AGW server listening on port {}", port);
    join3(
        client_slot(tnc, stack, port, 0),
        client_slot(tnc, stack, port, 1),
        client_slot(tnc, stack, port, 2),
    )
    .await
    .0
}

async fn client_slot(tnc: &Tnc, stack: embassy_net::Stack<'_>, port: u16, slot: u8) -> ! {
    use embassy_time::{Duration, Timer};

    const SOCKET_BUF: usize = 2048;
    let mut rx_buf = [0u8; SOCKET_BUF];
    let mut tx_buf = [0u8; SOCKET_BUF];
    loop {
        let mut socket = embassy_net::tcp::TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
        if socket.accept(port).await.is_err() {
            warn!("AGW accept failed on port {}", port);
            Timer::after(Duration::from_millis(100)).await;
            continue;
        }
        info!("AGW client connected (slot {})", slot);
        serve_client(tnc, &mut socket).await;
        socket.close();
        info!("AGW client gone (slot {})", slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TncConfig;

    fn tnc() -> &'static Tnc {
        let mut cfg = TncConfig::default();
        cfg.chans[0].medium = Medium::Radio;
        cfg.chans[1].medium = Medium::Radio;
        Box::leak(Box::new(Tnc::new(cfg)))
    }

    fn request(port: u32, kind: u8) -> AgwHeader {
        AgwHeader::new(port, kind)
    }

    #[test]
    fn header_round_trip() {
        let mut h = AgwHeader::new(2, b'V');
        h.pid = 0xF0;
        h.call_from = call_field("N1ABC-7");
        h.call_to = call_field("APRS");
        h.data_len = 42;
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), AGW_HDR_LEN);
        let back = AgwHeader::parse(&bytes);
        assert_eq!(back, h);
        assert_eq!(back.call_from_str(), "N1ABC-7");
        assert_eq!(back.call_to_str(), "APRS");
    }

    #[test]
    fn version_query() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
        handle_request(t, &mut client, &request(0, b'R'), &[], &mut out);

        assert_eq!(out.len(), AGW_HDR_LEN + 8);
        let mut hdr = [0u8; AGW_HDR_LEN];
        hdr.copy_from_slice(&out[..AGW_HDR_LEN]);
        let hdr = AgwHeader::parse(&hdr);
        assert_eq!(hdr.datakind, b'R');
        assert_eq!(hdr.data_len, 8);
        let major = u32::from_le_bytes(out[36..40].try_into().unwrap());
        let minor = u32::from_le_bytes(out[40..44].try_into().unwrap());
        assert_eq!((major, minor), (crate::VERSION_MAJOR, crate::VERSION_MINOR));
        // No state change on the server.
        assert!(!client.raw_enabled);
        assert!(!client.monitor_enabled);
    }

    #[test]
    fn port_info_lists_radio_channels() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
        handle_request(t, &mut client, &request(0, b'G'), &[], &mut out);
        let text = core::str::from_utf8(&out[AGW_HDR_LEN..]).unwrap();
        assert!(text.starts_with("2;Port1 Radio channel 0;"), "got {:?}", text);
    }

    #[test]
    fn toggles_flip_every_time() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
        for expect in [true, false, true] {
            handle_request(t, &mut client, &request(0, b'k'), &[], &mut out);
            assert_eq!(client.raw_enabled, expect);
        }
        for expect in [true, false] {
            handle_request(t, &mut client, &request(0, b'm'), &[], &mut out);
            assert_eq!(client.monitor_enabled, expect);
        }
    }

    #[test]
    fn register_and_unregister_callsign() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
        let mut hdr = request(0, b'X');
        hdr.call_from = call_field("N1ABC");
        handle_request(t, &mut client, &hdr, &[], &mut out);
        assert_eq!(out[AGW_HDR_LEN], 1);
        assert!(client.is_registered("N1ABC"));

        // Duplicate registration is refused.
        out.clear();
        handle_request(t, &mut client, &hdr, &[], &mut out);
        assert_eq!(out[AGW_HDR_LEN], 0);

        let mut hdr = request(0, b'x');
        hdr.call_from = call_field("N1ABC");
        out.clear();
        handle_request(t, &mut client, &hdr, &[], &mut out);
        assert!(out.is_empty());
        assert!(!client.is_registered("N1ABC"));
    }

    #[test]
    fn unproto_via_path_enqueues_low() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
        let mut hdr = request(0, b'V');
        hdr.call_from = call_field("N1ABC-7");
        hdr.call_to = call_field("APRS");
        let mut data: Vec<u8, 64> = Vec::new();
        data.push(1).unwrap();
        data.extend_from_slice(&call_field("WIDE1-1")).unwrap();
        data.extend_from_slice(b">V test").unwrap();
        handle_request(t, &mut client, &hdr, &data, &mut out);

        let q = t.txq().peek(0, Priority::Low).expect("queued");
        assert_eq!(q.addr_with_ssid(AX25_SOURCE).unwrap().as_str(), "N1ABC-7");
        assert_eq!(q.addr_with_ssid(AX25_DESTINATION).unwrap().as_str(), "APRS");
        assert_eq!(q.num_repeaters(), 1);
        assert_eq!(q.info(), b">V test");
    }

    #[test]
    fn raw_transmit_priority_follows_used_path() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();

        // No repeaters: ordinary priority.
        let plain = Ax25Packet::from_text("N1ABC>APRS:plain").unwrap();
        let mut data: Vec<u8, 400> = Vec::new();
        data.push(0).unwrap();
        data.extend_from_slice(plain.frame()).unwrap();
        handle_request(t, &mut client, &request(1, b'K'), &data, &mut out);
        assert_eq!(t.txq().count(1, Some(Priority::Low), None, None, false), 1);

        // A used (H-bit) via path jumps the line.
        let mut hot = Ax25Packet::from_text("N1ABC>APRS,WIDE1-1:urgent").unwrap();
        hot.set_h_bit(AX25_REPEATER_1, true);
        let mut data: Vec<u8, 400> = Vec::new();
        data.push(0).unwrap();
        data.extend_from_slice(hot.frame()).unwrap();
        handle_request(t, &mut client, &request(1, b'K'), &data, &mut out);
        assert_eq!(t.txq().count(1, Some(Priority::High), None, None, false), 1);
    }

    #[test]
    fn queue_length_query() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
        t.txq().append(0, Priority::Low, Ax25Packet::from_text("A1A>B2B:one").unwrap()).unwrap();
        t.txq().append(0, Priority::High, Ax25Packet::from_text("A1A>B2B:two").unwrap()).unwrap();
        handle_request(t, &mut client, &request(0, b'y'), &[], &mut out);
        let n = u32::from_le_bytes(out[AGW_HDR_LEN..AGW_HDR_LEN + 4].try_into().unwrap());
        assert_eq!(n, 2);
    }

    #[test]
    fn unproto_without_via() {
        let t = tnc();
        let mut client = AgwClient::new();
        let mut out: Vec<u8, AGW_RESP_CAP> = Vec::new();
        let mut hdr = request(0, b'M');
        hdr.call_from = call_field("N1ABC");
        hdr.call_to = call_field("CQ");
        handle_request(t, &mut client, &hdr, b"hello all", &mut out);
        let q = t.txq().peek(0, Priority::Low).expect("queued");
        assert_eq!(q.info(), b"hello all");
        assert_eq!(q.num_repeaters(), 0);
    }

    #[test]
    fn reader_reassembles_split_requests() {
        let mut reader = AgwReader::new();
        let mut hdr = AgwHeader::new(0, b'M');
        hdr.data_len = 5;
        let mut wire: std::vec::Vec<u8> = hdr.to_bytes().to_vec();
        wire.extend_from_slice(b"hello");

        let mut got = None;
        for &b in &wire {
            if let Some(req) = reader.feed(b).unwrap() {
                assert!(got.is_none());
                got = Some(req);
            }
        }
        let (h, data) = got.expect("request completes at final byte");
        assert_eq!(h.datakind, b'M');
        assert_eq!(&data[..], b"hello");

        // Zero-data requests complete on the header's last byte.
        let mut got = None;
        for &b in &AgwHeader::new(1, b'y').to_bytes() {
            if let Some(req) = reader.feed(b).unwrap() {
                got = Some(req);
            }
        }
        assert_eq!(got.expect("complete").0.datakind, b'y');
    }

    #[test]
    fn reader_rejects_hostile_headers() {
        let mut reader = AgwReader::new();
        let mut hdr = AgwHeader::new(0, b'M');
        hdr.data_len = AGW_MAX_DATA as u32 + 1;
        let mut err = None;
        for &b in &hdr.to_bytes() {
            if let Err(e) = reader.feed(b) {
                err = Some(e);
                break;
            }
        }
        assert_eq!(err, Some(AgwError::OversizeData));

        let mut reader = AgwReader::new();
        let hdr = AgwHeader::new(MAX_CHANS as u32, b'y');
        let mut err = None;
        for &b in &hdr.to_bytes() {
            if let Err(e) = reader.feed(b) {
                err = Some(e);
                break;
            }
        }
        assert_eq!(err, Some(AgwError::BadPort));
    }

    #[test]
    fn raw_record_layout() {
        let mut pkt = Ax25Packet::from_text("N1ABC-7>APRS:raw").unwrap();
        pkt.chan = 1;
        let mut out: Vec<u8, AGW_MON_CAP> = Vec::new();
        raw_record(&pkt, &mut out);
        let mut hdr = [0u8; AGW_HDR_LEN];
        hdr.copy_from_slice(&out[..AGW_HDR_LEN]);
        let hdr = AgwHeader::parse(&hdr);
        assert_eq!(hdr.datakind, b'K');
        assert_eq!(hdr.port, 1);
        assert_eq!(hdr.data_len as usize, pkt.len() + 1);
        assert_eq!(hdr.call_from_str(), "N1ABC-7");
        assert_eq!(out[AGW_HDR_LEN], 1 << 4);
        assert_eq!(&out[AGW_HDR_LEN + 1..], pkt.frame());
    }

    #[test]
    fn monitor_kinds() {
        let ui = Ax25Packet::from_text("A1A>B2B:x").unwrap();
        assert_eq!(monitor_kind(&ui), b'U');
        let mut bytes: heapless::Vec<u8, 400> = heapless::Vec::from_slice(ui.frame()).unwrap();
        bytes[14] = 0x00; // I frame
        let i = Ax25Packet::from_frame_bytes(&bytes).unwrap();
        assert_eq!(monitor_kind(&i), b'I');
        bytes[14] = 0x01; // RR
        let s = Ax25Packet::from_frame_bytes(&bytes[..15]).unwrap();
        assert_eq!(monitor_kind(&s), b'S');
    }
}
