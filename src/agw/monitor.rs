//! TNC-2 style monitor text for AGW clients.
//!
//! One line of header description followed by the information field:
//! ` 1:Fm WB2OSZ-15 To APRS Via WIDE1-1* <UI pid=F0 Len=5 P=0 >[00:01:42]`
//! then CR, the info bytes, CR, NUL. Only the heard station (last
//! repeater with the H bit, else nobody) is starred.

use core::fmt::Write;

use heapless::String;

use crate::ax25::{Ax25Packet, CmdRes, FrameType, AX25_DESTINATION, AX25_REPEATER_1, AX25_SOURCE};

/// Worst case: addresses, descriptor, 256 info bytes.
pub const MONITOR_TEXT_MAX: usize = 420;

fn pf_letter(cr: CmdRes) -> &'static str {
    match cr {
        CmdRes::Command => "P",
        CmdRes::Response => "F",
        CmdRes::Legacy => "PF",
    }
}

fn push_desc<const N: usize>(pkt: &Ax25Packet, out: &mut String<N>) {
    let fi = pkt.frame_type();
    let pf = fi.pf as u8;
    let letter = pf_letter(fi.cr);
    match fi.frame_type {
        FrameType::Ui => {
            write!(out, "<UI pid={:02X} Len={} {}={} >", pkt.pid().unwrap_or(0), pkt.info().len(), letter, pf).ok();
        }
        FrameType::I => {
            write!(
                out,
                "<I S{} R{} pid={:02X} Len={} {}={} >",
                fi.ns.unwrap_or(0),
                fi.nr.unwrap_or(0),
                pkt.pid().unwrap_or(0),
                pkt.info().len(),
                letter,
                pf
            )
            .ok();
        }
        FrameType::Rr | FrameType::Rnr | FrameType::Rej | FrameType::Srej => {
            let name = match fi.frame_type {
                FrameType::Rr => "RR",
                FrameType::Rnr => "RNR",
                FrameType::Rej => "REJ",
                _ => "SREJ",
            };
            write!(out, "<{} R{} {}={} >", name, fi.nr.unwrap_or(0), letter, pf).ok();
        }
        other => {
            let name = match other {
                FrameType::Sabm => "SABM",
                FrameType::Sabme => "SABME",
                FrameType::Disc => "DISC",
                FrameType::Dm => "DM",
                FrameType::Ua => "UA",
                FrameType::Frmr => "FRMR",
                FrameType::Xid => "XID",
                FrameType::Test => "TEST",
                _ => "?",
            };
            write!(out, "<{} {}={} >", name, letter, pf).ok();
        }
    }
}

/// Render the full monitor record. `uptime_secs` feeds the `[HH:MM:SS]`
/// stamp; ports are numbered from 1 in the text, matching old TNC
/// conventions.
pub fn monitor_text(pkt: &Ax25Packet, uptime_secs: u64, out: &mut String<MONITOR_TEXT_MAX>) {
    write!(out, " {}:Fm ", pkt.chan + 1).ok();
    if let Some(a) = pkt.addr_with_ssid(AX25_SOURCE) {
        out.push_str(&a).ok();
    }
    out.push_str(" To ").ok();
    if let Some(a) = pkt.addr_with_ssid(AX25_DESTINATION) {
        out.push_str(&a).ok();
    }
    let n = pkt.num_addrs();
    if n > AX25_REPEATER_1 {
        out.push_str(" Via ").ok();
        let heard = pkt.heard_idx();
        for idx in AX25_REPEATER_1..n {
            if idx > AX25_REPEATER_1 {
                out.push(',').ok();
            }
            if let Some(a) = pkt.addr_with_ssid(idx) {
                out.push_str(&a).ok();
            }
            if idx == heard {
                out.push('*').ok();
            }
        }
    }
    out.push(' ').ok();
    push_desc(pkt, out);
    let (h, m, s) = (uptime_secs / 3600 % 100, uptime_secs / 60 % 60, uptime_secs % 60);
    write!(out, "[{:02}:{:02}:{:02}]\r", h, m, s).ok();
    for &b in pkt.info() {
        out.push(b as char).ok();
    }
    out.push('\r').ok();
    out.push('\0').ok();
}
