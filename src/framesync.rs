//! Flag hunting on a continuous symbol stream.
//!
//! Sits between a demodulator's raw bit output and the candidate decoder
//! in [`crate::hdlc`]: watches the NRZI-decoded stream for flag octets,
//! collects the raw bits found between two flags, and carries the line
//! state (NRZI reference, descrambler register) across so a candidate can
//! be re-decoded from scratch, with or without fix-up bit flips.
//!
//! Keeping the raw bits rather than decoded octets is what makes the
//! retry machinery possible at all: a flipped raw bit changes the
//! de-stuffing decisions downstream of it, so candidates must be
//! re-walked from the opening flag every time.

use crate::bits::BitBuf;
use crate::hdlc::{Candidate, MIN_FRAME_LEN};

/// Raw bits between two flags plus the line state after the opening
/// flag, ready to decode.
pub struct SyncedBlock {
    pub bits: BitBuf,
    pub flag_bit: bool,
    pub lfsr: u32,
    pub prev_descram: bool,
    pub scrambled: bool,
}

impl SyncedBlock {
    pub fn candidate(&self) -> Candidate<'_> {
        Candidate {
            bits: &self.bits,
            flag_bit: self.flag_bit,
            scrambled: self.scrambled,
            lfsr: self.lfsr,
            prev_descram: self.prev_descram,
        }
    }
}

/// Per-demodulator synchronizer state.
pub struct FrameSync {
    scrambled: bool,
    prev_raw: bool,
    lfsr: u32,
    prev_descram: bool,
    pat_det: u8,
    collecting: BitBuf,
    /// A flag has been seen and the collected bits started right after it.
    synced: bool,
    // Line state snapshot from the end of the opening flag.
    seed_flag_bit: bool,
    seed_lfsr: u32,
    seed_prev_descram: bool,
}

impl FrameSync {
    pub fn new(scrambled: bool) -> Self {
        Self {
            scrambled,
            prev_raw: false,
            lfsr: 0,
            prev_descram: false,
            pat_det: 0,
            collecting: BitBuf::new(),
            synced: false,
            seed_flag_bit: false,
            seed_lfsr: 0,
            seed_prev_descram: false,
        }
    }

    fn capture_seeds(&mut self) {
        self.seed_flag_bit = self.prev_raw;
        self.seed_lfsr = self.lfsr;
        self.seed_prev_descram = self.prev_descram;
        self.collecting.clear();
        self.synced = true;
    }

    /// Feed one raw symbol bit from the demodulator. Returns a candidate
    /// block when a closing flag ends a plausible frame.
    pub fn rx_bit(&mut self, raw: bool) -> Option<SyncedBlock> {
        let dbit = if self.scrambled {
            let descram = (raw as u32 ^ (self.lfsr >> 16) ^ (self.lfsr >> 11)) & 1 != 0;
            self.lfsr = (self.lfsr << 1) | raw as u32;
            let d = descram == self.prev_descram;
            self.prev_descram = descram;
            self.prev_raw = raw;
            d
        } else {
            let d = raw == self.prev_raw;
            self.prev_raw = raw;
            d
        };
        self.pat_det >>= 1;
        if dbit {
            self.pat_det |= 0x80;
        }

        let was_synced = self.synced;
        let before_len = self.collecting.len();
        if was_synced {
            self.collecting.push(raw);
            if self.collecting.len() == before_len {
                // Out of room: nothing that long is a frame.
                self.synced = false;
            }
        }

        if self.pat_det == 0xFE {
            // Abort: drop whatever was collecting, hunt for the next flag.
            self.synced = false;
            return None;
        }
        if self.pat_det != 0x7E {
            return None;
        }

        // Flag complete. Whatever preceded its 8 bits is a candidate.
        let mut result = None;
        if was_synced && self.collecting.len() >= 8 {
            let content = self.collecting.len() - 8;
            if content >= MIN_FRAME_LEN * 8 {
                let mut bits = core::mem::take(&mut self.collecting);
                bits.truncate(content);
                result = Some(SyncedBlock {
                    bits,
                    flag_bit: self.seed_flag_bit,
                    lfsr: self.seed_lfsr,
                    prev_descram: self.seed_prev_descram,
                    scrambled: self.scrambled,
                });
            }
        }
        self.capture_seeds();
        result
    }
}
