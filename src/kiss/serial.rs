//! KISS over a serial byte stream.
//!
//! Same framing as the TCP flavor, one logical client, no KISSCOPY
//! mirroring. Works over anything implementing the async I/O traits: a
//! UART, USB CDC, or an RFCOMM bridge. Returns when the stream fails so
//! a poll-mode caller can reopen devices that come and go.

use crate::Tnc;

pub async fn kiss_serial<S>(tnc: &Tnc, io: &mut S, pinned: Option<u8>)
where
    S: embedded_io_async::Read + embedded_io_async::Write,
{
    info!("KISS serial front-end up");
    super::serve_client(tnc, io, pinned, None).await;
    warn!("KISS serial stream closed");
}
