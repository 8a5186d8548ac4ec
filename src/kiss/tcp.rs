//! KISS over TCP.
//!
//! One listener per configured port, up to [`MAX_CLIENTS`] concurrent
//! clients. Each client slot owns its own socket buffers and loops
//! accept → serve → close, so a slot freed by a disconnect is reusable on
//! the next accept without touching the others.
//!
//! A port may be pinned to a single radio channel; the channel nibble of
//! client data frames is then overridden and only that channel's traffic
//! is forwarded. This lets single-radio applications drive one of
//! several radios by picking a port.

use embassy_futures::join::join3;
use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embassy_time::{Duration, Timer};

use crate::config::MAX_CLIENTS;
use crate::Tnc;

const SOCKET_BUF: usize = 1024;

// Slot count must match the futures joined below.
const _: () = assert!(MAX_CLIENTS == 3);

/// Accept and serve KISS TCP clients forever.
pub async fn kiss_tcp_server(tnc: &Tnc, stack: Stack<'_>, port: u16, pinned: Option<u8>) -> ! {
    info!("KISS server listening on port {}", port);
    join3(
        client_slot(tnc, stack, port, pinned, 0),
        client_slot(tnc, stack, port, pinned, 1),
        client_slot(tnc, stack, port, pinned, 2),
    )
    .await
    .0
}

async fn client_slot(tnc: &Tnc, stack: Stack<'_>, port: u16, pinned: Option<u8>, slot: u8) -> ! {
    let mut rx_buf = [0u8; SOCKET_BUF];
    let mut tx_buf = [0u8; SOCKET_BUF];
    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
        if socket.accept(port).await.is_err() {
            warn!("KISS accept failed on port {}", port);
            Timer::after(Duration::from_millis(100)).await;
            continue;
        }
        info!("KISS client connected (port {}, slot {})", port, slot);
        super::serve_client(tnc, &mut socket, pinned, Some(slot)).await;
        socket.close();
        info!("KISS client gone (port {}, slot {})", port, slot);
    }
}
