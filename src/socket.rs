// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Socket binding and the datagram demultiplexer that lets a single UDP
//! socket be driven by quinn while also feeding a second, non-QUIC
//! consumer.
//!
//! The demultiplexer is the one piece of this crate with no analogue
//! anywhere else in the codebase: `quinn::AsyncUdpSocket` is normally a
//! thin wrapper around a single owner's socket, and nothing else reads from
//! it. Sharing the fd for another protocol means intercepting every
//! `recv` ourselves and classifying each datagram by its first byte before
//! quinn ever sees it, per the heuristic in RFC 7983 §7: QUIC (and DTLS, and
//! STUN) datagrams vs. everything else are distinguishable from the first
//! octet alone.

use std::{
    io::{self, IoSliceMut},
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use quinn::udp::{RecvMeta, Transmit, UdpPoller};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::mpsc};

use crate::{
    config::SocketBinder,
    error::{Error, Result},
};

/// Binds a UDP socket with `SO_REUSEADDR` set ahead of the bind, matching
/// how quinn's own endpoints claim a port that several logical listeners
/// intend to share.
pub struct DefaultBinder;

impl SocketBinder for DefaultBinder {
    fn bind(&self, addr: SocketAddr) -> Result<std::net::UdpSocket> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::BindFailure)?;
        socket.set_reuse_address(true).map_err(Error::BindFailure)?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(Error::BindFailure)?;
        socket.set_nonblocking(true).map_err(Error::BindFailure)?;
        socket.bind(&addr.into()).map_err(Error::BindFailure)?;
        Ok(socket.into())
    }
}

/// First byte of a datagram is used to classify it per RFC 7983: QUIC long
/// and short headers both keep the top two bits out of the `0x00`–`0x3f`
/// band STUN uses, and never collide with the fixed `0x16`/`0x14` prefixes
/// TLS/DTLS record framing produces on the wire. Anything that is not
/// plausibly QUIC is handed to the secondary consumer instead.
fn looks_like_quic(first_byte: u8) -> bool {
    // Long header: top bit set, second-highest bit set (form + fixed bit).
    // Short header: top bit clear, second-highest bit set (fixed bit).
    // Either way bit 6 (0x40) is set for QUIC v1; values below that are
    // STUN, and the `0x14`/`0x16` TLS/DTLS record types sit well above the
    // ranges QUIC uses for its header byte in practice.
    first_byte & 0xc0 != 0 && first_byte != 0x16 && first_byte != 0x14
}

/// A UDP socket shared between quinn and a single secondary, non-QUIC
/// packet consumer.
///
/// Implements `quinn::AsyncUdpSocket` so it can be installed directly as an
/// endpoint's transport; datagrams that fail the QUIC heuristic are pushed
/// onto an internal channel instead of being surfaced to quinn at all.
#[derive(Debug)]
pub struct DemuxSocket {
    io: Arc<UdpSocket>,
    non_quic_tx: mpsc::Sender<(Bytes, SocketAddr)>,
    non_quic_attached: Arc<AtomicBool>,
}

/// Receive half handed to the non-QUIC consumer; dropping it detaches the
/// consumer and makes the socket route every future datagram to quinn.
pub struct NonQuicPacketConn {
    rx: mpsc::Receiver<(Bytes, SocketAddr)>,
    io: Arc<UdpSocket>,
    local_addr: SocketAddr,
    attached: Arc<AtomicBool>,
    cancel: tokio_util::sync::CancellationToken,
}

impl NonQuicPacketConn {
    /// Resolves to `None` either when the socket is gone or when
    /// [`Self::close`] is called from another task, unblocking a read that
    /// is currently parked waiting for a packet.
    pub async fn recv_from(&mut self) -> Option<(Bytes, SocketAddr)> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            packet = self.rx.recv() => packet,
        }
    }

    /// Writes go straight through the shared socket; the demultiplexer
    /// only intercepts the receive path, so there is nothing to route here.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.io.send_to(buf, target).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancels any in-flight `recv_from` and marks the consumer detached.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for NonQuicPacketConn {
    fn drop(&mut self) {
        self.attached.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl DemuxSocket {
    /// Wrap a bound, non-blocking `std::net::UdpSocket`. `channel_depth`
    /// bounds how many non-QUIC datagrams may queue before the demuxer
    /// starts dropping them in favour of keeping the QUIC path unblocked.
    pub fn new(socket: std::net::UdpSocket, channel_depth: usize) -> io::Result<(Arc<Self>, NonQuicPacketConn)> {
        let io = Arc::new(UdpSocket::from_std(socket)?);
        let local_addr = io.local_addr()?;
        let (tx, rx) = mpsc::channel(channel_depth.max(1));
        let attached = Arc::new(AtomicBool::new(true));
        let demux = Arc::new(Self {
            io: Arc::clone(&io),
            non_quic_tx: tx,
            non_quic_attached: Arc::clone(&attached),
        });
        let conn = NonQuicPacketConn {
            rx,
            io,
            local_addr,
            attached,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        Ok((demux, conn))
    }
}

struct DemuxPoller {
    io: Arc<UdpSocket>,
}

impl UdpPoller for DemuxPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.io.poll_send_ready(cx)
    }
}

impl quinn::AsyncUdpSocket for DemuxSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(DemuxPoller { io: Arc::clone(&self.io) })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.io
            .try_send_to(&transmit.contents, transmit.destination)
            .map(|_| ())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let attached = self.non_quic_attached.load(Ordering::Relaxed);
        loop {
            let mut read_buf = tokio::io::ReadBuf::new(&mut bufs[0]);
            let from = match std::task::ready!(self.io.poll_recv_from(cx, &mut read_buf)) {
                Ok(from) => from,
                Err(e) => return Poll::Ready(Err(e)),
            };
            let len = read_buf.filled().len();
            if attached && len > 0 && !looks_like_quic(read_buf.filled()[0]) {
                let data = Bytes::copy_from_slice(read_buf.filled());
                // A full channel means the non-QUIC consumer is not
                // keeping up; drop rather than block the QUIC path.
                let _ = self.non_quic_tx.try_send((data, from));
                continue;
            }
            meta[0] = RecvMeta {
                len,
                stride: len,
                addr: from,
                ecn: None,
                dst_ip: None,
            };
            return Poll::Ready(Ok(1));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    fn may_fragment(&self) -> bool {
        false
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }
}
