use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use coap_lite::Packet;
use futures::{Sink, Stream};
use pin_project::pin_project;
use tokio::io::ReadBuf;
use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::transport::{
    BoxedFramedBinding, FramedBinding, FramedItem, FramedReadError, Transport, TransportError,
};

/// Receive buffer sizing when the caller does not supply one.  Large enough for any
/// conventional CoAP datagram including a maximally sized blockwise segment plus options.
const DEFAULT_RECV_BUFFER_SIZE: usize = 2048;

/// Default CoAP transport as originally defined in RFC 7252.  Likely this is what you want if
/// you're new to CoAP.
///
/// A transport owns up to two sockets, one per address family.  Outgoing datagrams are routed
/// to the socket whose family matches the peer; both receive paths feed the same endpoint.
pub struct UdpTransport<A: ToSocketAddrs> {
    addresses: Vec<A>,
    recv_buffer_size: usize,
}

impl<A: ToSocketAddrs> UdpTransport<A> {
    pub fn new(addresses: A) -> Self {
        Self {
            addresses: vec![addresses],
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Bind one IPv4 and one IPv6 socket, e.g. `UdpTransport::dual_stack("0.0.0.0:0", "[::]:0")`.
    pub fn dual_stack(ipv4: A, ipv6: A) -> Self {
        Self {
            addresses: vec![ipv4, ipv6],
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Size of the pre-allocated per-socket receive buffer.  Datagrams larger than this are
    /// truncated by the kernel and will fail to decode.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }
}

#[async_trait]
impl<A: ToSocketAddrs + Sync + Send> Transport for UdpTransport<A> {
    async fn bind(self) -> Result<BoxedFramedBinding, TransportError> {
        let mut sockets = Vec::with_capacity(self.addresses.len());
        let mut local_addrs = Vec::with_capacity(self.addresses.len());
        for addresses in self.addresses {
            let socket = UdpSocket::bind(addresses).await?;
            local_addrs.push(socket.local_addr()?);
            sockets.push(FramedSocket::new(socket, self.recv_buffer_size)?);
        }
        let binding = UdpBinding {
            sockets,
            local_addrs,
            next_poll: 0,
        };
        Ok(Box::pin(binding))
    }
}

#[pin_project]
struct UdpBinding {
    sockets: Vec<FramedSocket>,
    local_addrs: Vec<SocketAddr>,
    next_poll: usize,
}

impl FramedBinding for UdpBinding {
    fn mtu(&self) -> Option<u32> {
        None
    }

    fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }
}

impl Stream for UdpBinding {
    type Item = Result<FramedItem, FramedReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let num_sockets = this.sockets.len();
        for offset in 0..num_sockets {
            let index = (*this.next_poll + offset) % num_sockets;
            if this.sockets[index].dead {
                continue;
            }
            if let Poll::Ready(Some(item)) = this.sockets[index].poll_recv(cx) {
                *this.next_poll = (index + 1) % num_sockets;
                return Poll::Ready(Some(item));
            }
        }
        if this.sockets.iter().all(|s| s.dead) {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

impl Sink<FramedItem> for UdpBinding {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.poll_flush(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: FramedItem) -> Result<(), Self::Error> {
        let (packet, peer) = item;
        let this = self.project();
        let socket = this
            .sockets
            .iter_mut()
            .find(|s| !s.dead && s.is_ipv4 == peer.is_ipv4())
            .ok_or_else(|| {
                TransportError::Unspecified(format!("no usable socket for peer {peer}"))
            })?;
        socket.start_send(&packet, peer)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        for socket in this.sockets.iter_mut() {
            if socket.dead {
                continue;
            }
            if let Err(e) = ready!(socket.poll_flush(cx)) {
                return Poll::Ready(Err(e));
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.poll_flush(cx)
    }
}

/// One bound socket with its pre-allocated receive and send buffers.  The buffers live for
/// the lifetime of the socket so the datagram hot path does not allocate for conventionally
/// sized messages.
struct FramedSocket {
    socket: UdpSocket,
    is_ipv4: bool,
    rd: BytesMut,
    wr: BytesMut,
    pending: Option<PendingSend>,
    dead: bool,
}

enum PendingSend {
    /// Encoded datagram staged in the pre-allocated `wr` buffer.
    Staged(SocketAddr),
    /// Datagram too large for `wr`; carries the encoder's own buffer for the duration of
    /// the send so `wr` keeps its configured capacity.
    Borrowed(Vec<u8>, SocketAddr),
}

impl FramedSocket {
    fn new(socket: UdpSocket, recv_buffer_size: usize) -> Result<Self, TransportError> {
        let is_ipv4 = socket.local_addr()?.is_ipv4();
        let mut rd = BytesMut::with_capacity(recv_buffer_size);
        rd.resize(recv_buffer_size, 0);
        Ok(Self {
            socket,
            is_ipv4,
            rd,
            wr: BytesMut::with_capacity(recv_buffer_size),
            pending: None,
            dead: false,
        })
    }

    /// Receive poller for this socket.  Completions the kernel satisfies synchronously are
    /// consumed by looping in place rather than recursing or re-scheduling.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<FramedItem, FramedReadError>>> {
        if self.dead {
            return Poll::Ready(None);
        }
        loop {
            let mut buf = ReadBuf::new(&mut self.rd);
            match self.socket.poll_recv_from(cx, &mut buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(peer)) => match Packet::from_bytes(buf.filled()) {
                    Ok(packet) => return Poll::Ready(Some(Ok((packet, peer)))),
                    Err(e) => return Poll::Ready(Some(Err((e.into(), Some(peer))))),
                },
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Poll::Ready(Err(e)) => {
                    // Fatal for this socket; the binding carries on with any sibling socket.
                    self.dead = true;
                    return Poll::Ready(Some(Err((e.into(), None))));
                }
            }
        }
    }

    fn start_send(&mut self, packet: &Packet, peer: SocketAddr) -> Result<(), TransportError> {
        debug_assert!(self.pending.is_none(), "start_send without poll_ready");
        let encoded = packet.to_bytes()?;
        self.pending = Some(if encoded.len() <= self.wr.capacity() {
            self.wr.clear();
            self.wr.extend_from_slice(&encoded);
            PendingSend::Staged(peer)
        } else {
            PendingSend::Borrowed(encoded, peer)
        });
        Ok(())
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TransportError>> {
        while self.pending.is_some() {
            let result = {
                let (bytes, peer): (&[u8], SocketAddr) = match self.pending.as_ref().unwrap() {
                    PendingSend::Staged(peer) => (&self.wr[..], *peer),
                    PendingSend::Borrowed(buf, peer) => (&buf[..], *peer),
                };
                ready!(self.socket.poll_send_to(cx, bytes, peer))
            };
            self.pending = None;
            if let Err(e) = result {
                return Poll::Ready(Err(e.into()));
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use coap_lite::{MessageType, Packet};
    use futures::{SinkExt, StreamExt};

    use super::*;

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let a = UdpTransport::new("127.0.0.1:0").bind().await.unwrap();
        let mut b = UdpTransport::new("127.0.0.1:0").bind().await.unwrap();
        let a_addr = a.local_addrs()[0];

        let mut packet = Packet::new();
        packet.header.set_type(MessageType::NonConfirmable);
        packet.header.message_id = 77;
        packet.payload = b"hi".to_vec();
        b.send((packet, a_addr)).await.unwrap();

        let (received, peer) = a.map(|r| r.unwrap()).next().await.unwrap();
        assert_eq!(received.header.message_id, 77);
        assert_eq!(received.payload, b"hi".to_vec());
        assert_eq!(peer, b.local_addrs()[0]);
    }

    #[tokio::test]
    async fn test_dual_stack_binds_both_families() {
        let Ok(binding) = UdpTransport::dual_stack("127.0.0.1:0", "[::1]:0").bind().await else {
            // Host without IPv6 loopback; nothing to assert.
            return;
        };
        let addrs = binding.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
    }
}
