use std::net::SocketAddr;
use std::ops::Deref;

use coap_lite::{MessageType, Packet};
use hashbrown::HashMap;
use log::debug;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::time;

use crate::client::config::TransmissionParameters;
use crate::client::exchange::{KeyId, TokenKey};
use crate::endpoint::Outgoing;

/// Applies appropriate ack timeouts and retry policies for Confirmable messages that are
/// sent through it.
pub(crate) struct RetransmissionManager {
    pending_replies: HashMap<KeyId, ReplyHandle>,
    parameters: TransmissionParameters,
}

struct ReplyHandle {
    reply_tx: watch::Sender<ReplyEvent>,
}

#[derive(Debug, Clone)]
enum ReplyEvent {
    None,
    PeerResponse(MessageType),
    Canceled,
    InternalError(String),
}

impl RetransmissionManager {
    pub fn new(parameters: TransmissionParameters) -> Self {
        Self {
            pending_replies: Default::default(),
            parameters,
        }
    }

    /// Attempts to route the Acknowledgement or Reset message that we expect as a reply to
    /// our Confirmable send attempts.  Returns whether any in-flight send matched; the caller
    /// still owns the packet either way so piggybacked responses can continue through
    /// token matching.
    pub fn handle_reply(&mut self, packet: &Packet, peer: &SocketAddr) -> bool {
        match packet.header.get_type() {
            MessageType::Acknowledgement | MessageType::Reset => {}
            _ => return false,
        }
        let key = KeyId::new(packet, *peer);
        if let Some(handle) = self.pending_replies.remove(&key) {
            let _ = handle
                .reply_tx
                .send(ReplyEvent::PeerResponse(packet.header.get_type()));
            true
        } else {
            false
        }
    }

    /// Stop retransmitting without waiting for the peer, e.g. because the caller withdrew
    /// the request.  The in-flight [`SendReliably`] resolves with [`SendFailed::Canceled`].
    pub fn cancel(&mut self, key: &KeyId) -> bool {
        if let Some(handle) = self.pending_replies.remove(key) {
            let _ = handle.reply_tx.send(ReplyEvent::Canceled);
            true
        } else {
            false
        }
    }

    /// Drop the bookkeeping for a send that already resolved on its own (budget exhausted).
    pub fn forget(&mut self, key: &KeyId) {
        self.pending_replies.remove(key);
    }

    /// Long running send operation that will handle all the timeout and retry logic
    /// internally.  This design makes it trivial for each individual call to manage its own
    /// error behaviour without dealing with clumsy callbacks.
    ///
    /// The caller must have assigned the message ID already; the packet is sent verbatim on
    /// every attempt.
    pub fn send_reliably(
        &mut self,
        packet: Packet,
        peer: SocketAddr,
        packet_tx: UnboundedSender<Outgoing>,
        origin: Option<TokenKey>,
        max_retransmit: Option<usize>,
    ) -> SendReliably {
        let (reply_tx, reply_rx) = watch::channel(ReplyEvent::None);
        let handle = ReplyHandle { reply_tx };
        let key = KeyId::new(&packet, peer);
        if let Some(existing_send) = self.pending_replies.insert(key.clone(), handle) {
            let _ = existing_send
                .reply_tx
                .send(ReplyEvent::InternalError(format!(
                    "Re-used message key {key:?} by another send!"
                )));
        }

        SendReliably {
            packet,
            peer,
            packet_tx,
            origin,
            parameters: self.parameters,
            max_retransmit: max_retransmit.unwrap_or_else(|| self.parameters.max_retransmit()),
            reply_rx,
        }
    }
}

#[must_use = "don't forget to call into_future() and await it!"]
pub(crate) struct SendReliably {
    packet: Packet,
    peer: SocketAddr,
    packet_tx: UnboundedSender<Outgoing>,
    origin: Option<TokenKey>,
    parameters: TransmissionParameters,
    max_retransmit: usize,
    reply_rx: watch::Receiver<ReplyEvent>,
}

impl SendReliably {
    pub fn key(&self) -> KeyId {
        KeyId::new(&self.packet, self.peer)
    }

    pub async fn into_future(self) -> Result<(), SendFailed> {
        let mut next_timeout = rand::thread_rng().gen_range(self.parameters.ack_timeout_range());
        for attempt in 0..=self.max_retransmit {
            if attempt > 0 {
                let retransmits = attempt - 1;
                let message_id = self.packet.header.message_id;
                let peer = &self.peer;
                debug!("Attempting retransmission #{retransmits} of message ID {message_id} to {peer:?}");
            }
            self.packet_tx
                .send(Outgoing {
                    packet: self.packet.clone(),
                    peer: self.peer,
                    origin: self.origin.clone(),
                })
                .map_err(|e| anyhow::Error::msg(e.to_string()))?;
            let curr_timeout = next_timeout;
            next_timeout *= 2;
            loop {
                let mut reply_rx = self.reply_rx.clone();
                let timeout = time::sleep(curr_timeout);

                tokio::select! {
                    changed = reply_rx.changed() => {
                        if changed.is_err() {
                            return Err(SendFailed::InternalError("reply channel closed".to_string()));
                        }
                        match reply_rx.borrow().deref() {
                            ReplyEvent::None => {}
                            ReplyEvent::PeerResponse(t) if t == &MessageType::Acknowledgement => {
                                return Ok(());
                            }
                            ReplyEvent::PeerResponse(t) if t == &MessageType::Reset => {
                                return Err(SendFailed::Reset);
                            }
                            ReplyEvent::PeerResponse(t) => {
                                return Err(SendFailed::InternalError(format!("unexpected t={t:?}")));
                            }
                            ReplyEvent::Canceled => return Err(SendFailed::Canceled),
                            ReplyEvent::InternalError(e) => return Err(SendFailed::InternalError(e.to_owned())),
                        }
                    }
                    _ = timeout => break,
                }
            }
        }
        Err(SendFailed::NoReply(self.max_retransmit + 1))
    }
}

#[derive(Error, Debug)]
pub(crate) enum SendFailed {
    #[error("no remote reply after {0} attempts")]
    NoReply(usize),

    #[error("reset message received")]
    Reset,

    #[error("send canceled locally")]
    Canceled,

    #[error(transparent)]
    TransmissionError(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    InternalError(String),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coap_lite::{MessageType, Packet};
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::client::util::new_reset_message;

    fn test_peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn new_con_packet(message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.message_id = message_id;
        packet
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let ack_timeout = Duration::from_secs(5);
        let mut manager = RetransmissionManager::new(
            TransmissionParameters::new(ack_timeout, 1.0, 1).unwrap(),
        );
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();

        let sent_packet = new_con_packet(42);
        let result = manager
            .send_reliably(sent_packet, test_peer(), packet_tx, None, None)
            .into_future()
            .await;

        if let Err(SendFailed::NoReply(2)) = result {
        } else {
            panic!("Expected send failed!");
        }

        let received: Vec<_> = UnboundedReceiverStream::new(packet_rx).collect().await;

        assert_eq!(received.len(), 2);
        assert_eq!(received[0].packet.header.message_id, 42);
        assert_eq!(received[1].packet.header.message_id, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path() {
        let ack_timeout = Duration::from_secs(999);
        let mut manager = RetransmissionManager::new(
            TransmissionParameters::new(ack_timeout, 1.0, 0).unwrap(),
        );
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let sent_packet = new_con_packet(5);

        let mut ack_packet = Packet::new();
        ack_packet.header.set_type(MessageType::Acknowledgement);
        ack_packet.header.message_id = 5;

        let result = {
            let handle = manager.send_reliably(sent_packet, test_peer(), packet_tx, None, None);
            assert!(manager.handle_reply(&ack_packet, &test_peer()));
            handle.into_future().await
        };

        result.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let ack_timeout = Duration::from_secs(5);
        let mut manager = RetransmissionManager::new(
            TransmissionParameters::new(ack_timeout, 1.0, 0).unwrap(),
        );
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let sent_packet = new_con_packet(5);
        let reset_packet = new_reset_message(&sent_packet);

        let result = {
            let handle = manager.send_reliably(sent_packet, test_peer(), packet_tx, None, None);
            assert!(manager.handle_reply(&reset_packet, &test_peer()));
            handle.into_future().await
        };

        if let Err(SendFailed::Reset) = result {
        } else {
            panic!("Expected send failed!");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let ack_timeout = Duration::from_secs(5);
        let mut manager = RetransmissionManager::new(
            TransmissionParameters::new(ack_timeout, 1.0, 4).unwrap(),
        );
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let sent_packet = new_con_packet(5);
        let handle = manager.send_reliably(sent_packet, test_peer(), packet_tx, None, None);
        assert!(manager.cancel(&handle.key()));

        if let Err(SendFailed::Canceled) = handle.into_future().await {
        } else {
            panic!("Expected canceled send!");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_request_retransmit_override() {
        let ack_timeout = Duration::from_secs(1);
        let mut manager = RetransmissionManager::new(
            TransmissionParameters::new(ack_timeout, 1.0, 4).unwrap(),
        );
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();

        let result = manager
            .send_reliably(new_con_packet(9), test_peer(), packet_tx, None, Some(2))
            .into_future()
            .await;

        if let Err(SendFailed::NoReply(3)) = result {
        } else {
            panic!("Expected three attempts, got {result:?}");
        }

        let received: Vec<_> = UnboundedReceiverStream::new(packet_rx).collect().await;
        assert_eq!(received.len(), 3);
    }
}
