use std::net::SocketAddr;
use std::sync::Arc;

use coap_lite::{MessageType, Packet};
use log::debug;
use tokio::sync::mpsc;

use crate::client::error::ClientError;
use crate::client::exchange::Exchange;
use crate::client::retransmission::SendFailed;
use crate::endpoint::EndpointInner;

/// Client handle on a long-running observation (RFC 7641).
///
/// Notifications surface as a stream via [`next`](Self::next), already filtered for
/// freshness, so no two are ever observed out of sequence.  Dropping the relation without
/// calling [`cancel`](Self::cancel) falls back to reactive cancellation: the next
/// notification from the peer is answered with Reset.
pub struct ObserveRelation {
    inner: Arc<EndpointInner>,
    exchange: Arc<Exchange>,
    peer: SocketAddr,
    notifications: mpsc::Receiver<Result<Packet, ClientError>>,
    current: Option<Packet>,
    canceled: bool,
}

impl ObserveRelation {
    pub(crate) fn new(
        inner: Arc<EndpointInner>,
        exchange: Arc<Exchange>,
        peer: SocketAddr,
        first_response: Packet,
        notifications: mpsc::Receiver<Result<Packet, ClientError>>,
    ) -> Self {
        Self {
            inner,
            exchange,
            peer,
            notifications,
            current: Some(first_response),
            canceled: false,
        }
    }

    /// Most recent representation delivered, starting with the registration response.
    pub fn current(&self) -> Option<&Packet> {
        self.current.as_ref()
    }

    /// Whether the server actually accepted the registration; a response without an
    /// Observe option means we hold a plain one-shot result instead of a relation.
    pub fn registered(&self) -> bool {
        self.current
            .as_ref()
            .map_or(false, |packet| packet.get_observe_value().is_some())
    }

    /// Await the next fresh notification.  Yields `None` once the relation is over (either
    /// canceled here or retired by the engine).
    pub async fn next(&mut self) -> Option<Result<Packet, ClientError>> {
        if self.canceled {
            return None;
        }
        let item = self.notifications.recv().await;
        if let Some(Ok(packet)) = &item {
            self.current = Some(packet.clone());
        }
        item
    }

    /// Proactively deregister: GET with Observe=1 on the relation's token, confirmably.
    /// Succeeds once the peer acknowledges (or has already reset the relation); times out
    /// like any other confirmable send, in which case reactive cancellation still applies.
    pub async fn cancel(mut self) -> Result<(), ClientError> {
        self.canceled = true;
        self.exchange.mark_observe_canceled();

        let mut deregister = self.exchange.request().clone();
        deregister.set_observe_value(1);
        deregister.header.message_id = self.inner.message_ids.next();
        deregister.header.set_type(MessageType::Confirmable);

        let handle = {
            let mut retransmissions = self.inner.retransmissions.lock().await;
            retransmissions.send_reliably(
                deregister,
                self.peer,
                self.inner.outgoing_tx.clone(),
                Some(self.exchange.key_token().clone()),
                None,
            )
        };
        let key = handle.key();
        match handle.into_future().await {
            // Acked; the confirming response (or the sweep) retires the exchange.
            Ok(()) => Ok(()),
            // The peer had already forgotten the relation, which is just as canceled.
            Err(SendFailed::Reset) => Ok(()),
            Err(SendFailed::Canceled) => Ok(()),
            Err(SendFailed::NoReply(_)) => {
                self.inner.retransmissions.lock().await.forget(&key);
                self.release();
                Err(ClientError::TimedOut)
            }
            Err(e) => {
                self.release();
                Err(ClientError::Transport(e.to_string()))
            }
        }
    }

    fn release(&self) {
        self.exchange.fail(ClientError::Canceled);
        self.inner.exchanges.remove(&self.exchange);
    }
}

impl Drop for ObserveRelation {
    fn drop(&mut self) {
        if !self.canceled && !self.exchange.is_completed() {
            debug!(
                "Observe relation {:?} dropped without cancel; future notifications will be rejected",
                self.exchange.key_token()
            );
            self.exchange.mark_observe_canceled();
        }
    }
}
