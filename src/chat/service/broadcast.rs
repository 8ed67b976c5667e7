//! Subscriber set with optional bounded history.

use std::collections::VecDeque;

use super::{ConnectionId, Responder};

/// Fans a message out to every subscriber, in subscription order.
///
/// Delivery is best effort: a subscriber whose connection is gone is evicted
/// and the broadcast carries on with the rest.
#[derive(Debug, Default)]
pub struct Broadcaster {
    subscribers: Vec<Responder>,
    history: VecDeque<Vec<u8>>,
    history_len: usize,
}

impl Broadcaster {
    /// `history_len` of zero keeps no history.
    pub fn new(history_len: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            history: VecDeque::with_capacity(history_len),
            history_len,
        }
    }

    pub fn is_subscribed(&self, connection: ConnectionId) -> bool {
        self.subscribers
            .iter()
            .any(|s| s.connection() == connection)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Buffered payloads, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &[u8]> {
        self.history.iter().map(Vec::as_slice)
    }

    /// Adds a subscriber and replays the history to it.
    ///
    /// Returns false if the subscriber was already present or its connection
    /// closed during the replay.
    pub async fn subscribe(&mut self, responder: Responder, message_name: &str) -> bool {
        if self.is_subscribed(responder.connection()) {
            return false;
        }
        for payload in &self.history {
            if let Err(e) = responder.reply(message_name, payload.clone()).await {
                tracing::debug!(error = %e, "History replay failed, not subscribing");
                return false;
            }
        }
        tracing::debug!(connection = %responder.connection(), "Subscribed");
        self.subscribers.push(responder);
        true
    }

    pub fn unsubscribe(&mut self, connection: ConnectionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.connection() != connection);
        before != self.subscribers.len()
    }

    /// Appends to the history, evicting the oldest entry when full.
    pub fn record(&mut self, payload: Vec<u8>) {
        if self.history_len == 0 {
            return;
        }
        while self.history.len() >= self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(payload);
    }

    /// Sends to every subscriber. Returns the number of successful deliveries.
    pub async fn broadcast(&mut self, message_name: &str, payload: &[u8]) -> usize {
        let mut failed = Vec::new();
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.reply(message_name, payload.to_vec()).await {
                tracing::debug!(error = %e, "Delivery failed, evicting subscriber");
                failed.push(subscriber.connection());
            }
        }

        self.subscribers
            .retain(|s| !failed.contains(&s.connection()));
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::service::test_support::responder;
    use crate::chat::service::Outbound;

    fn payload_of(outbound: Option<Outbound>) -> Vec<u8> {
        match outbound {
            Some(Outbound::Message { payload, .. }) => payload,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_broadcast() {
        let mut room = Broadcaster::new(0);
        let (alice, mut alice_rx) = responder(4);

        assert!(room.subscribe(alice, "ChatRoomMessage").await);
        assert_eq!(room.broadcast("ChatRoomMessage", b"m").await, 1);
        assert_eq!(payload_of(alice_rx.recv().await), b"m");
    }

    #[tokio::test]
    async fn test_failed_subscriber_is_evicted() {
        let mut room = Broadcaster::new(0);
        let (alice, mut alice_rx) = responder(4);
        let (bob, bob_rx) = responder(4);
        let bob_id = bob.connection();

        room.subscribe(alice, "ChatRoomMessage").await;
        room.subscribe(bob, "ChatRoomMessage").await;
        drop(bob_rx);

        assert_eq!(room.broadcast("ChatRoomMessage", b"first").await, 1);
        assert!(!room.is_subscribed(bob_id));
        assert_eq!(room.subscriber_count(), 1);

        assert_eq!(room.broadcast("ChatRoomMessage", b"second").await, 1);
        assert_eq!(payload_of(alice_rx.recv().await), b"first");
        assert_eq!(payload_of(alice_rx.recv().await), b"second");
    }

    #[tokio::test]
    async fn test_delivery_in_subscription_order() {
        let mut room = Broadcaster::new(0);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let first = Responder::new(ConnectionId::new(), tx.clone());
        let second = Responder::new(ConnectionId::new(), tx);
        let first_id = first.connection();

        room.subscribe(first, "x").await;
        room.subscribe(second, "x").await;
        room.broadcast("x", b"m").await;

        // Both share one queue here, so order of arrival is order of delivery.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert_eq!(room.subscribers[0].connection(), first_id);
    }

    #[tokio::test]
    async fn test_history_replayed_and_bounded() {
        let mut bot = Broadcaster::new(3);
        for i in 0..5u8 {
            bot.record(vec![i]);
        }
        assert_eq!(
            bot.history().map(<[u8]>::to_vec).collect::<Vec<_>>(),
            vec![vec![2u8], vec![3], vec![4]]
        );

        let (carol, mut carol_rx) = responder(8);
        assert!(bot.subscribe(carol, "ChatBotMessage").await);
        for expected in 2..5u8 {
            assert_eq!(payload_of(carol_rx.recv().await), vec![expected]);
        }
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_ignored() {
        let mut room = Broadcaster::new(0);
        let (alice, _rx) = responder(4);
        assert!(room.subscribe(alice.clone(), "x").await);
        assert!(!room.subscribe(alice, "x").await);
        assert_eq!(room.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let mut room = Broadcaster::new(0);
        let (alice, _rx) = responder(4);
        let id = alice.connection();
        room.subscribe(alice, "x").await;
        assert!(room.unsubscribe(id));
        assert!(!room.unsubscribe(id));
        assert_eq!(room.broadcast("x", b"m").await, 0);
    }
}
