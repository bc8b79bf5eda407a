use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, warn};

use crate::{
    codec::encode_frame,
    error::{ConnectionError, ValidationError},
    history::HistorySink,
    message::{Message, ServerFrame, validate_body},
    registry::{Registry, RegistryState, SessionId},
};

/// Outcome of one fanout.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<SessionId>,
    /// Recipients whose queue refused the frame. They have already been
    /// removed from the registry and closed.
    pub failed: Vec<(SessionId, ConnectionError)>,
}

/// Fans frames out to registered sessions.
///
/// Fanout runs under the registry lock and only enqueues frames, so a slow
/// recipient costs one failed `try_send`, never a wait. Message ids are
/// taken and history is written under the same lock, so ids, delivery
/// order and history order agree.
pub struct Router {
    registry: Arc<Registry>,
    echo_to_sender: bool,
    history: Option<Arc<dyn HistorySink>>,
    next_message_id: AtomicU64,
}

impl Router {
    pub fn new(registry: Arc<Registry>, echo_to_sender: bool) -> Self {
        Self {
            registry,
            echo_to_sender,
            history: None,
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    /// Numbers the next published message `first_id`.
    pub fn starting_at(self, first_id: u64) -> Self {
        Self {
            next_message_id: AtomicU64::new(first_id),
            ..self
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn history(&self) -> Option<&Arc<dyn HistorySink>> {
        self.history.as_ref()
    }

    /// Validates `body`, stamps it with the next message id and routes it.
    ///
    /// Rejected bodies never consume an id.
    pub async fn publish(
        &self,
        sender: SessionId,
        username: &str,
        body: String,
    ) -> Result<(Message, DeliveryReport), ValidationError> {
        validate_body(&body)?;

        let mut state = self.registry.lock().await;
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::new(id, username, body)?;
        let report = self.route_locked(&mut state, sender, &message).await;
        Ok((message, report))
    }

    /// Delivers a chat message to every session except the sender (unless
    /// echo is enabled), then offers it to the history sink.
    pub async fn route(&self, sender: SessionId, message: &Message) -> DeliveryReport {
        let mut state = self.registry.lock().await;
        self.route_locked(&mut state, sender, message).await
    }

    /// Delivers a control frame (presence, shutdown notice) to every
    /// session except `except`.
    pub async fn announce(&self, except: Option<SessionId>, frame: &ServerFrame) -> DeliveryReport {
        let mut state = self.registry.lock().await;
        fanout(&mut state, except, encode_frame(frame))
    }

    async fn route_locked(
        &self,
        state: &mut RegistryState,
        sender: SessionId,
        message: &Message,
    ) -> DeliveryReport {
        let except = (!self.echo_to_sender).then_some(sender);
        let frame = encode_frame(&ServerFrame::Message(message.clone()));
        let report = fanout(state, except, frame);

        debug!(
            message_id = message.id(),
            sender = %sender,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "message routed"
        );

        if let Some(history) = &self.history {
            if let Err(error) = history.record(message).await {
                warn!(message_id = message.id(), %error, "failed to record message history");
            }
        }

        report
    }
}

fn fanout(state: &mut RegistryState, except: Option<SessionId>, frame: Vec<u8>) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for session in state.sessions() {
        if Some(session.id()) == except {
            continue;
        }
        match session.handle().send(frame.clone()) {
            Ok(()) => report.delivered.push(session.id()),
            Err(error) => report.failed.push((session.id(), error)),
        }
    }

    for (id, error) in &report.failed {
        let Some(session) = state.remove(*id) else {
            continue;
        };
        match error {
            ConnectionError::Backpressure { .. } => {
                warn!(session = %id, username = session.username(), %error, "dropping recipient that cannot keep up")
            }
            _ => debug!(session = %id, %error, "dropping closed recipient"),
        }
        session.handle().close();
    }

    report
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::{io::DuplexStream, time::timeout};

    use super::*;
    use crate::{
        codec::{decode_server_frame, read_frame},
        config::ConnectionConfig,
        connection::Connection,
        error::StorageError,
    };

    struct Peer {
        id: SessionId,
        remote: DuplexStream,
        connection: Connection<DuplexStream>,
    }

    impl Peer {
        async fn next_frame(&mut self) -> ServerFrame {
            let payload = timeout(Duration::from_secs(1), read_frame(&mut self.remote, 4096))
                .await
                .expect("frame within a second")
                .expect("readable frame");
            decode_server_frame(&payload).expect("valid server frame")
        }

        async fn next_message(&mut self) -> Message {
            match self.next_frame().await {
                ServerFrame::Message(message) => message,
                other => panic!("expected a message frame, got {other:?}"),
            }
        }

        async fn assert_silent(&mut self) {
            let read = timeout(Duration::from_millis(100), read_frame(&mut self.remote, 4096)).await;
            assert!(read.is_err(), "expected no frame");
        }
    }

    async fn join(registry: &Registry, name: &str, pipe: usize, capacity: usize) -> Peer {
        let (local, remote) = tokio::io::duplex(pipe);
        let config = ConnectionConfig {
            max_frame_len: 4096,
            send_queue_capacity: capacity,
            send_timeout: Duration::from_secs(5),
        };
        let connection = Connection::new(local, name.to_string(), &config);
        let id = registry.add(name, connection.handle()).await.unwrap();
        Peer {
            id,
            remote,
            connection,
        }
    }

    fn message(id: u64, username: &str, body: &str) -> Message {
        Message::new(id, username, body).unwrap()
    }

    #[tokio::test]
    async fn sender_does_not_hear_itself_by_default() {
        let registry = Arc::new(Registry::new(false));
        let mut alice = join(&registry, "Alice", 4096, 8).await;
        let mut bob = join(&registry, "Bob", 4096, 8).await;
        let mut carol = join(&registry, "Carol", 4096, 8).await;
        let router = Router::new(Arc::clone(&registry), false);

        let sent = message(1, "Alice", "Hello, world!");
        let report = router.route(alice.id, &sent).await;

        assert_eq!(report.delivered, vec![bob.id, carol.id]);
        assert!(report.failed.is_empty());
        assert_eq!(bob.next_message().await, sent);
        assert_eq!(carol.next_message().await, sent);
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn echo_includes_sender() {
        let registry = Arc::new(Registry::new(false));
        let mut alice = join(&registry, "Alice", 4096, 8).await;
        let router = Router::new(Arc::clone(&registry), true);

        let sent = message(1, "Alice", "talking to myself");
        let report = router.route(alice.id, &sent).await;

        assert_eq!(report.delivered, vec![alice.id]);
        assert_eq!(alice.next_message().await, sent);
    }

    #[tokio::test]
    async fn one_senders_messages_arrive_in_order() {
        let registry = Arc::new(Registry::new(false));
        let alice = join(&registry, "Alice", 4096, 64).await;
        let mut bob = join(&registry, "Bob", 4096, 64).await;
        let router = Router::new(Arc::clone(&registry), false);

        for id in 1..=20 {
            router
                .route(alice.id, &message(id, "Alice", &format!("line {id}")))
                .await;
        }
        for id in 1..=20 {
            assert_eq!(bob.next_message().await.id(), id);
        }
    }

    #[tokio::test]
    async fn stalled_recipient_is_dropped_without_delaying_others() {
        let registry = Arc::new(Registry::new(false));
        let alice = join(&registry, "Alice", 4096, 8).await;
        // Never read from, with a pipe smaller than one frame and a tiny queue.
        let stalled = join(&registry, "Stalled", 16, 1).await;
        let mut bob = join(&registry, "Bob", 64 * 1024, 64).await;
        let router = Router::new(Arc::clone(&registry), false);

        let started = tokio::time::Instant::now();
        let mut failed = Vec::new();
        for id in 1..=10 {
            let report = router
                .route(alice.id, &message(id, "Alice", &format!("burst {id}")))
                .await;
            failed.extend(report.failed.into_iter().map(|(id, _)| id));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(failed, vec![stalled.id]);
        for id in 1..=10 {
            assert_eq!(bob.next_message().await.id(), id);
        }

        let remaining: Vec<_> = registry.snapshot().await.iter().map(|s| s.id()).collect();
        assert_eq!(remaining, vec![alice.id, bob.id]);
        assert!(stalled.connection.handle().is_closed());
    }

    #[tokio::test]
    async fn announce_skips_the_excluded_session() {
        let registry = Arc::new(Registry::new(false));
        let mut alice = join(&registry, "Alice", 4096, 8).await;
        let mut bob = join(&registry, "Bob", 4096, 8).await;
        let router = Router::new(Arc::clone(&registry), false);

        let frame = ServerFrame::Joined {
            username: "Bob".into(),
        };
        router.announce(Some(bob.id), &frame).await;

        assert_eq!(alice.next_frame().await, frame);
        bob.assert_silent().await;
    }

    struct BrokenSink;

    #[async_trait]
    impl HistorySink for BrokenSink {
        async fn record(&self, _message: &Message) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }
    }

    #[tokio::test]
    async fn history_failure_does_not_stop_delivery() {
        let registry = Arc::new(Registry::new(false));
        let alice = join(&registry, "Alice", 4096, 8).await;
        let mut bob = join(&registry, "Bob", 4096, 8).await;
        let router = Router::new(Arc::clone(&registry), false).with_history(Arc::new(BrokenSink));

        let sent = message(1, "Alice", "still delivered");
        let report = router.route(alice.id, &sent).await;

        assert_eq!(report.delivered, vec![bob.id]);
        assert_eq!(bob.next_message().await, sent);
    }

    #[tokio::test]
    async fn published_ids_reach_each_recipient_in_increasing_order() {
        let registry = Arc::new(Registry::new(false));
        let alice = join(&registry, "Alice", 64 * 1024, 256).await;
        let bob = join(&registry, "Bob", 64 * 1024, 256).await;
        let mut carol = join(&registry, "Carol", 64 * 1024, 256).await;
        let router = Arc::new(Router::new(Arc::clone(&registry), false));

        let mut tasks = Vec::new();
        for (id, name) in [(alice.id, "Alice"), (bob.id, "Bob")] {
            let router = Arc::clone(&router);
            tasks.push(tokio::spawn(async move {
                for n in 0..50 {
                    router.publish(id, name, format!("{name} says {n}")).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..100 {
            let id = carol.next_message().await.id();
            assert!(id > last, "id {id} arrived after {last}");
            last = id;
        }
    }

    #[tokio::test]
    async fn rejected_body_does_not_consume_an_id() {
        let registry = Arc::new(Registry::new(false));
        let alice = join(&registry, "Alice", 4096, 8).await;
        let mut bob = join(&registry, "Bob", 4096, 8).await;
        let router = Router::new(Arc::clone(&registry), false).starting_at(40);

        assert!(matches!(
            router.publish(alice.id, "Alice", "x".into()).await,
            Err(ValidationError::BodyTooShort(1))
        ));
        let (message, _) = router.publish(alice.id, "Alice", "ok then".into()).await.unwrap();

        assert_eq!(message.id(), 40);
        assert_eq!(bob.next_message().await, message);
    }
}
