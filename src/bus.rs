//! A thin abstraction over the message bus.
//!
//! [`Bus`] exposes exactly the primitives the chunking codec and worker pool
//! need: `publish`, `request`, `respond`, a queue-subscribed stream of
//! inbound commands, ephemeral-inbox allocation, and the server's advertised
//! `max_payload`. [`NatsBus`] is the production implementation over
//! `async-nats`; tests use [`bus::mock::MockBus`](mock::MockBus) instead of
//! standing up a real server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Error, Result};

/// A message as exchanged at the bus boundary.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    pub reply_subject: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reply_subject: None,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// A subscription to a subject, yielding messages published on it.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Await the next message, or `None` once the subscription is closed.
    /// `Err(Error::Timeout)` if `deadline` elapses first.
    async fn next(&mut self, deadline: Duration) -> Result<Option<Message>>;

    /// Release the subscription. Implementations must be safe to drop
    /// without calling this, but calling it makes teardown deterministic.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Thin abstraction over the publish/subscribe message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish; used for the final fragment of a chunked
    /// reply and for acks.
    async fn publish(&self, msg: Message) -> Result<()>;

    /// Publish `msg` and await the reply, or `Error::Timeout` if `deadline`
    /// elapses first.
    async fn request(&self, msg: Message, deadline: Duration) -> Result<Message>;

    /// Reply to a previously received message.
    async fn respond(&self, orig: &Message, reply: Message) -> Result<()>;

    /// Queue-subscribe to `subject` under `queue_group` for bus-side load
    /// balancing.
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>>;

    /// Subscribe to a fresh ephemeral, bus-allocated subject.
    async fn new_inbox_subscription(&self) -> Result<(String, Box<dyn Subscription>)>;

    /// The server's advertised per-message payload ceiling, in bytes.
    fn max_payload(&self) -> usize;
}

/// Production [`Bus`] implementation backed by `async-nats`.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to `url`, optionally authenticating with a credentials file,
    /// and verify the server's advertised `max_payload` meets `min_max_payload`
    ///.
    pub async fn connect(
        url: &str,
        credentials_path: Option<&std::path::Path>,
        min_max_payload: usize,
    ) -> Result<Self> {
        let mut opts = async_nats::ConnectOptions::new();
        if let Some(path) = credentials_path {
            opts = opts
                .credentials_file(path)
                .await
                .map_err(|e| Error::Bus(format!("credentials file: {e}")))?;
        }
        let client = opts
            .connect(url)
            .await
            .map_err(|e| Error::Bus(format!("connect: {e}")))?;

        let max_payload = client.server_info().max_payload;
        if max_payload < min_max_payload {
            return Err(Error::Bus(format!(
                "server max_payload {max_payload} is below required minimum {min_max_payload}"
            )));
        }
        Ok(Self { client })
    }

    fn to_nats_headers(headers: &HashMap<String, String>) -> async_nats::HeaderMap {
        let mut out = async_nats::HeaderMap::new();
        for (k, v) in headers {
            out.insert(k.as_str(), v.as_str());
        }
        out
    }

    fn from_nats_message(msg: async_nats::Message) -> Message {
        let mut headers = HashMap::new();
        if let Some(h) = &msg.headers {
            for name in h.keys() {
                if let Some(value) = h.get(name) {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }
        Message {
            subject: msg.subject.to_string(),
            reply_subject: msg.reply.map(|s| s.to_string()),
            headers,
            body: msg.payload.to_vec(),
        }
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, msg: Message) -> Result<()> {
        self.client
            .publish_with_headers(
                msg.subject,
                Self::to_nats_headers(&msg.headers),
                msg.body.into(),
            )
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(())
    }

    async fn request(&self, msg: Message, deadline: Duration) -> Result<Message> {
        let request = async_nats::Request::new()
            .headers(Self::to_nats_headers(&msg.headers))
            .payload(msg.body.into())
            .timeout(Some(deadline));
        let reply = self
            .client
            .send_request(msg.subject, request)
            .await
            .map_err(|e| match e.kind() {
                async_nats::RequestErrorKind::TimedOut => Error::Timeout,
                _ => Error::Bus(e.to_string()),
            })?;
        Ok(Self::from_nats_message(reply))
    }

    async fn respond(&self, orig: &Message, reply: Message) -> Result<()> {
        let subject = orig
            .reply_subject
            .clone()
            .ok_or_else(|| Error::Protocol("message carries no reply subject".into()))?;
        self.client
            .publish_with_headers(subject, Self::to_nats_headers(&reply.headers), reply.body.into())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>> {
        let sub = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(Box::new(NatsSubscription { inner: sub }))
    }

    async fn new_inbox_subscription(&self) -> Result<(String, Box<dyn Subscription>)> {
        let inbox = self.client.new_inbox();
        let sub = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok((inbox, Box::new(NatsSubscription { inner: sub })))
    }

    fn max_payload(&self) -> usize {
        self.client.server_info().max_payload
    }
}

struct NatsSubscription {
    inner: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self, deadline: Duration) -> Result<Option<Message>> {
        use futures::StreamExt;
        match tokio::time::timeout(deadline, self.inner.next()).await {
            Ok(Some(msg)) => Ok(Some(NatsBus::from_nats_message(msg))),
            Ok(None) => Ok(None),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.inner
            .unsubscribe()
            .await
            .map_err(|e| Error::Bus(e.to_string()))
    }
}

/// An in-process fake bus for unit tests.
///
/// Mirrors NATS's own request/reply model: `request` allocates a private
/// reply inbox, stamps it onto the outgoing message's `reply_subject`, and
/// awaits a single reply registered against that inbox; `publish` and
/// `respond` are plain subject-addressed sends with no implicit waiting.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, oneshot};

    #[derive(Clone)]
    pub struct MockBus {
        max_payload: usize,
        routes: Arc<dashmap::DashMap<String, mpsc::Sender<Message>>>,
        replies: Arc<dashmap::DashMap<String, oneshot::Sender<Message>>>,
        inbox_counter: Arc<AtomicUsize>,
    }

    impl MockBus {
        pub fn new(max_payload: usize) -> Self {
            Self {
                max_payload,
                routes: Arc::new(dashmap::DashMap::new()),
                replies: Arc::new(dashmap::DashMap::new()),
                inbox_counter: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn fresh_subject(&self, prefix: &str) -> String {
            let n = self.inbox_counter.fetch_add(1, Ordering::Relaxed);
            format!("{prefix}.{n}")
        }
    }

    #[async_trait]
    impl Bus for MockBus {
        async fn publish(&self, msg: Message) -> Result<()> {
            if let Some(route) = self.routes.get(&msg.subject) {
                let _ = route.send(msg).await;
            }
            Ok(())
        }

        async fn request(&self, mut msg: Message, deadline: Duration) -> Result<Message> {
            let route = self
                .routes
                .get(&msg.subject)
                .ok_or_else(|| Error::Bus(format!("no subscriber on {}", msg.subject)))?
                .clone();
            let reply_key = self.fresh_subject("_REPLY");
            let (tx, rx) = oneshot::channel();
            self.replies.insert(reply_key.clone(), tx);
            msg.reply_subject = Some(reply_key.clone());
            route
                .send(msg)
                .await
                .map_err(|_| Error::Bus("subscriber gone".into()))?;
            let reply = tokio::time::timeout(deadline, rx).await.map_err(|_| {
                self.replies.remove(&reply_key);
                Error::Timeout
            })?;
            reply.map_err(|_| Error::Bus("subscriber dropped without replying".into()))
        }

        async fn respond(&self, orig: &Message, reply: Message) -> Result<()> {
            let subject = orig
                .reply_subject
                .clone()
                .ok_or_else(|| Error::Protocol("message carries no reply subject".into()))?;
            if let Some((_, tx)) = self.replies.remove(&subject) {
                let _ = tx.send(reply);
            }
            Ok(())
        }

        async fn queue_subscribe(
            &self,
            subject: &str,
            _queue_group: &str,
        ) -> Result<Box<dyn Subscription>> {
            let (tx, rx) = mpsc::channel(64);
            self.routes.insert(subject.to_string(), tx);
            Ok(Box::new(MockSubscription { rx }))
        }

        async fn new_inbox_subscription(&self) -> Result<(String, Box<dyn Subscription>)> {
            let subject = self.fresh_subject("_INBOX");
            let (tx, rx) = mpsc::channel(64);
            self.routes.insert(subject.clone(), tx);
            Ok((subject, Box::new(MockSubscription { rx })))
        }

        fn max_payload(&self) -> usize {
            self.max_payload
        }
    }

    struct MockSubscription {
        rx: mpsc::Receiver<Message>,
    }

    #[async_trait]
    impl Subscription for MockSubscription {
        async fn next(&mut self, deadline: Duration) -> Result<Option<Message>> {
            match tokio::time::timeout(deadline, self.rx.recv()).await {
                Ok(msg) => Ok(msg),
                Err(_) => Err(Error::Timeout),
            }
        }

        async fn unsubscribe(&mut self) -> Result<()> {
            self.rx.close();
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;

        #[tokio::test]
        async fn request_reply_round_trips() {
            let bus = MockBus::new(1_000_000);
            let mut sub = bus.queue_subscribe("cmd", "workers").await.unwrap();

            let server = {
                let bus = bus.clone();
                tokio::spawn(async move {
                    let msg = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
                    let reply = Message::new("_unused").with_body(b"pong".to_vec());
                    bus.respond(&msg, reply).await.unwrap();
                })
            };

            let req = Message::new("cmd").with_body(b"ping".to_vec());
            let reply = bus.request(req, Duration::from_secs(1)).await.unwrap();
            assert_eq!(reply.body, b"pong");
            server.await.unwrap();
        }

        #[tokio::test]
        async fn request_times_out_without_a_reply() {
            let bus = MockBus::new(1_000_000);
            let mut sub = bus.queue_subscribe("cmd", "workers").await.unwrap();
            let _keep_alive = tokio::spawn(async move {
                let _ = sub.next(Duration::from_secs(1)).await;
                // never replies
            });

            let req = Message::new("cmd").with_body(b"ping".to_vec());
            let result = bus.request(req, Duration::from_millis(50)).await;
            assert!(matches!(result, Err(Error::Timeout)));
        }

        #[tokio::test]
        async fn publish_delivers_without_waiting_for_a_reply() {
            let bus = MockBus::new(1_000_000);
            let mut sub = bus.new_inbox_subscription().await.unwrap();
            bus.publish(Message::new(sub.0.clone()).with_body(b"x".to_vec()))
                .await
                .unwrap();
            let msg = sub.1.next(Duration::from_secs(1)).await.unwrap().unwrap();
            assert_eq!(msg.body, b"x");
        }
    }
}
