//! One managed connection to a single chat channel.
//!
//! The session is the only consumer of its [`MessageQueue`]. [`Session::run`]
//! pulls one message, passes it through the throughput governor, writes it
//! and only then asks for the next one, so lines reach the socket in enqueue
//! order and never in parallel.
//!
//! Transport failures feed a reconnect state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (send fails)
//!      -> Reconnecting (backoff) -> Connecting -> ...
//! any state -> Closed (terminal, via close())
//! ```
//!
//! While sending is disallowed (a reconnect is in flight, or an operator
//! flagged the account) the consumer parks on the current message instead of
//! dropping it; everything behind it stays queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::adapter::{Adapter, CLOSE_NORMAL, Connector};
use crate::backoff::Backoff;
use crate::config::LiveConfig;
use crate::error::{QueueError, SessionError, TransportError};
use crate::irc;
use crate::queue::{Message, MessageQueue, Subscription};
use crate::throttle::{Admission, Throttle};

/// Connectivity of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: ConnState,
    sending_allowed: bool,
}

/// Checks whether the account's credential is in a state that lets it chat.
///
/// Consulted on each reminder tick; implementations usually cache the result
/// of a token validation call.
pub trait CredentialValidator: Send + Sync {
    fn has_inconsistencies(&self, bot_name: &str) -> bool;

    /// Log details about the inconsistencies found.
    fn report_inconsistencies(&self, _bot_name: &str) {}
}

/// Non-blocking reconnect guard. Released on drop.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl<'a> ReconnectGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Session {
    channel: String,
    bot_name: String,
    credential: RwLock<String>,
    connector: Arc<dyn Connector>,
    config: LiveConfig,
    validator: Option<Arc<dyn CredentialValidator>>,

    adapter: RwLock<Option<Arc<dyn Adapter>>>,
    status: watch::Sender<Status>,
    closed: AtomicBool,
    reconnecting: AtomicBool,

    queue: MessageQueue,
    subscription: Mutex<Option<Subscription>>,
    throttle: Mutex<Throttle>,
    backoff: Mutex<Backoff>,
    next_reminder: Mutex<Instant>,
}

impl Session {
    pub fn new(
        channel: impl Into<String>,
        bot_name: impl Into<String>,
        credential: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: LiveConfig,
    ) -> Self {
        let snapshot = config.snapshot();
        let (queue, subscription) = MessageQueue::channel();
        let (status, _) = watch::channel(Status {
            state: ConnState::Disconnected,
            sending_allowed: true,
        });
        Self {
            channel: channel.into().trim_start_matches('#').to_lowercase(),
            bot_name: bot_name.into(),
            credential: RwLock::new(credential.into()),
            connector,
            config,
            validator: None,
            adapter: RwLock::new(None),
            status,
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            queue,
            subscription: Mutex::new(Some(subscription)),
            throttle: Mutex::new(Throttle::new()),
            backoff: Mutex::new(Backoff::new(snapshot.min_backoff(), snapshot.max_backoff())),
            next_reminder: Mutex::new(Instant::now()),
        }
    }

    pub fn with_credential_validator(mut self, validator: Arc<dyn CredentialValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub fn state(&self) -> ConnState {
        self.status.borrow().state
    }

    pub fn is_sending_allowed(&self) -> bool {
        self.status.borrow().sending_allowed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Producer handle for this session's queue.
    pub fn outbox(&self) -> MessageQueue {
        self.queue.clone()
    }

    pub fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        self.queue.enqueue(message)
    }

    /// Queue a chat line for the channel.
    pub fn say(&self, text: impl Into<String>) -> Result<(), QueueError> {
        self.queue.say(text)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Current reconnect delay.
    pub fn backoff_interval(&self) -> Duration {
        self.backoff.lock().peek_interval()
    }

    /// Writes counted in the current rate-limit window.
    pub fn window_writes(&self) -> u32 {
        self.throttle.lock().writes()
    }

    /// Update the credential and hand it to the live connection. No
    /// reconnect is needed; the next connect uses it too.
    pub fn set_credential(&self, credential: impl Into<String>) {
        let credential = credential.into();
        if let Some(adapter) = self.adapter.read().as_ref() {
            adapter.set_credential(&credential);
        }
        *self.credential.write() = credential;
    }

    /// Allow or disallow sending. A consumer holding a message waits while
    /// sending is disallowed.
    pub fn set_allow_send_messages(&self, allowed: bool) {
        self.status.send_if_modified(|s| {
            if s.state == ConnState::Closed || s.sending_allowed == allowed {
                return false;
            }
            s.sending_allowed = allowed;
            true
        });
    }

    fn set_state(&self, state: ConnState) {
        self.status.send_if_modified(|s| {
            if s.state == ConnState::Closed || s.state == state {
                return false;
            }
            s.state = state;
            true
        });
    }

    /// Open a new connection, replacing any previous one. Failures are
    /// logged and leave the session disconnected.
    pub async fn connect(&self) -> &Self {
        if self.is_closed() {
            return self;
        }
        self.set_state(ConnState::Connecting);
        let credential = self.credential.read().clone();
        let opened = self
            .connector
            .open(&self.channel, &self.bot_name, &credential)
            .await;

        let adapter: Arc<dyn Adapter> = match opened {
            Ok(adapter) => Arc::from(adapter),
            Err(e) => {
                tracing::error!(channel = %self.channel, error = %e, "Failed to connect to chat");
                self.set_state(ConnState::Disconnected);
                return self;
            }
        };

        // `None`: the session closed while we were connecting.
        let installed = {
            let mut slot = self.adapter.write();
            if self.is_closed() {
                None
            } else {
                Some(slot.replace(adapter.clone()))
            }
        };
        match installed {
            None => {
                adapter.close(CLOSE_NORMAL, "session closed").await;
                return self;
            }
            Some(Some(old)) => old.close(CLOSE_NORMAL, "replaced").await,
            Some(None) => {}
        }
        if adapter.is_live() {
            self.set_state(ConnState::Connected);
            tracing::info!(channel = %self.channel, bot = %self.bot_name, "Connected to chat");
        } else {
            tracing::warn!(channel = %self.channel, "Connection opened but handshake still pending");
        }
        self
    }

    /// Send a chat line to the channel right away, bypassing the queue.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        self.send_raw(&irc::privmsg(&self.channel, text)).await
    }

    /// Ask the platform for the channel's moderator list.
    pub async fn request_moderation_status(&self) -> Result<(), SessionError> {
        self.send("/mods").await
    }

    /// Write a protocol line, with at most one retry.
    ///
    /// `NotConnected` is retried once after a grace period. `Disconnected`
    /// triggers a reconnect and one retry. Anything else, and any second
    /// failure, is reported and the line dropped.
    pub async fn send_raw(&self, line: &str) -> Result<(), SessionError> {
        let err = match self.try_send(line).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match err {
            TransportError::NotConnected => {
                let grace = self.config.not_connected_grace();
                tracing::warn!(
                    channel = %self.channel,
                    "Tried to send before connecting, trying again in {}s",
                    grace.as_secs_f64()
                );
                self.pause(grace).await?;
            }
            TransportError::Disconnected => {
                tracing::warn!(
                    channel = %self.channel,
                    "Tried to send after the connection dropped, reconnecting"
                );
                self.reconnect().await;
                self.wait_until_sendable().await?;
            }
            other => {
                tracing::error!(
                    channel = %self.channel,
                    error = %other,
                    "Failed to send message [{}]",
                    other.kind()
                );
                return Err(other.into());
            }
        }

        if let Err(e) = self.try_send(line).await {
            tracing::error!(
                channel = %self.channel,
                error = %e,
                "Failed to send message [{}], dropping it",
                e.kind()
            );
            return Err(e.into());
        }
        Ok(())
    }

    async fn try_send(&self, line: &str) -> Result<(), TransportError> {
        let adapter = self.adapter.read().clone();
        match adapter {
            Some(adapter) => {
                adapter.send(line).await?;
                self.backoff.lock().reset();
                // A connection that finished its handshake after connect().
                self.status.send_if_modified(|s| {
                    let promote = s.state == ConnState::Connecting;
                    if promote {
                        s.state = ConnState::Connected;
                    }
                    promote
                });
                Ok(())
            }
            // Never connected, or the last connect failed: reconnect.
            None => Err(TransportError::Disconnected),
        }
    }

    /// Replace the connection after a failure.
    ///
    /// Only one reconnect runs at a time; a caller that finds one already in
    /// flight returns `false` immediately and relies on it. Returns `true`
    /// if this call ran the sequence.
    pub async fn reconnect(&self) -> bool {
        self.set_allow_send_messages(false);
        if self.is_closed() {
            return false;
        }
        let Some(guard) = ReconnectGuard::try_acquire(&self.reconnecting) else {
            tracing::debug!(channel = %self.channel, "Reconnect already in progress");
            return false;
        };

        self.set_state(ConnState::Reconnecting);
        let delay = self.backoff.lock().advance();
        tracing::info!(
            channel = %self.channel,
            delay_ms = delay.as_millis() as u64,
            "Delaying next reconnect {}s to prevent spam",
            delay.as_secs_f64()
        );

        let outcome = self.reconnect_steps(delay).await;
        // Release before sends resume so a late caller can run its own reconnect.
        drop(guard);
        match outcome {
            Ok(()) => self.set_allow_send_messages(true),
            Err(e) => tracing::error!(
                channel = %self.channel,
                error = %e,
                "Reconnect interrupted, sending stays disabled"
            ),
        }
        true
    }

    async fn reconnect_steps(&self, delay: Duration) -> Result<(), SessionError> {
        self.pause(delay).await?;
        self.quit_irc().await;
        self.pause(self.config.reconnect_pause()).await?;
        self.connect().await;
        self.pause(self.config.reconnect_pause()).await
    }

    /// Send `QUIT`, give it a moment to flush, then close the socket.
    pub async fn quit_irc(&self) {
        let adapter = self.adapter.write().take();
        let Some(adapter) = adapter else {
            return;
        };
        if let Err(e) = adapter.send(irc::QUIT).await {
            tracing::debug!(channel = %self.channel, error = %e, "QUIT not delivered");
        }
        tokio::time::sleep(self.config.quit_flush()).await;
        adapter.close(CLOSE_NORMAL, "bye").await;
        self.set_state(ConnState::Disconnected);
    }

    /// Shut the session down for good: stop the queue, quit, release the
    /// connection. Pending messages are discarded.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let discarded = self.queue.close();
        self.status.send_modify(|s| {
            s.state = ConnState::Closed;
            s.sending_allowed = false;
        });
        self.quit_irc().await;
        tracing::info!(channel = %self.channel, discarded, "Chat session closed");
    }

    /// Consume the queue until it terminates. Call once; later calls return
    /// immediately.
    pub async fn run(&self) {
        let Some(mut subscription) = self.subscription.lock().take() else {
            tracing::warn!(channel = %self.channel, "Queue consumer already started");
            return;
        };
        subscription.request(1);
        while let Some(message) = subscription.next().await {
            self.on_next(message).await;
            subscription.request(1);
        }
        self.on_complete().await;
    }

    async fn on_next(&self, message: Message) {
        let delivered = async {
            self.wait_until_sendable().await?;
            self.admit(&message).await?;
            self.send(message.content()).await
        }
        .await;

        match delivered {
            Ok(()) => tracing::debug!(channel = %self.channel, "[CHAT] {}", message.content()),
            Err(SessionError::Closed | SessionError::InterruptedWait) => {
                tracing::debug!(channel = %self.channel, "Message not sent, session closing")
            }
            // Already reported by send_raw.
            Err(SessionError::Transport(_)) => {}
        }
        self.remind_if_due();
    }

    async fn on_complete(&self) {
        self.close().await;
    }

    /// Apply the throughput governor, sleeping until the line may go out.
    async fn admit(&self, message: &Message) -> Result<(), SessionError> {
        loop {
            let policy = self.config.rate_policy();
            let verdict = self
                .throttle
                .lock()
                .check(Instant::now(), message.has_priority(), policy);
            match verdict {
                Admission::Now => return Ok(()),
                Admission::Wait(delay) => {
                    tracing::warn!(
                        channel = %self.channel,
                        limit = policy.limit,
                        "Message limit of ({}) has been reached. Messages will be sent again in {}ms",
                        policy.limit,
                        delay.as_millis()
                    );
                    self.pause(delay).await?;
                }
            }
        }
    }

    /// Park until sending is allowed, warning on every reminder interval.
    async fn wait_until_sendable(&self) -> Result<(), SessionError> {
        let mut rx = self.status.subscribe();
        loop {
            let interval = self.config.reminder_interval();
            let ready = tokio::time::timeout(
                interval,
                rx.wait_for(|s| s.sending_allowed || s.state == ConnState::Closed),
            )
            .await
            .map(|r| r.map(|s| s.state));
            match ready {
                Ok(Ok(ConnState::Closed)) | Ok(Err(_)) => return Err(SessionError::Closed),
                Ok(Ok(_)) => return Ok(()),
                Err(_) => self.remind_if_due(),
            }
        }
    }

    fn remind_if_due(&self) {
        let now = Instant::now();
        {
            let mut next = self.next_reminder.lock();
            if now < *next {
                return;
            }
            *next = now + self.config.reminder_interval();
        }

        let allowed = self.is_sending_allowed();
        let inconsistent = self
            .validator
            .as_ref()
            .is_some_and(|v| v.has_inconsistencies(&self.bot_name));
        if allowed && !inconsistent {
            return;
        }
        tracing::warn!(
            channel = %self.channel,
            "Unable to send last message due to configuration error"
        );
        if let Some(v) = &self.validator {
            v.report_inconsistencies(&self.bot_name);
        }
        if !allowed {
            tracing::warn!(channel = %self.channel, "May not be a moderator");
        }
    }

    /// Sleep that `close()` cuts short.
    async fn pause(&self, duration: Duration) -> Result<(), SessionError> {
        let mut rx = self.status.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = rx.wait_for(|s| s.state == ConnState::Closed) => Err(SessionError::InterruptedWait),
        }
    }
}
