//! Reconnecting WebSocket channel, as a sans-IO state machine.
//!
//! [`ReconnectingChannel`] never touches a socket or sleeps. The driver feeds
//! it transport events (`handle_open`, `handle_close`, `handle_text`) and
//! calls [`ReconnectingChannel::tick`] at [`ReconnectingChannel::next_deadline`];
//! every call returns the [`Action`]s the driver must perform. Time comes from
//! an injected [`Clock`], so backoff and heartbeat run under a manual clock in
//! tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use relaydock_protocol::{ClientMessage, ServerMessage};

/// Error text surfaced for server frames that do not parse.
pub const INVALID_SERVER_MESSAGE: &str = "Invalid message from server";

const JITTER: f64 = 0.3;
/// Upper bound on any reconnect delay, whatever `max_delay` says.
const BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by tokio's timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reconnect, heartbeat and queue tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    /// Queued messages older than this are dropped instead of replayed
    pub queue_max_age: Duration,
    /// Oldest queued message is dropped beyond this many
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 10,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            queue_max_age: Duration::from_secs(30),
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    /// Waiting out a backoff delay
    Disconnected,
    /// Retries exhausted
    Failed,
    /// Closed by the application
    Closed,
}

/// Notification for the application
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Message(ServerMessage),
    Reconnecting { attempt: u32, delay: Duration },
    Failed,
    Closed,
}

/// What the driver must do next
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a new socket
    Connect,
    /// Send a text frame on the open socket
    Transmit(String),
    /// Close and forget the current socket
    DropSocket,
    Emit(ChannelEvent),
}

pub struct ReconnectingChannel<C: Clock> {
    config: ChannelConfig,
    clock: C,
    rng: StdRng,
    state: ChannelState,
    retry_count: u32,
    reconnect_at: Option<Instant>,
    next_ping_at: Option<Instant>,
    pong_deadline: Option<Instant>,
    queue: VecDeque<(Instant, String)>,
}

impl<C: Clock> ReconnectingChannel<C> {
    pub fn new(config: ChannelConfig, clock: C) -> Self {
        Self::with_rng(config, clock, StdRng::from_os_rng())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(config: ChannelConfig, clock: C, seed: u64) -> Self {
        Self::with_rng(config, clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ChannelConfig, clock: C, rng: StdRng) -> Self {
        Self {
            config,
            clock,
            rng,
            state: ChannelState::Idle,
            retry_count: 0,
            reconnect_at: None,
            next_ping_at: None,
            pong_deadline: None,
            queue: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn start(&mut self) -> Vec<Action> {
        match self.state {
            ChannelState::Idle | ChannelState::Failed => {
                self.retry_count = 0;
                self.state = ChannelState::Connecting;
                vec![Action::Connect]
            }
            _ => Vec::new(),
        }
    }

    /// The socket opened.
    pub fn handle_open(&mut self) -> Vec<Action> {
        if self.state != ChannelState::Connecting {
            return vec![Action::DropSocket];
        }
        let now = self.clock.now();
        self.state = ChannelState::Connected;
        self.retry_count = 0;
        self.reconnect_at = None;
        self.pong_deadline = None;
        self.next_ping_at = Some(now + self.config.heartbeat_interval);

        let mut actions = vec![Action::Emit(ChannelEvent::Connected)];
        let max_age = self.config.queue_max_age;
        let mut expired = 0usize;
        for (queued_at, text) in self.queue.drain(..) {
            if now.duration_since(queued_at) > max_age {
                expired += 1;
            } else {
                actions.push(Action::Transmit(text));
            }
        }
        if expired > 0 {
            debug!(
                component = "channel",
                event = "channel.queue.expired",
                dropped = expired,
                "Dropped queued messages older than the replay window"
            );
        }
        info!(
            component = "channel",
            event = "channel.connected",
            replayed = actions.len() - 1,
            "Channel connected"
        );
        actions
    }

    /// The socket closed, or a connection attempt failed.
    pub fn handle_close(&mut self) -> Vec<Action> {
        match self.state {
            ChannelState::Connecting | ChannelState::Connected => self.schedule_reconnect(),
            _ => Vec::new(),
        }
    }

    /// A text frame arrived.
    pub fn handle_text(&mut self, text: &str) -> Vec<Action> {
        if self.state != ChannelState::Connected {
            return Vec::new();
        }
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Pong) => {
                self.pong_deadline = None;
                Vec::new()
            }
            Ok(message) => vec![Action::Emit(ChannelEvent::Message(message))],
            Err(e) => {
                warn!(
                    component = "channel",
                    event = "channel.message.invalid",
                    error = %e,
                    "Unparsable frame from server"
                );
                vec![Action::Emit(ChannelEvent::Message(ServerMessage::error(
                    INVALID_SERVER_MESSAGE,
                )))]
            }
        }
    }

    pub fn send(&mut self, message: &ClientMessage) -> Vec<Action> {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(
                    component = "channel",
                    event = "channel.encode_failed",
                    error = %e,
                    "Failed to encode client message"
                );
                Vec::new()
            }
        }
    }

    /// Transmit now when connected, otherwise queue for the next open.
    pub fn send_text(&mut self, text: String) -> Vec<Action> {
        match self.state {
            ChannelState::Connected => vec![Action::Transmit(text)],
            ChannelState::Closed | ChannelState::Failed => Vec::new(),
            _ => {
                if self.queue.len() >= self.config.queue_capacity {
                    self.queue.pop_front();
                    warn!(
                        component = "channel",
                        event = "channel.queue.overflow",
                        capacity = self.config.queue_capacity,
                        "Outbound queue full, dropped oldest message"
                    );
                }
                self.queue.push_back((self.clock.now(), text));
                Vec::new()
            }
        }
    }

    /// Close for good; no reconnect follows.
    pub fn close(&mut self) -> Vec<Action> {
        if self.state == ChannelState::Closed {
            return Vec::new();
        }
        self.state = ChannelState::Closed;
        self.clear_timers();
        self.queue.clear();
        vec![Action::DropSocket, Action::Emit(ChannelEvent::Closed)]
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ChannelState::Disconnected => self.reconnect_at,
            ChannelState::Connected => match (self.next_ping_at, self.pong_deadline) {
                (Some(ping), Some(pong)) => Some(ping.min(pong)),
                (ping, pong) => ping.or(pong),
            },
            _ => None,
        }
    }

    /// Fire whatever timers are due.
    pub fn tick(&mut self) -> Vec<Action> {
        let now = self.clock.now();
        match self.state {
            ChannelState::Disconnected => match self.reconnect_at {
                Some(at) if at <= now => {
                    self.reconnect_at = None;
                    self.state = ChannelState::Connecting;
                    vec![Action::Connect]
                }
                _ => Vec::new(),
            },
            ChannelState::Connected => {
                if self.pong_deadline.is_some_and(|deadline| deadline <= now) {
                    warn!(
                        component = "channel",
                        event = "channel.heartbeat.timeout",
                        "No pong within the heartbeat timeout, reconnecting"
                    );
                    let mut actions = vec![Action::DropSocket];
                    actions.extend(self.schedule_reconnect());
                    return actions;
                }
                match self.next_ping_at {
                    Some(at) if at <= now => {
                        self.next_ping_at = Some(now + self.config.heartbeat_interval);
                        if self.pong_deadline.is_none() {
                            self.pong_deadline = Some(now + self.config.pong_timeout);
                        }
                        match serde_json::to_string(&ClientMessage::Ping) {
                            Ok(ping) => vec![Action::Transmit(ping)],
                            Err(_) => Vec::new(),
                        }
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn clear_timers(&mut self) {
        self.reconnect_at = None;
        self.next_ping_at = None;
        self.pong_deadline = None;
    }

    fn schedule_reconnect(&mut self) -> Vec<Action> {
        self.clear_timers();
        if self.retry_count >= self.config.max_retries {
            self.state = ChannelState::Failed;
            self.queue.clear();
            warn!(
                component = "channel",
                event = "channel.failed",
                retries = self.retry_count,
                "Reconnect attempts exhausted"
            );
            return vec![Action::Emit(ChannelEvent::Failed)];
        }

        let delay = self.backoff_delay();
        self.retry_count += 1;
        self.reconnect_at = Some(self.clock.now() + delay);
        self.state = ChannelState::Disconnected;
        info!(
            component = "channel",
            event = "channel.reconnect_scheduled",
            attempt = self.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, reconnect scheduled"
        );
        vec![Action::Emit(ChannelEvent::Reconnecting {
            attempt: self.retry_count,
            delay,
        })]
    }

    /// `min(base * 2^retry, cap)` with ±30 % jitter.
    fn backoff_delay(&mut self) -> Duration {
        let exponent = self.retry_count.min(31);
        let base = self
            .config
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_delay)
            .min(BACKOFF_CEILING);
        let factor = self.rng.random_range((1.0 - JITTER)..=(1.0 + JITTER));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(config: ChannelConfig) -> (ReconnectingChannel<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (ReconnectingChannel::with_seed(config, clock.clone(), 7), clock)
    }

    fn reconnect_delay(actions: &[Action]) -> Duration {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Emit(ChannelEvent::Reconnecting { delay, .. }) => Some(*delay),
                _ => None,
            })
            .expect("expected a reconnect to be scheduled")
    }

    fn assert_near(actual: Duration, nominal_ms: u64) {
        let ms = actual.as_millis() as f64;
        let nominal = nominal_ms as f64;
        assert!(
            ms >= nominal * 0.7 - 1.0 && ms <= nominal * 1.3 + 1.0,
            "{ms}ms outside ±30% of {nominal}ms"
        );
    }

    #[test]
    fn backoff_doubles_with_jitter_then_fails_once() {
        let config = ChannelConfig {
            max_retries: 3,
            ..Default::default()
        };
        let (mut ch, clock) = channel(config);
        assert_eq!(ch.start(), vec![Action::Connect]);
        ch.handle_open();

        for nominal in [1000, 2000, 4000] {
            let delay = reconnect_delay(&ch.handle_close());
            assert_near(delay, nominal);
            assert_eq!(ch.state(), ChannelState::Disconnected);

            // Nothing happens before the deadline.
            clock.advance(delay - Duration::from_millis(1));
            assert!(ch.tick().is_empty());
            clock.advance(Duration::from_millis(1));
            assert_eq!(ch.tick(), vec![Action::Connect]);
        }

        let actions = ch.handle_close();
        assert_eq!(actions, vec![Action::Emit(ChannelEvent::Failed)]);
        assert_eq!(ch.state(), ChannelState::Failed);

        // Terminal failure is reported exactly once.
        assert!(ch.handle_close().is_empty());
        clock.advance(Duration::from_secs(60));
        assert!(ch.tick().is_empty());
        assert_eq!(ch.next_deadline(), None);
    }

    #[test]
    fn successful_open_resets_retries() {
        let (mut ch, clock) = channel(ChannelConfig::default());
        ch.start();
        ch.handle_open();
        let delay = reconnect_delay(&ch.handle_close());
        clock.advance(delay);
        ch.tick();
        assert_eq!(ch.retry_count(), 1);

        ch.handle_open();
        assert_eq!(ch.retry_count(), 0);
        assert_near(reconnect_delay(&ch.handle_close()), 1000);
    }

    #[test]
    fn delay_is_capped() {
        let config = ChannelConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_retries: 20,
            ..Default::default()
        };
        let (mut ch, clock) = channel(config);
        ch.start();
        for _ in 0..8 {
            let delay = reconnect_delay(&ch.handle_close());
            assert!(delay <= Duration::from_millis(6500), "{delay:?}");
            clock.advance(delay);
            ch.tick();
        }
    }

    #[test]
    fn huge_delay_config_is_clamped() {
        let config = ChannelConfig {
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            max_retries: 3,
            ..Default::default()
        };
        let (mut ch, clock) = channel(config);
        ch.start();
        ch.handle_open();

        let delay = reconnect_delay(&ch.handle_close());
        assert!(delay <= BACKOFF_CEILING.mul_f64(1.0 + JITTER), "{delay:?}");
        assert!(delay >= BACKOFF_CEILING.mul_f64(1.0 - JITTER), "{delay:?}");
        clock.advance(delay);
        assert_eq!(ch.tick(), vec![Action::Connect]);
    }

    #[test]
    fn explicit_close_never_reconnects() {
        let (mut ch, clock) = channel(ChannelConfig::default());
        ch.start();
        ch.handle_open();
        assert_eq!(
            ch.close(),
            vec![Action::DropSocket, Action::Emit(ChannelEvent::Closed)]
        );
        assert!(ch.handle_close().is_empty());
        clock.advance(Duration::from_secs(120));
        assert!(ch.tick().is_empty());
        assert!(ch.send(&ClientMessage::Ping).is_empty());
        assert_eq!(ch.queued(), 0);
    }

    #[test]
    fn heartbeat_pings_and_missing_pong_forces_reconnect() {
        let config = ChannelConfig {
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let (mut ch, clock) = channel(config);
        ch.start();
        ch.handle_open();

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            ch.tick(),
            vec![Action::Transmit(r#"{"type":"ping"}"#.to_string())]
        );

        // A pong clears the deadline.
        assert!(ch.handle_text(r#"{"type":"pong"}"#).is_empty());
        clock.advance(Duration::from_secs(15));
        assert!(ch.tick().is_empty());

        // Next ping goes unanswered.
        clock.advance(Duration::from_secs(15));
        assert_eq!(ch.tick().len(), 1);
        clock.advance(Duration::from_secs(10));
        let actions = ch.tick();
        assert_eq!(actions[0], Action::DropSocket);
        assert_near(reconnect_delay(&actions), 1000);
        assert_eq!(ch.state(), ChannelState::Disconnected);
    }

    #[test]
    fn queued_messages_flush_on_open_and_age_out() {
        let (mut ch, clock) = channel(ChannelConfig::default());
        ch.start();

        assert!(ch
            .send(&ClientMessage::MessageSend {
                content: "old".into()
            })
            .is_empty());
        clock.advance(Duration::from_secs(31));
        ch.send(&ClientMessage::MessageSend {
            content: "fresh".into(),
        });
        assert_eq!(ch.queued(), 2);

        let actions = ch.handle_open();
        assert_eq!(actions[0], Action::Emit(ChannelEvent::Connected));
        let sent: Vec<&Action> = actions[1..].iter().collect();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Action::Transmit(text) if text.contains("fresh")));
        assert_eq!(ch.queued(), 0);

        // Connected sends go straight out.
        assert!(matches!(
            ch.send(&ClientMessage::SessionInterrupt).as_slice(),
            [Action::Transmit(_)]
        ));
    }

    #[test]
    fn queue_drops_oldest_past_capacity() {
        let config = ChannelConfig {
            queue_capacity: 2,
            ..Default::default()
        };
        let (mut ch, _clock) = channel(config);
        ch.start();
        for text in ["a", "b", "c"] {
            ch.send_text(text.to_string());
        }
        let actions = ch.handle_open();
        assert_eq!(
            actions[1..],
            [
                Action::Transmit("b".to_string()),
                Action::Transmit("c".to_string())
            ]
        );
    }

    #[test]
    fn server_frames_become_events() {
        let (mut ch, _clock) = channel(ChannelConfig::default());
        ch.start();
        ch.handle_open();

        assert_eq!(
            ch.handle_text(r#"{"type":"assistant.chunk","content":"x"}"#),
            vec![Action::Emit(ChannelEvent::Message(
                ServerMessage::AssistantChunk {
                    content: "x".into()
                }
            ))]
        );
        assert_eq!(
            ch.handle_text("{nope"),
            vec![Action::Emit(ChannelEvent::Message(ServerMessage::error(
                INVALID_SERVER_MESSAGE
            )))]
        );
    }
}
