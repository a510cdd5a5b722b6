//! Reconnection controller.
//!
//! A pure state machine: the driver feeds it [`Event`]s and executes the
//! [`Command`]s it returns. Timers are owned by the driver; the controller
//! only asks for them to be started or cancelled.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Attempt number past which the delay stops growing.
    pub max_exponent: u32,
    /// Jitter applied to each delay, in percent of the base delay.
    pub jitter_percent: u64,
    /// How long one attempt may take to connect and handshake.
    pub connect_timeout: Duration,
    /// How often the driver samples its own heartbeat.
    pub heartbeat_interval: Duration,
    /// Heartbeat gap that indicates the process was frozen.
    pub freeze_gap: Duration,
    /// How long to wait for a pong after a liveness ping.
    pub pong_timeout: Duration,
    /// How often the watchdog checks that a wanted connection exists.
    pub watchdog_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_exponent: 15,
            jitter_percent: 25,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            freeze_gap: Duration::from_secs(8),
            pong_timeout: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(60),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based) without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.clamp(1, self.max_exponent.max(1)) - 1;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = millis(self.initial_delay).saturating_mul(factor);
        Duration::from_millis(delay.min(millis(self.max_delay)))
    }

    /// Delay before `attempt` with the configured jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = millis(self.base_delay(attempt));
        let spread = base.saturating_mul(self.jitter_percent) / 100;
        let offset = rng.gen_range(0..=spread.saturating_mul(2));
        Duration::from_millis(base - spread + offset)
    }
}

/// Where the connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Backoff { attempt: u32 },
    /// Waiting for the app to become visible or the network to come back.
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The user wants a connection.
    Open,
    /// The socket opened and the handshake completed.
    Connected,
    Close { clean: bool },
    ConnectTimeout,
    PongTimeout,
    Pong,
    VisibilityChange { visible: bool },
    Online,
    Offline,
    /// Time since the previous heartbeat sample.
    HeartbeatSample { gap: Duration },
    WatchdogTick,
    BackoffElapsed,
    /// The user no longer wants a connection.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Connect,
    Backoff,
    Pong,
}

/// User-facing connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting { attempt: u32 },
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Suspended,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    OpenSocket,
    CloseSocket,
    StartTimer { kind: TimerKind, delay: Duration },
    CancelTimer { kind: TimerKind },
    SendPing,
    Notify(Status),
}

pub struct ReconnectController<R = StdRng> {
    policy: ReconnectPolicy,
    state: ConnState,
    wanted: bool,
    visible: bool,
    online: bool,
    awaiting_pong: bool,
    /// Consecutive failed attempts.
    failures: u32,
    queue: VecDeque<Event>,
    rng: R,
}

impl ReconnectController<StdRng> {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }
}

impl<R: Rng> ReconnectController<R> {
    pub fn with_rng(policy: ReconnectPolicy, rng: R) -> Self {
        Self {
            policy,
            state: ConnState::Disconnected,
            wanted: false,
            visible: true,
            online: true,
            awaiting_pong: false,
            failures: 0,
            queue: VecDeque::new(),
            rng,
        }
    }

    pub const fn state(&self) -> ConnState {
        self.state
    }

    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Whether the user still wants a connection.
    pub const fn is_wanted(&self) -> bool {
        self.wanted
    }

    /// Queue an event for the next [`drain`](Self::drain).
    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Handle every queued event in order.
    pub fn drain(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        while let Some(event) = self.queue.pop_front() {
            commands.extend(self.handle(event));
        }
        commands
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        debug!(state = ?self.state, ?event, "Reconnect event");
        let mut out = Vec::new();
        match event {
            Event::Open => {
                self.wanted = true;
                if matches!(
                    self.state,
                    ConnState::Disconnected | ConnState::Suspended | ConnState::Backoff { .. }
                ) {
                    self.begin_attempt(&mut out);
                }
            }
            Event::Connected => {
                if let ConnState::Connecting { attempt } = self.state {
                    info!(attempt, "Connected");
                    self.state = ConnState::Connected;
                    self.failures = 0;
                    self.awaiting_pong = false;
                    out.push(Command::CancelTimer {
                        kind: TimerKind::Connect,
                    });
                    out.push(Command::Notify(Status::Connected));
                } else {
                    out.push(Command::CloseSocket);
                }
            }
            Event::Close { clean } => match self.state {
                ConnState::Connecting { .. } => {
                    out.push(Command::CancelTimer {
                        kind: TimerKind::Connect,
                    });
                    self.fail(&mut out);
                }
                ConnState::Connected => {
                    self.cancel_pong(&mut out);
                    if clean {
                        self.failures = 0;
                    }
                    self.fail(&mut out);
                }
                _ => {}
            },
            Event::ConnectTimeout => {
                if matches!(self.state, ConnState::Connecting { .. }) {
                    out.push(Command::CloseSocket);
                    self.fail(&mut out);
                }
            }
            Event::BackoffElapsed => {
                if matches!(self.state, ConnState::Backoff { .. }) {
                    self.begin_attempt(&mut out);
                }
            }
            Event::HeartbeatSample { gap } => {
                if self.state == ConnState::Connected && gap > self.policy.freeze_gap {
                    info!(gap_ms = millis(gap), "Heartbeat gap, checking connection");
                    self.probe(&mut out);
                }
            }
            Event::Pong => self.cancel_pong(&mut out),
            Event::PongTimeout => {
                if self.state == ConnState::Connected && self.awaiting_pong {
                    info!("Pong deadline missed, forcing reconnect");
                    self.awaiting_pong = false;
                    out.push(Command::CloseSocket);
                    self.begin_attempt(&mut out);
                }
            }
            Event::VisibilityChange { visible } => {
                self.visible = visible;
                if visible {
                    match self.state {
                        ConnState::Suspended => self.resume(&mut out),
                        ConnState::Connected => self.probe(&mut out),
                        _ => {}
                    }
                }
            }
            Event::Online => {
                self.online = true;
                match self.state {
                    ConnState::Suspended => self.resume(&mut out),
                    ConnState::Backoff { .. } => {
                        out.push(Command::CancelTimer {
                            kind: TimerKind::Backoff,
                        });
                        self.begin_attempt(&mut out);
                    }
                    _ => {}
                }
            }
            Event::Offline => {
                self.online = false;
                if matches!(self.state, ConnState::Backoff { .. }) {
                    out.push(Command::CancelTimer {
                        kind: TimerKind::Backoff,
                    });
                    self.suspend(&mut out);
                }
            }
            Event::WatchdogTick => {
                if self.wanted
                    && matches!(self.state, ConnState::Disconnected | ConnState::Suspended)
                    && self.visible
                    && self.online
                {
                    info!(state = ?self.state, "Watchdog found no connection, reconnecting");
                    self.begin_attempt(&mut out);
                }
            }
            Event::Stop => {
                self.wanted = false;
                self.awaiting_pong = false;
                if matches!(
                    self.state,
                    ConnState::Connecting { .. } | ConnState::Connected
                ) {
                    out.push(Command::CloseSocket);
                }
                for kind in [TimerKind::Connect, TimerKind::Backoff, TimerKind::Pong] {
                    out.push(Command::CancelTimer { kind });
                }
                self.state = ConnState::Disconnected;
                out.push(Command::Notify(Status::Disconnected));
            }
        }
        out
    }

    fn can_connect(&self) -> bool {
        self.visible && self.online
    }

    fn begin_attempt(&mut self, out: &mut Vec<Command>) {
        if !self.can_connect() {
            self.suspend(out);
            return;
        }
        let attempt = self.failures + 1;
        self.state = ConnState::Connecting { attempt };
        out.push(Command::Notify(Status::Connecting { attempt }));
        out.push(Command::StartTimer {
            kind: TimerKind::Connect,
            delay: self.policy.connect_timeout,
        });
        out.push(Command::OpenSocket);
    }

    /// An attempt or an established connection was lost.
    fn fail(&mut self, out: &mut Vec<Command>) {
        if !self.wanted {
            self.state = ConnState::Disconnected;
            out.push(Command::Notify(Status::Disconnected));
            return;
        }
        if !self.can_connect() {
            self.suspend(out);
            return;
        }
        self.failures = (self.failures + 1).min(self.policy.max_exponent);
        let attempt = self.failures;
        let delay = self.policy.delay_for_attempt(attempt, &mut self.rng);
        info!(attempt, delay_ms = millis(delay), "Reconnecting after backoff");
        self.state = ConnState::Backoff { attempt };
        out.push(Command::StartTimer {
            kind: TimerKind::Backoff,
            delay,
        });
        out.push(Command::Notify(Status::Reconnecting { attempt, delay }));
    }

    fn suspend(&mut self, out: &mut Vec<Command>) {
        info!(visible = self.visible, online = self.online, "Reconnect suspended");
        self.state = ConnState::Suspended;
        out.push(Command::Notify(Status::Suspended));
    }

    fn resume(&mut self, out: &mut Vec<Command>) {
        if self.wanted && self.can_connect() {
            self.begin_attempt(out);
        }
    }

    fn probe(&mut self, out: &mut Vec<Command>) {
        if self.awaiting_pong {
            return;
        }
        self.awaiting_pong = true;
        out.push(Command::SendPing);
        out.push(Command::StartTimer {
            kind: TimerKind::Pong,
            delay: self.policy.pong_timeout,
        });
    }

    fn cancel_pong(&mut self, out: &mut Vec<Command>) {
        if std::mem::take(&mut self.awaiting_pong) {
            out.push(Command::CancelTimer {
                kind: TimerKind::Pong,
            });
        }
    }
}
