//! Connection state machine for one minion.
//!
//! [`ConnectionManager::handle`] is a pure transition function: it consumes
//! an [`Event`] and returns the [`Action`]s the driver must perform. Every
//! `Sleep` is answered with [`Event::TimerFired`], every `Connect` with the
//! handshake outcome, every `Ping` with `PingOk`/`PingFailed`.

use std::time::Duration;

use brine_config::{MasterType, MinionConfig};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Authenticating,
    Connected,
    AliveCheck,
    Reconnecting,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Start,
    TimerFired,
    ConnectFailed { dns: bool },
    Accepted,
    Pending,
    /// The master is at `max_minions`.
    Full,
    Rejected,
    TrustFailed,
    /// No traffic within the alive interval.
    AliveDue,
    PingOk,
    PingFailed,
    LinkLost,
    FailbackDue,
    PrimaryUp,
    PrimaryDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Rejected,
    Trust,
    DnsExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Rejected => write!(f, "key rejected by master"),
            StopReason::Trust => write!(f, "master failed verification"),
            StopReason::DnsExhausted => write!(f, "master name could not be resolved"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Sleep(Duration),
    /// Open the transport to this master and authenticate.
    Connect(String),
    /// Alive ping on the current link.
    Ping,
    /// Check whether the primary master is reachable again.
    PingPrimary(String),
    Disconnect,
    /// Serve the link until something happens.
    Watch {
        alive: Option<Duration>,
        failback: Option<Duration>,
    },
    Shutdown(StopReason),
}

#[derive(Clone, Debug)]
pub struct ConnectPolicy {
    pub master_type: MasterType,
    /// Attempts against one master before advancing; `None` never advances.
    pub tries_per_master: Option<u32>,
    pub alive_interval: Option<Duration>,
    /// Set only when fail-back is enabled.
    pub failback_interval: Option<Duration>,
    pub retry_dns: Duration,
    pub retry_dns_count: Option<u32>,
    pub acceptance_wait: Duration,
    pub acceptance_wait_max: Duration,
    pub rejected_retry: bool,
    pub startup_delay: Duration,
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

impl ConnectPolicy {
    /// `random_startup_delay` is drawn here, once.
    pub fn from_config<R: Rng + ?Sized>(config: &MinionConfig, rng: &mut R) -> Self {
        let splay = if config.random_startup_delay > 0 {
            rng.random_range(0..=config.random_startup_delay)
        } else {
            0
        };
        Self {
            master_type: config.master_type,
            tries_per_master: config.master_tries_limit(),
            alive_interval: secs(config.master_alive_interval),
            failback_interval: if config.master_failback {
                secs(config.master_failback_interval)
            } else {
                None
            },
            retry_dns: Duration::from_secs(config.retry_dns),
            retry_dns_count: config.retry_dns_count,
            acceptance_wait: Duration::from_secs(config.acceptance_wait_time),
            acceptance_wait_max: Duration::from_secs(config.acceptance_wait_time_max),
            rejected_retry: config.rejected_retry,
            startup_delay: Duration::from_secs(splay),
        }
    }

    fn rotates(&self) -> bool {
        matches!(
            self.master_type,
            MasterType::Failover | MasterType::Distributed
        )
    }
}

pub struct ConnectionManager {
    policy: ConnectPolicy,
    masters: Vec<String>,
    current: usize,
    tries: u32,
    dns_failures: u32,
    backoff: Backoff,
    acceptance_wait: Duration,
    state: ConnState,
}

impl ConnectionManager {
    /// `masters` must already be in attempt order and non-empty.
    pub fn new(policy: ConnectPolicy, masters: Vec<String>, backoff: Backoff) -> Self {
        let acceptance_wait = policy.acceptance_wait;
        Self {
            policy,
            masters,
            current: 0,
            tries: 0,
            dns_failures: 0,
            backoff,
            acceptance_wait,
            state: ConnState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn current_master(&self) -> &str {
        self.masters
            .get(self.current)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        use ConnState::*;
        match (self.state, event) {
            (Stopped, _) => Vec::new(),

            (Disconnected, Event::Start) => {
                if self.policy.startup_delay.is_zero() {
                    self.connect()
                } else {
                    debug!(delay = ?self.policy.startup_delay, "startup splay");
                    vec![Action::Sleep(self.policy.startup_delay)]
                }
            }
            (Disconnected | Reconnecting, Event::TimerFired) => self.connect(),

            (Authenticating, Event::Accepted) => {
                info!(master = self.current_master(), "connected");
                self.state = Connected;
                self.tries = 0;
                self.dns_failures = 0;
                self.backoff.reset();
                self.acceptance_wait = self.policy.acceptance_wait;
                vec![self.watch()]
            }
            (Authenticating, Event::Pending | Event::Full) => self.wait_for_acceptance(),
            (Authenticating, Event::Rejected) => {
                if self.policy.rejected_retry {
                    self.wait_for_acceptance()
                } else {
                    self.stop(StopReason::Rejected)
                }
            }
            (Authenticating, Event::TrustFailed) => self.stop(StopReason::Trust),
            (Authenticating, Event::ConnectFailed { dns: true }) if !self.policy.retry_dns.is_zero() => {
                self.dns_failures += 1;
                if self
                    .policy
                    .retry_dns_count
                    .is_some_and(|limit| self.dns_failures > limit)
                {
                    return self.stop(StopReason::DnsExhausted);
                }
                warn!(
                    master = self.current_master(),
                    retry_in = ?self.policy.retry_dns,
                    "master name did not resolve"
                );
                self.state = Reconnecting;
                vec![Action::Sleep(self.policy.retry_dns)]
            }
            (Authenticating, Event::ConnectFailed { .. }) => {
                self.tries += 1;
                if self.policy.rotates()
                    && self
                        .policy
                        .tries_per_master
                        .is_some_and(|limit| self.tries >= limit)
                {
                    self.advance();
                }
                self.state = Reconnecting;
                vec![Action::Sleep(self.backoff.next_delay())]
            }

            (Connected, Event::AliveDue) => {
                self.state = AliveCheck;
                vec![Action::Ping]
            }
            (AliveCheck, Event::PingOk) => {
                self.state = Connected;
                vec![self.watch()]
            }
            (Connected | AliveCheck, Event::PingFailed | Event::LinkLost) => {
                warn!(master = self.current_master(), "lost connection to master");
                if self.policy.rotates() {
                    self.advance();
                }
                self.state = Reconnecting;
                vec![Action::Disconnect, Action::Sleep(self.backoff.next_delay())]
            }
            (Connected, Event::FailbackDue) if self.current != 0 => {
                vec![Action::PingPrimary(self.masters[0].clone())]
            }
            (Connected, Event::PrimaryUp) if self.current != 0 => {
                info!(primary = %self.masters[0], "primary master is back, failing back");
                self.current = 0;
                self.tries = 0;
                self.state = Authenticating;
                vec![Action::Disconnect, Action::Connect(self.masters[0].clone())]
            }
            (Connected, Event::FailbackDue | Event::PrimaryUp | Event::PrimaryDown) => {
                vec![self.watch()]
            }

            (state, event) => {
                debug!(?state, ?event, "event ignored");
                Vec::new()
            }
        }
    }

    fn connect(&mut self) -> Vec<Action> {
        self.state = ConnState::Authenticating;
        vec![Action::Connect(self.current_master().to_string())]
    }

    fn advance(&mut self) {
        let from = self.current;
        self.current = (self.current + 1) % self.masters.len().max(1);
        self.tries = 0;
        info!(
            from = %self.masters.get(from).map(String::as_str).unwrap_or_default(),
            to = self.current_master(),
            "moving to next master"
        );
    }

    fn wait_for_acceptance(&mut self) -> Vec<Action> {
        let wait = self.acceptance_wait;
        self.acceptance_wait = (wait + self.policy.acceptance_wait).min(self.policy.acceptance_wait_max.max(self.policy.acceptance_wait));
        info!(retry_in = ?wait, "waiting for key acceptance");
        self.state = ConnState::Reconnecting;
        vec![Action::Sleep(wait)]
    }

    fn watch(&self) -> Action {
        Action::Watch {
            alive: self.policy.alive_interval,
            failback: self.policy.failback_interval.filter(|_| self.current != 0),
        }
    }

    fn stop(&mut self, reason: StopReason) -> Vec<Action> {
        self.state = ConnState::Stopped;
        vec![Action::Shutdown(reason)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(master_type: MasterType) -> ConnectPolicy {
        ConnectPolicy {
            master_type,
            tries_per_master: Some(3),
            alive_interval: Some(Duration::from_secs(30)),
            failback_interval: None,
            retry_dns: Duration::from_secs(30),
            retry_dns_count: None,
            acceptance_wait: Duration::from_secs(10),
            acceptance_wait_max: Duration::from_secs(25),
            rejected_retry: false,
            startup_delay: Duration::ZERO,
        }
    }

    fn manager(policy: ConnectPolicy, masters: &[&str]) -> ConnectionManager {
        ConnectionManager::new(
            policy,
            masters.iter().map(|m| m.to_string()).collect(),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(10)),
        )
    }

    fn connect(m: &str) -> Vec<Action> {
        vec![Action::Connect(m.to_string())]
    }

    #[test]
    fn failover_advances_after_master_tries() {
        let mut mgr = manager(policy(MasterType::Failover), &["m1", "m2"]);
        assert_eq!(mgr.handle(Event::Start), connect("m1"));

        for attempt in 1..=3 {
            let actions = mgr.handle(Event::ConnectFailed { dns: false });
            assert!(matches!(actions[..], [Action::Sleep(_)]));
            assert_eq!(mgr.state(), ConnState::Reconnecting);
            let next = mgr.handle(Event::TimerFired);
            if attempt < 3 {
                assert_eq!(next, connect("m1"));
            } else {
                assert_eq!(next, connect("m2"));
            }
        }
        assert_eq!(mgr.current_master(), "m2");
    }

    #[test]
    fn single_master_never_rotates() {
        let mut mgr = manager(policy(MasterType::Str), &["m1"]);
        mgr.handle(Event::Start);
        for _ in 0..5 {
            mgr.handle(Event::ConnectFailed { dns: false });
            assert_eq!(mgr.handle(Event::TimerFired), connect("m1"));
        }
    }

    #[test]
    fn backoff_grows_across_failures_and_resets_on_connect() {
        let mut mgr = manager(policy(MasterType::Str), &["m1"]);
        mgr.handle(Event::Start);
        let mut delays = Vec::new();
        for _ in 0..3 {
            if let [Action::Sleep(d)] = mgr.handle(Event::ConnectFailed { dns: false })[..] {
                delays.push(d.as_secs());
            }
            mgr.handle(Event::TimerFired);
        }
        assert_eq!(delays, vec![1, 2, 4]);

        mgr.handle(Event::Accepted);
        let actions = mgr.handle(Event::LinkLost);
        assert_eq!(
            actions,
            vec![Action::Disconnect, Action::Sleep(Duration::from_secs(1))]
        );
    }

    #[test]
    fn pending_waits_grow_to_max() {
        let mut mgr = manager(policy(MasterType::Str), &["m1"]);
        mgr.handle(Event::Start);
        let mut waits = Vec::new();
        for _ in 0..4 {
            if let [Action::Sleep(d)] = mgr.handle(Event::Pending)[..] {
                waits.push(d.as_secs());
            }
            assert_eq!(mgr.handle(Event::TimerFired), connect("m1"));
        }
        assert_eq!(waits, vec![10, 20, 25, 25]);
    }

    #[test]
    fn rejection_and_trust_failures_stop() {
        let mut mgr = manager(policy(MasterType::Str), &["m1"]);
        mgr.handle(Event::Start);
        assert_eq!(
            mgr.handle(Event::Rejected),
            vec![Action::Shutdown(StopReason::Rejected)]
        );
        assert!(mgr.handle(Event::TimerFired).is_empty());

        let mut retrying = policy(MasterType::Str);
        retrying.rejected_retry = true;
        let mut mgr = manager(retrying, &["m1"]);
        mgr.handle(Event::Start);
        assert!(matches!(mgr.handle(Event::Rejected)[..], [Action::Sleep(_)]));

        let mut mgr = manager(policy(MasterType::Failover), &["m1", "m2"]);
        mgr.handle(Event::Start);
        assert_eq!(
            mgr.handle(Event::TrustFailed),
            vec![Action::Shutdown(StopReason::Trust)]
        );
        assert_eq!(mgr.state(), ConnState::Stopped);
    }

    #[test]
    fn dns_retry_count() {
        let mut limited = policy(MasterType::Str);
        limited.retry_dns_count = Some(2);
        let mut mgr = manager(limited, &["salt"]);
        mgr.handle(Event::Start);
        for _ in 0..2 {
            assert_eq!(
                mgr.handle(Event::ConnectFailed { dns: true }),
                vec![Action::Sleep(Duration::from_secs(30))]
            );
            mgr.handle(Event::TimerFired);
        }
        assert_eq!(
            mgr.handle(Event::ConnectFailed { dns: true }),
            vec![Action::Shutdown(StopReason::DnsExhausted)]
        );

        let mut immediate = policy(MasterType::Str);
        immediate.retry_dns_count = Some(0);
        let mut mgr = manager(immediate, &["salt"]);
        mgr.handle(Event::Start);
        assert_eq!(
            mgr.handle(Event::ConnectFailed { dns: true }),
            vec![Action::Shutdown(StopReason::DnsExhausted)]
        );
    }

    #[test]
    fn alive_check_failure_moves_to_next_master() {
        let mut mgr = manager(policy(MasterType::Failover), &["m1", "m2"]);
        mgr.handle(Event::Start);
        assert_eq!(
            mgr.handle(Event::Accepted),
            vec![Action::Watch {
                alive: Some(Duration::from_secs(30)),
                failback: None
            }]
        );
        assert_eq!(mgr.handle(Event::AliveDue), vec![Action::Ping]);
        assert_eq!(mgr.state(), ConnState::AliveCheck);
        let actions = mgr.handle(Event::PingFailed);
        assert_eq!(actions[0], Action::Disconnect);
        assert_eq!(mgr.handle(Event::TimerFired), connect("m2"));
    }

    #[test]
    fn alive_ping_ok_keeps_connection() {
        let mut mgr = manager(policy(MasterType::Failover), &["m1", "m2"]);
        mgr.handle(Event::Start);
        mgr.handle(Event::Accepted);
        mgr.handle(Event::AliveDue);
        assert!(matches!(mgr.handle(Event::PingOk)[..], [Action::Watch { .. }]));
        assert_eq!(mgr.state(), ConnState::Connected);
        assert_eq!(mgr.current_master(), "m1");
    }

    #[test]
    fn failback_returns_to_primary() {
        let mut p = policy(MasterType::Failover);
        p.tries_per_master = Some(1);
        p.failback_interval = Some(Duration::from_secs(60));
        let mut mgr = manager(p, &["m1", "m2"]);
        mgr.handle(Event::Start);
        mgr.handle(Event::ConnectFailed { dns: false });
        assert_eq!(mgr.handle(Event::TimerFired), connect("m2"));

        let watch = mgr.handle(Event::Accepted);
        assert_eq!(
            watch,
            vec![Action::Watch {
                alive: Some(Duration::from_secs(30)),
                failback: Some(Duration::from_secs(60))
            }]
        );
        assert_eq!(
            mgr.handle(Event::FailbackDue),
            vec![Action::PingPrimary("m1".into())]
        );
        assert!(matches!(mgr.handle(Event::PrimaryDown)[..], [Action::Watch { .. }]));
        mgr.handle(Event::FailbackDue);
        assert_eq!(
            mgr.handle(Event::PrimaryUp),
            vec![Action::Disconnect, Action::Connect("m1".into())]
        );
        assert_eq!(mgr.state(), ConnState::Authenticating);

        // back on the primary, no failback timer
        assert_eq!(
            mgr.handle(Event::Accepted),
            vec![Action::Watch {
                alive: Some(Duration::from_secs(30)),
                failback: None
            }]
        );
    }

    #[test]
    fn startup_splay_sleeps_first() {
        let mut p = policy(MasterType::Str);
        p.startup_delay = Duration::from_secs(4);
        let mut mgr = manager(p, &["m1"]);
        assert_eq!(
            mgr.handle(Event::Start),
            vec![Action::Sleep(Duration::from_secs(4))]
        );
        assert_eq!(mgr.state(), ConnState::Disconnected);
        assert_eq!(mgr.handle(Event::TimerFired), connect("m1"));
    }
}
