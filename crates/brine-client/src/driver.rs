//! Runs a [`ConnectionManager`] against a real transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brine_transport::{ClientTransport, PubStream, PublishLoad};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, warn};

use crate::auth::Authenticator;
use crate::fsm::{Action, ConnectionManager, Event};
use crate::link::MasterLink;
use crate::{AuthError, ClientError};

/// Receives the link lifecycle and every publish.
///
/// `publish` runs on the driver task; long work must be spawned.
#[async_trait]
pub trait LinkHandler: Send + Sync {
    async fn connected(&self, link: Arc<MasterLink>);

    async fn publish(&self, link: Arc<MasterLink>, load: PublishLoad);

    async fn disconnected(&self, master: &str);
}

pub struct Driver<H: LinkHandler> {
    transport: Arc<dyn ClientTransport>,
    auth: Arc<Authenticator>,
    manager: ConnectionManager,
    handler: Arc<H>,
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn every(period: Option<Duration>) -> Option<Interval> {
    period.map(|p| interval_at(Instant::now() + p, p))
}

impl<H: LinkHandler> Driver<H> {
    pub fn new(
        transport: Arc<dyn ClientTransport>,
        auth: Arc<Authenticator>,
        manager: ConnectionManager,
        handler: Arc<H>,
    ) -> Self {
        Self {
            transport,
            auth,
            manager,
            handler,
        }
    }

    /// Run until shutdown is signalled (`Ok`) or the state machine gives up.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let mut queue: VecDeque<Action> = self.manager.handle(Event::Start).into();
        let mut link: Option<Arc<MasterLink>> = None;
        let mut stream: Option<PubStream> = None;

        while let Some(action) = queue.pop_front() {
            if *shutdown.borrow() {
                break;
            }
            let event = match action {
                Action::Sleep(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Some(Event::TimerFired),
                        _ = shutdown.changed() => None,
                    }
                }
                Action::Connect(master) => Some(self.connect(&master, &mut link, &mut stream).await),
                Action::Ping => {
                    let ok = match &link {
                        Some(l) => l.ping().await.is_ok(),
                        None => false,
                    };
                    Some(if ok { Event::PingOk } else { Event::PingFailed })
                }
                Action::PingPrimary(master) => Some(self.ping_primary(&master).await),
                Action::Disconnect => {
                    stream = None;
                    if let Some(old) = link.take() {
                        self.handler.disconnected(old.master()).await;
                    }
                    continue;
                }
                Action::Watch { alive, failback } => match (&link, stream.as_mut()) {
                    (Some(l), Some(s)) => {
                        self.watch(l.clone(), s, alive, failback, &mut shutdown)
                            .await
                    }
                    _ => Some(Event::LinkLost),
                },
                Action::Shutdown(reason) => {
                    error!(%reason, "minion connection stopped");
                    if let Some(old) = link.take() {
                        self.handler.disconnected(old.master()).await;
                    }
                    return Err(ClientError::Stopped(reason));
                }
            };
            let Some(event) = event else {
                break;
            };
            queue.extend(self.manager.handle(event));
        }

        if let Some(old) = link.take() {
            self.handler.disconnected(old.master()).await;
        }
        Ok(())
    }

    async fn connect(
        &self,
        master: &str,
        link: &mut Option<Arc<MasterLink>>,
        stream: &mut Option<PubStream>,
    ) -> Event {
        let conn = match self.transport.connect(master).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(master, error = %e, "could not reach master");
                return Event::ConnectFailed { dns: e.is_dns() };
            }
        };
        let established = match MasterLink::establish(conn, self.auth.clone()).await {
            Ok(l) => Arc::new(l),
            Err(AuthError::Pending) => return Event::Pending,
            Err(AuthError::Full) => return Event::Full,
            Err(AuthError::Rejected) => return Event::Rejected,
            Err(AuthError::Trust(e)) => {
                error!(master, error = %e, "refusing to trust master");
                return Event::TrustFailed;
            }
            Err(AuthError::Transport(e)) => {
                warn!(master, error = %e, "handshake failed");
                return Event::ConnectFailed { dns: e.is_dns() };
            }
            Err(e) => {
                warn!(master, error = %e, "handshake failed");
                return Event::ConnectFailed { dns: false };
            }
        };
        match established.subscribe().await {
            Ok(s) => *stream = Some(s),
            Err(e) => {
                warn!(master, error = %e, "publish channel unavailable");
                return Event::ConnectFailed { dns: false };
            }
        }
        *link = Some(established.clone());
        self.handler.connected(established).await;
        Event::Accepted
    }

    async fn ping_primary(&self, master: &str) -> Event {
        match self.transport.connect(master).await {
            Ok(conn) => {
                let ok = matches!(
                    conn.request(&brine_transport::Request::Ping, self.auth.timeout())
                        .await,
                    Ok(brine_transport::Response::Pong)
                );
                if ok {
                    Event::PrimaryUp
                } else {
                    Event::PrimaryDown
                }
            }
            Err(_) => Event::PrimaryDown,
        }
    }

    /// `None` means shutdown was requested.
    async fn watch(
        &self,
        link: Arc<MasterLink>,
        stream: &mut PubStream,
        alive: Option<Duration>,
        failback: Option<Duration>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Event> {
        let mut alive_tick = every(alive);
        let mut failback_tick = every(failback);
        let mut last_traffic = Instant::now();
        loop {
            tokio::select! {
                frame = stream.next() => {
                    let Some(frame) = frame else {
                        return Some(Event::LinkLost);
                    };
                    last_traffic = Instant::now();
                    match link.open_publish(&frame).await {
                        Ok(load) => self.handler.publish(link.clone(), load).await,
                        Err(e) => debug!(error = %e, "dropping publish"),
                    }
                }
                _ = tick(&mut alive_tick) => {
                    if alive.is_some_and(|a| last_traffic.elapsed() >= a) {
                        return Some(Event::AliveDue);
                    }
                }
                _ = tick(&mut failback_tick) => return Some(Event::FailbackDue),
                _ = shutdown.changed() => return None,
            }
        }
    }
}
