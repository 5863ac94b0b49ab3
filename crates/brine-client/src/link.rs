//! An authenticated link to one master.

use std::sync::Arc;

use brine_storage::MinionId;
use brine_transport::secure::{open, open_publish, seal};
use brine_transport::{
    Connection, MinionReply, MinionRequest, PubFrame, PubStream, PublishLoad, Request, Response,
    TransportError,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::auth::{Authenticator, Session};
use crate::LinkError;

pub struct MasterLink {
    conn: Box<dyn Connection>,
    auth: Arc<Authenticator>,
    session: RwLock<Session>,
}

impl MasterLink {
    /// Authenticate over `conn`.
    pub async fn establish(
        conn: Box<dyn Connection>,
        auth: Arc<Authenticator>,
    ) -> Result<Self, crate::AuthError> {
        let session = auth.authenticate(conn.as_ref()).await?;
        Ok(Self {
            conn,
            auth,
            session: RwLock::new(session),
        })
    }

    pub fn master(&self) -> &str {
        self.conn.master()
    }

    pub fn id(&self) -> &MinionId {
        self.auth.id()
    }

    pub async fn session_version(&self) -> u64 {
        self.session.read().await.version
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        match self.conn.request(&Request::Ping, self.auth.timeout()).await? {
            Response::Pong => Ok(()),
            other => Err(TransportError::Codec(format!(
                "unexpected reply to ping: {other:?}"
            ))),
        }
    }

    pub async fn subscribe(&self) -> Result<PubStream, TransportError> {
        self.conn.subscribe().await
    }

    /// Handshake again on the same connection and swap in the new session.
    pub async fn reauthenticate(&self) -> Result<(), LinkError> {
        let fresh = self.auth.authenticate(self.conn.as_ref()).await?;
        info!(
            master = self.master(),
            version = fresh.version,
            "re-authenticated"
        );
        *self.session.write().await = fresh;
        Ok(())
    }

    /// Sealed request/reply. A `Reauth` answer triggers one handshake and
    /// one retry.
    pub async fn request(&self, msg: &MinionRequest) -> Result<MinionReply, LinkError> {
        match self.request_once(msg).await {
            Err(LinkError::Reauth) => {
                self.reauthenticate().await?;
                self.request_once(msg).await
            }
            other => other,
        }
    }

    async fn request_once(&self, msg: &MinionRequest) -> Result<MinionReply, LinkError> {
        let session = self.session.read().await.clone();
        let sealed = seal(&session.key, session.version, self.auth.id(), msg)?;
        let response = self
            .conn
            .request(&Request::Secure(sealed), self.auth.timeout())
            .await?;
        match response {
            Response::Secure(reply) => match open::<MinionReply>(&session.key, &reply)? {
                MinionReply::Error { message } => Err(LinkError::Master(message)),
                reply => Ok(reply),
            },
            Response::Reauth => Err(LinkError::Reauth),
            Response::Error { message } => Err(LinkError::Master(message)),
            other => Err(LinkError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Decrypt a publish frame. A frame from a newer session version means
    /// the master rotated; re-authenticate once and try again.
    pub async fn open_publish(&self, frame: &PubFrame) -> Result<PublishLoad, LinkError> {
        let mut session = self.session.read().await.clone();
        if frame.session_version > session.version {
            debug!(
                ours = session.version,
                theirs = frame.session_version,
                "publish from a newer session"
            );
            self.reauthenticate().await?;
            session = self.session.read().await.clone();
        }
        if frame.session_version != session.version {
            return Err(LinkError::Stale(frame.session_version));
        }
        Ok(open_publish(&session.key, frame)?)
    }
}
