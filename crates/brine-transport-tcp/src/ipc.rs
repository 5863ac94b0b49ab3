//! Local client channel between administration commands and the master.
//!
//! `ipc_mode: ipc` uses a unix socket under the sock dir; `ipc_mode: tcp`
//! listens on loopback for platforms without unix sockets.

use std::path::PathBuf;
use std::time::Duration;

use brine_transport::codec::{read_frame, write_frame};
use brine_transport::{Incoming, Request, Response, TransportError};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::serve_requests;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpcEndpoint {
    Unix(PathBuf),
    Tcp(u16),
}

pub struct IpcServer {
    endpoint: IpcEndpoint,
}

impl IpcServer {
    pub fn new(endpoint: IpcEndpoint) -> Self {
        Self { endpoint }
    }

    /// Bind and spawn the accept loop.
    pub async fn serve(&self, queue: mpsc::Sender<Incoming>) -> Result<(), TransportError> {
        match &self.endpoint {
            #[cfg(unix)]
            IpcEndpoint::Unix(path) => {
                if tokio::fs::metadata(path).await.is_ok() {
                    // Stale socket from a previous run.
                    tokio::fs::remove_file(path).await?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                info!("Local client socket at {}", path.display());
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                tokio::spawn(serve_requests(stream, "ipc".into(), queue.clone()));
                            }
                            Err(e) => warn!("Accept on ipc socket failed: {}", e),
                        }
                    }
                });
            }
            #[cfg(not(unix))]
            IpcEndpoint::Unix(_) => {
                return Err(TransportError::Io(std::io::Error::other(
                    "unix sockets are unavailable, use ipc_mode: tcp",
                )))
            }
            IpcEndpoint::Tcp(port) => {
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", *port)).await?;
                info!("Local client listener on {}", listener.local_addr()?);
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                tokio::spawn(serve_requests(
                                    stream,
                                    format!("ipc:{}", peer),
                                    queue.clone(),
                                ));
                            }
                            Err(e) => warn!("Accept on ipc port failed: {}", e),
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

/// One request/reply exchange over the local channel.
pub async fn ipc_request(
    endpoint: &IpcEndpoint,
    req: &Request,
    timeout: Duration,
) -> Result<Response, TransportError> {
    let exchange = async {
        match endpoint {
            #[cfg(unix)]
            IpcEndpoint::Unix(path) => {
                let mut stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|_| TransportError::ConnectionRefused(path.display().to_string()))?;
                write_frame(&mut stream, req).await?;
                read_frame::<_, Response>(&mut stream).await
            }
            #[cfg(not(unix))]
            IpcEndpoint::Unix(path) => Err(TransportError::ConnectionRefused(
                path.display().to_string(),
            )),
            IpcEndpoint::Tcp(port) => {
                let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", *port))
                    .await
                    .map_err(|_| TransportError::ConnectionRefused(format!("127.0.0.1:{}", port)))?;
                write_frame(&mut stream, req).await?;
                read_frame::<_, Response>(&mut stream).await
            }
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unix_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = IpcEndpoint::Unix(dir.path().join("master.ipc"));
        let (tx, mut rx) = mpsc::channel::<Incoming>(4);
        IpcServer::new(endpoint.clone()).serve(tx).await.unwrap();
        tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                let _ = incoming.reply.send(Response::Pong);
            }
        });

        let resp = ipc_request(&endpoint, &Request::Ping, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(resp, Response::Pong));
    }

    #[tokio::test]
    async fn missing_socket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = IpcEndpoint::Unix(dir.path().join("absent.ipc"));
        let err = ipc_request(&endpoint, &Request::Ping, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }
}
