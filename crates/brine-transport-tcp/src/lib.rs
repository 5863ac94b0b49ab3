//! TCP transport.
//!
//! The master listens on two ports: the publish port streams [`PubFrame`]s to
//! every connected minion, the return port answers framed requests. Both use
//! the length-prefixed JSON codec from `brine-transport`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use brine_transport::codec::{read_frame, write_frame};
use brine_transport::{
    ClientTransport, Connection, Incoming, PubFrame, PubStream, Request, Response,
    ServerTransport, TransportError,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

mod ipc;

pub use ipc::{ipc_request, IpcEndpoint, IpcServer};

const PUBLISH_BACKLOG: usize = 1024;

/// Read requests off one stream until it closes, feeding them to `queue`.
pub(crate) async fn serve_requests<S>(mut stream: S, peer: String, queue: mpsc::Sender<Incoming>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(req) => req,
            Err(TransportError::Closed) => break,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer, e);
                break;
            }
        };
        let (tx, rx) = oneshot::channel();
        let incoming = Incoming {
            request,
            peer: peer.clone(),
            reply: tx,
        };
        if queue.send(incoming).await.is_err() {
            debug!("Request queue closed, disconnecting {}", peer);
            break;
        }
        let response = rx.await.unwrap_or(Response::Error {
            message: "request dropped".into(),
        });
        if let Err(e) = write_frame(&mut stream, &response).await {
            debug!("Failed to reply to {}: {}", peer, e);
            break;
        }
    }
}

// ───────────────────────────────────── Server ─────────────────────────────────────────

/// Bind addresses for the master side.
#[derive(Clone, Debug)]
pub struct TcpServerOptions {
    pub interface: IpAddr,
    pub publish_port: u16,
    pub ret_port: u16,
}

pub struct TcpServerTransport {
    publish_listener: StdMutex<Option<TcpListener>>,
    ret_listener: StdMutex<Option<TcpListener>>,
    publish_addr: SocketAddr,
    ret_addr: SocketAddr,
    frames: broadcast::Sender<PubFrame>,
}

impl TcpServerTransport {
    pub async fn bind(opts: &TcpServerOptions) -> Result<Self, TransportError> {
        let publish = TcpListener::bind((opts.interface, opts.publish_port)).await?;
        let ret = TcpListener::bind((opts.interface, opts.ret_port)).await?;
        let publish_addr = publish.local_addr()?;
        let ret_addr = ret.local_addr()?;
        info!(
            "TCP transport bound: publish on {}, requests on {}",
            publish_addr, ret_addr
        );
        Ok(Self {
            publish_listener: StdMutex::new(Some(publish)),
            ret_listener: StdMutex::new(Some(ret)),
            publish_addr,
            ret_addr,
            frames: broadcast::channel(PUBLISH_BACKLOG).0,
        })
    }

    pub fn publish_addr(&self) -> SocketAddr {
        self.publish_addr
    }

    pub fn ret_addr(&self) -> SocketAddr {
        self.ret_addr
    }

    fn take(slot: &StdMutex<Option<TcpListener>>) -> Result<TcpListener, TransportError> {
        slot.lock()
            .ok()
            .and_then(|mut l| l.take())
            .ok_or_else(|| TransportError::Io(std::io::Error::other("transport already serving")))
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn serve(&self, queue: mpsc::Sender<Incoming>) -> Result<(), TransportError> {
        let ret = Self::take(&self.ret_listener)?;
        let publish = Self::take(&self.publish_listener)?;

        tokio::spawn(async move {
            loop {
                match ret.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(serve_requests(stream, peer.to_string(), queue.clone()));
                    }
                    Err(e) => warn!("Accept on return port failed: {}", e),
                }
            }
        });

        let frames = self.frames.clone();
        tokio::spawn(async move {
            loop {
                match publish.accept().await {
                    Ok((mut stream, peer)) => {
                        let mut rx = frames.subscribe();
                        tokio::spawn(async move {
                            debug!("Publish subscriber connected: {}", peer);
                            loop {
                                let frame = match rx.recv().await {
                                    Ok(frame) => frame,
                                    Err(broadcast::error::RecvError::Lagged(n)) => {
                                        warn!("Publish subscriber {} lagged by {} frames", peer, n);
                                        continue;
                                    }
                                    Err(broadcast::error::RecvError::Closed) => break,
                                };
                                if write_frame(&mut stream, &frame).await.is_err() {
                                    debug!("Publish subscriber {} went away", peer);
                                    break;
                                }
                            }
                        });
                    }
                    Err(e) => warn!("Accept on publish port failed: {}", e),
                }
            }
        });
        Ok(())
    }

    async fn publish(&self, frame: PubFrame) -> Result<(), TransportError> {
        // No subscribers yet is fine
        let _ = self.frames.send(frame);
        Ok(())
    }
}

// ───────────────────────────────────── Client ─────────────────────────────────────────

/// Connection options for the minion side.
#[derive(Clone, Debug)]
pub struct TcpClientOptions {
    pub publish_port: u16,
    pub ret_port: u16,
    pub source_address: Option<IpAddr>,
    pub source_publish_port: Option<u16>,
    pub source_ret_port: Option<u16>,
}

pub struct TcpClientTransport {
    opts: TcpClientOptions,
}

impl TcpClientTransport {
    pub fn new(opts: TcpClientOptions) -> Self {
        Self { opts }
    }
}

/// Split `host`, `host:port` or `[v6]:port`.
fn split_master(master: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = master.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once("]:") {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
        return (rest.trim_end_matches(']').to_string(), default_port);
    }
    match master.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (master.to_string(), default_port),
        },
        _ => (master.to_string(), default_port),
    }
}

async fn open_stream(
    addr: SocketAddr,
    source_address: Option<IpAddr>,
    source_port: Option<u16>,
    label: &str,
) -> Result<TcpStream, TransportError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if source_address.is_some() || source_port.is_some() {
        let ip = source_address.unwrap_or(if addr.is_ipv4() {
            IpAddr::from([0, 0, 0, 0])
        } else {
            IpAddr::from([0u16; 8])
        });
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::new(ip, source_port.unwrap_or(0)))?;
    }
    match socket.connect(addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(TransportError::ConnectionRefused(label.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    async fn connect(&self, master: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (host, ret_port) = split_master(master, self.opts.ret_port);
        let ret_addr = tokio::net::lookup_host((host.as_str(), ret_port))
            .await
            .map_err(|_| TransportError::Dns(host.clone()))?
            .next()
            .ok_or_else(|| TransportError::Dns(host.clone()))?;
        let stream = open_stream(
            ret_addr,
            self.opts.source_address,
            self.opts.source_ret_port,
            master,
        )
        .await?;
        debug!("Connected to {} ({})", master, ret_addr);
        Ok(Box::new(TcpConnection {
            master: master.to_string(),
            stream: Mutex::new(stream),
            publish_addr: SocketAddr::new(ret_addr.ip(), self.opts.publish_port),
            source_address: self.opts.source_address,
            source_publish_port: self.opts.source_publish_port,
        }))
    }
}

struct TcpConnection {
    master: String,
    stream: Mutex<TcpStream>,
    publish_addr: SocketAddr,
    source_address: Option<IpAddr>,
    source_publish_port: Option<u16>,
}

#[async_trait]
impl Connection for TcpConnection {
    fn master(&self) -> &str {
        &self.master
    }

    async fn request(&self, req: &Request, timeout: Duration) -> Result<Response, TransportError> {
        let mut stream = self.stream.lock().await;
        let exchange = async {
            write_frame(&mut *stream, req).await?;
            read_frame::<_, Response>(&mut *stream).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn subscribe(&self) -> Result<PubStream, TransportError> {
        let stream = open_stream(
            self.publish_addr,
            self.source_address,
            self.source_publish_port,
            &self.master,
        )
        .await?;
        let frames = futures::stream::unfold(stream, |mut stream| async move {
            match read_frame::<_, PubFrame>(&mut stream).await {
                Ok(frame) => Some((frame, stream)),
                Err(e) => {
                    debug!("Publish stream ended: {}", e);
                    None
                }
            }
        });
        Ok(Box::pin(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_address_forms() {
        assert_eq!(split_master("salt", 4506), ("salt".into(), 4506));
        assert_eq!(split_master("salt:5506", 4506), ("salt".into(), 5506));
        assert_eq!(split_master("[::1]:5506", 4506), ("::1".into(), 5506));
        assert_eq!(split_master("::1", 4506), ("::1".into(), 4506));
        assert_eq!(split_master("salt:abc", 4506), ("salt:abc".into(), 4506));
    }
}
