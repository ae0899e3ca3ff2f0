// Numan Thabit 2025
// server.rs - TCP listener for reconfiguration documents

use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Most reconfiguration attempts the listener backlog will hold; attempts
/// beyond this are refused by the kernel until the supervisor catches up.
const MAX_RECONFIGURATION_BACKLOG: i32 = 3;

/// Largest accepted configuration document.
const MAX_DOCUMENT_LEN: usize = 32 * 1024;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised while operating the configuration listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket creation, bind or listen failed; fatal to the listener.
    #[error("failed to set up config socket: {0}")]
    Setup(#[source] io::Error),
    /// The configured bind address is not an IP address.
    #[error("invalid bind address '{0}'")]
    BindAddr(String),
}

/// Accepts one connection at a time and forwards each received document to
/// the reconfiguration supervisor.
///
/// A document is a single message of up to 32 KiB of UTF-8 JSON; parsing
/// and validation happen downstream so that a malformed document never
/// affects the listener.
pub struct ConfigServer {
    listener: TcpListener,
}

impl ConfigServer {
    /// Binds the listener with an explicit backlog of
    /// [`MAX_RECONFIGURATION_BACKLOG`] pending connections.
    pub fn bind(bind_addr: &str, port: u16) -> Result<Self, ServerError> {
        let ip: IpAddr = bind_addr
            .parse()
            .map_err(|_| ServerError::BindAddr(bind_addr.to_string()))?;
        let address = SocketAddr::new(ip, port);
        let domain = match ip {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, None).map_err(ServerError::Setup)?;
        socket.set_reuse_address(true).map_err(ServerError::Setup)?;
        socket.bind(&address.into()).map_err(ServerError::Setup)?;
        socket
            .listen(MAX_RECONFIGURATION_BACKLOG)
            .map_err(ServerError::Setup)?;

        let listener: TcpListener = socket.into();
        // Non-blocking accept so the stop flag is observed between polls.
        listener.set_nonblocking(true).map_err(ServerError::Setup)?;

        Ok(Self { listener })
    }

    /// The address the listener actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until the stop flag is raised or the document stream closes.
    pub fn run(self, documents: Sender<String>, stop: Arc<AtomicBool>) {
        if let Ok(addr) = self.local_addr() {
            debug!(%addr, "configuration server listening");
        }
        while !stop.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "configuration connection accepted");
                    match read_document(stream) {
                        Ok(Some(document)) => {
                            if documents.send(document).is_err() {
                                // Supervisor is gone; nothing left to serve.
                                break;
                            }
                        }
                        Ok(None) => debug!(%peer, "empty configuration message dropped"),
                        Err(err) => warn!(%peer, ?err, "failed to read configuration message"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    error!(?err, "failed to accept configuration connection");
                    break;
                }
            }
        }
        debug!("configuration server stopped");
    }
}

fn read_document(mut stream: std::net::TcpStream) -> io::Result<Option<String>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut buffer = vec![0u8; MAX_DOCUMENT_LEN];
    let read = stream.read(&mut buffer)?;
    if read == 0 {
        return Ok(None);
    }
    buffer.truncate(read);
    match String::from_utf8(buffer) {
        Ok(document) => Ok(Some(document)),
        Err(_) => {
            warn!("configuration message is not UTF-8, dropping");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn forwards_received_documents() {
        let server = ConfigServer::bind("127.0.0.1", 0).expect("bind");
        let addr = server.local_addr().expect("addr");
        let (doc_tx, doc_rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let run_stop = stop.clone();
        let handle = thread::spawn(move || server.run(doc_tx, run_stop));

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .write_all(br#"{"tmconfig":{"tmnodes":[]}}"#)
            .expect("write");
        drop(client);

        let document = doc_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("document");
        assert!(document.contains("tmnodes"));

        // Serves subsequent connections too.
        let mut second = TcpStream::connect(addr).expect("connect");
        second.write_all(b"second message").expect("write");
        drop(second);
        assert_eq!(
            doc_rx.recv_timeout(Duration::from_secs(2)).expect("second"),
            "second message"
        );

        stop.store(true, Ordering::Release);
        handle.join().expect("join");
    }

    #[test]
    fn rejects_bogus_bind_address() {
        assert!(matches!(
            ConfigServer::bind("not-an-ip", 0),
            Err(ServerError::BindAddr(_))
        ));
    }
}
