//! Name resolution on a small worker pool.
//!
//! `getaddrinfo` blocks, so lookups run on dedicated threads. Each request
//! comes back through a [`ResolveTicket`]: a result channel plus a socket the
//! worker writes one byte to when the result is ready, so the reactor can
//! poll for completion. Dropping a ticket abandons the lookup; the worker's
//! result is discarded.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

struct Request {
    host: Option<String>,
    port: String,
    passive: bool,
    reply: Sender<io::Result<Vec<SocketAddr>>>,
    notify: UnixStream,
}

pub struct Resolver {
    requests: Option<Sender<Request>>,
    workers: Vec<JoinHandle<()>>,
}

impl Resolver {
    pub fn new(threads: usize) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Request>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads.max(1));
        for n in 0..threads.max(1) {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("resolver-{n}"))
                .spawn(move || worker(rx))?;
            workers.push(handle);
        }
        Ok(Resolver {
            requests: Some(tx),
            workers,
        })
    }

    /// Start a lookup. `passive` with no host yields the wildcard addresses
    /// for listening.
    pub fn resolve(&self, host: Option<&str>, port: &str, passive: bool) -> io::Result<ResolveTicket> {
        let (notify_rx, notify_tx) = UnixStream::pair()?;
        notify_rx.set_nonblocking(true)?;
        let (reply, result) = mpsc::channel();
        let request = Request {
            host: host.map(str::to_string),
            port: port.to_string(),
            passive,
            reply,
            notify: notify_tx,
        };
        self.requests
            .as_ref()
            .ok_or_else(|| io::Error::other("resolver stopped"))?
            .send(request)
            .map_err(|_| io::Error::other("resolver workers gone"))?;
        Ok(ResolveTicket {
            notify: notify_rx,
            result,
        })
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // Closing the channel ends every worker's recv loop.
        self.requests.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker(rx: Arc<Mutex<Receiver<Request>>>) {
    loop {
        let request = {
            let Ok(guard) = rx.lock() else { return };
            match guard.recv() {
                Ok(request) => request,
                Err(_) => return,
            }
        };
        let result = lookup(request.host.as_deref(), &request.port, request.passive);
        debug!(host = ?request.host, port = %request.port, ok = result.is_ok(), "lookup done");
        if request.reply.send(result).is_ok() {
            let mut notify = request.notify;
            let _ = notify.write_all(&[1]);
        }
    }
}

/// Blocking lookup. Ports must be numeric.
pub fn lookup(host: Option<&str>, port: &str, passive: bool) -> io::Result<Vec<SocketAddr>> {
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port {port:?}")))?;
    let addrs: Vec<SocketAddr> = match host {
        None if passive => vec![
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
        ],
        None => vec![
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port),
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
        ],
        Some(host) => (host, port).to_socket_addrs()?.collect(),
    };
    if addrs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no addresses"));
    }
    Ok(addrs)
}

/// Pending lookup result.
pub struct ResolveTicket {
    notify: UnixStream,
    result: Receiver<io::Result<Vec<SocketAddr>>>,
}

impl ResolveTicket {
    /// The result, once the worker has produced it.
    pub fn try_result(&mut self) -> Option<io::Result<Vec<SocketAddr>>> {
        let mut scratch = [0u8; 8];
        while let Ok(n) = self.notify.read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(io::Error::other("resolver worker exited"))),
        }
    }
}

impl AsRawFd for ResolveTicket {
    fn as_raw_fd(&self) -> RawFd {
        self.notify.as_raw_fd()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{EventHandler, Reactor, Readiness};
    use std::time::{Duration, Instant};

    fn wait(ticket: &mut ResolveTicket) -> io::Result<Vec<SocketAddr>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(result) = ticket.try_result() {
                return result;
            }
            assert!(Instant::now() < deadline, "lookup timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_passive_wildcard() {
        let addrs = lookup(None, "30005", true).unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv6());
        assert!(addrs[0].ip().is_unspecified());
        assert_eq!(addrs[1].port(), 30005);
    }

    #[test]
    fn test_numeric_host() {
        let addrs = lookup(Some("127.0.0.1"), "80", false).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse().unwrap()]);
    }

    #[test]
    fn test_rejects_service_names() {
        let err = lookup(Some("127.0.0.1"), "http", false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_pool_round_trip() {
        let resolver = Resolver::new(2).unwrap();
        let mut a = resolver.resolve(Some("127.0.0.1"), "1234", false).unwrap();
        let mut b = resolver.resolve(None, "4321", true).unwrap();
        assert_eq!(wait(&mut a).unwrap()[0].port(), 1234);
        assert_eq!(wait(&mut b).unwrap().len(), 2);
    }

    #[test]
    fn test_dropped_ticket_is_harmless() {
        let resolver = Resolver::new(1).unwrap();
        drop(resolver.resolve(Some("127.0.0.1"), "1", false).unwrap());
        let mut ticket = resolver.resolve(Some("127.0.0.1"), "2", false).unwrap();
        assert_eq!(wait(&mut ticket).unwrap()[0].port(), 2);
    }

    struct Completion {
        ticket: ResolveTicket,
        result: Option<io::Result<Vec<SocketAddr>>>,
    }

    impl EventHandler<(), ()> for Completion {
        fn on_ready(&mut self, _reactor: &mut Reactor<(), ()>, _route: (), _readiness: Readiness) {
            if let Some(result) = self.ticket.try_result() {
                self.result = Some(result);
            }
        }

        fn on_wakeup(&mut self, _reactor: &mut Reactor<(), ()>, _wakeup: ()) {}

        fn should_continue(&self) -> bool {
            self.result.is_none()
        }
    }

    #[test]
    fn test_completion_wakes_reactor() {
        let resolver = Resolver::new(1).unwrap();
        let mut reactor: Reactor<(), ()> = Reactor::new().unwrap();
        let ticket = resolver.resolve(Some("::1"), "30003", false).unwrap();
        reactor.register(&ticket, mio::Interest::READABLE, ()).unwrap();

        let mut handler = Completion { ticket, result: None };
        reactor.run(&mut handler).unwrap();
        let addrs = handler.result.unwrap().unwrap();
        assert_eq!(addrs, vec!["[::1]:30003".parse().unwrap()]);
    }
}
