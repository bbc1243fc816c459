//! Outgoing TCP connections that reconnect forever.
//!
//! Resolve, then try each address in turn with a non-blocking connect. Any
//! failure, or the connection closing later, goes back through a backoff
//! delay to a fresh resolve.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpStream};

use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use uuid::Uuid;

use adsbus_core::Role;

use crate::bus::{Bus, BusReactor, Route, Wakeup};
use crate::flow::{Owner, PeerId};
use crate::resolver::ResolveTicket;
use crate::stream::{set_keepalive, Stream};

pub struct Outgoing {
    pub id: Uuid,
    host: String,
    port: String,
    role: Role,
    attempt: u32,
    state: OutgoingState,
}

enum OutgoingState {
    /// Waiting for a retry timer.
    Idle,
    Resolving {
        ticket: ResolveTicket,
        token: Token,
    },
    Connecting {
        socket: Socket,
        addr: SocketAddr,
        remaining: VecDeque<SocketAddr>,
        token: Token,
    },
    /// The stream belongs to its peers now.
    Connected,
}

/// Begin a non-blocking connect. `true` if it completed immediately.
fn start_connect(addr: SocketAddr) -> io::Result<(Socket, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok((socket, true)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok((socket, false)),
        Err(e) => Err(e),
    }
}

impl Bus {
    pub(crate) fn add_outgoing(&mut self, reactor: &mut BusReactor, host: &str, port: &str, role: Role) {
        let id = self.next_id();
        self.counts.add(role);
        self.outgoing.insert(
            id,
            Outgoing {
                id: Uuid::new_v4(),
                host: host.to_string(),
                port: port.to_string(),
                role,
                attempt: 0,
                state: OutgoingState::Idle,
            },
        );
        self.outgoing_resolve(reactor, id);
    }

    fn outgoing_resolve(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(out) = self.outgoing.get_mut(&id) else {
            return;
        };
        info!(transport = %out.id, "Resolving {}/{}...", out.host, out.port);
        let registered = self
            .resolver
            .resolve(Some(&out.host), &out.port, false)
            .and_then(|ticket| {
                let token = reactor.register(&ticket, Interest::READABLE, Route::Outgoing(id))?;
                Ok((ticket, token))
            });
        match registered {
            Ok((ticket, token)) => out.state = OutgoingState::Resolving { ticket, token },
            Err(e) => {
                warn!(transport = %out.id, "Failed to start lookup: {e}");
                self.outgoing_retry(reactor, id);
            }
        }
    }

    pub(crate) fn outgoing_ready(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(out) = self.outgoing.get_mut(&id) else {
            return;
        };
        match mem::replace(&mut out.state, OutgoingState::Idle) {
            OutgoingState::Resolving { mut ticket, token } => {
                let Some(result) = ticket.try_result() else {
                    out.state = OutgoingState::Resolving { ticket, token };
                    return;
                };
                reactor.unregister(token);
                match result {
                    Ok(addrs) => self.outgoing_connect(reactor, id, addrs.into()),
                    Err(e) => {
                        warn!(transport = %out.id, "Failed to resolve {}/{}: {e}", out.host, out.port);
                        self.outgoing_retry(reactor, id);
                    }
                }
            }
            OutgoingState::Connecting {
                socket,
                addr,
                remaining,
                token,
            } => {
                reactor.unregister(token);
                let result = match socket.take_error() {
                    Ok(None) => socket.peer_addr().map(|_| ()),
                    Ok(Some(e)) | Err(e) => Err(e),
                };
                match result {
                    Ok(()) => self.outgoing_connected(reactor, id, socket, addr),
                    Err(e) => {
                        warn!(transport = %out.id, "Can't connect to {addr}: {e}");
                        drop(socket);
                        self.outgoing_connect(reactor, id, remaining);
                    }
                }
            }
            other => out.state = other,
        }
    }

    /// Try the next address in `remaining`, or fall back to a retry.
    fn outgoing_connect(&mut self, reactor: &mut BusReactor, id: PeerId, mut remaining: VecDeque<SocketAddr>) {
        loop {
            let Some(out) = self.outgoing.get_mut(&id) else {
                return;
            };
            let Some(addr) = remaining.pop_front() else {
                warn!(transport = %out.id, "Can't connect to any address of {}/{}", out.host, out.port);
                self.outgoing_retry(reactor, id);
                return;
            };
            info!(transport = %out.id, "Connecting to {addr}...");
            match start_connect(addr) {
                Ok((socket, true)) => {
                    self.outgoing_connected(reactor, id, socket, addr);
                    return;
                }
                Ok((socket, false)) => match reactor.register(&socket, Interest::WRITABLE, Route::Outgoing(id)) {
                    Ok(token) => {
                        out.state = OutgoingState::Connecting {
                            socket,
                            addr,
                            remaining,
                            token,
                        };
                        return;
                    }
                    Err(e) => warn!(transport = %out.id, "Can't watch connection to {addr}: {e}"),
                },
                Err(e) => warn!(transport = %out.id, "Can't connect to {addr}: {e}"),
            }
        }
    }

    fn outgoing_connected(&mut self, reactor: &mut BusReactor, id: PeerId, socket: Socket, addr: SocketAddr) {
        let Some(out) = self.outgoing.get_mut(&id) else {
            return;
        };
        let tcp: TcpStream = socket.into();
        if let Err(e) = set_keepalive(&tcp) {
            debug!(transport = %out.id, "keepalive: {e}");
        }
        info!(transport = %out.id, "Connected to {addr}");
        out.attempt = 0;
        out.state = OutgoingState::Connected;
        let role = out.role;
        let transport = out.id;
        if let Err(e) = self.attach_stream(reactor, Stream::Tcp(tcp), role, Some(Owner::Outgoing(id))) {
            warn!(%transport, "Connection to {addr} unusable: {e}");
            self.outgoing_retry(reactor, id);
        }
    }

    fn outgoing_retry(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(out) = self.outgoing.get_mut(&id) else {
            return;
        };
        out.state = OutgoingState::Idle;
        let attempt = out.attempt;
        out.attempt = out.attempt.saturating_add(1);
        let transport = out.id;
        self.schedule_retry(reactor, transport, attempt, Wakeup::Outgoing(id));
    }

    pub(crate) fn outgoing_wakeup(&mut self, reactor: &mut BusReactor, id: PeerId) {
        if let Some(Outgoing {
            state: OutgoingState::Idle,
            ..
        }) = self.outgoing.get(&id)
        {
            self.outgoing_resolve(reactor, id);
        }
    }

    /// The connection's peers are gone.
    pub(crate) fn outgoing_closed(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(out) = self.outgoing.get(&id) else {
            return;
        };
        info!(transport = %out.id, "Peer disconnected; reconnecting...");
        self.outgoing_retry(reactor, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_start_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (socket, _done) = start_connect(listener.local_addr().unwrap()).unwrap();
        // Loopback connects complete quickly; the accept proves the SYN went out.
        let (_peer, from) = listener.accept().unwrap();
        assert_eq!(from, socket.local_addr().unwrap().as_socket().unwrap());
    }
}
