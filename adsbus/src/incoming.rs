//! TCP listeners. Each accepted connection becomes peers of its own; the
//! listener itself stays up for the life of the bus once bound.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener};

use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use uuid::Uuid;

use adsbus_core::Role;

use crate::bus::{Bus, BusReactor, Route, Wakeup};
use crate::flow::PeerId;
use crate::resolver::ResolveTicket;
use crate::stream::{set_keepalive, Stream};

const LISTEN_BACKLOG: i32 = 255;

pub struct Incoming {
    pub id: Uuid,
    host: Option<String>,
    port: String,
    role: Role,
    attempt: u32,
    state: IncomingState,
}

enum IncomingState {
    Idle,
    Resolving { ticket: ResolveTicket, token: Token },
    Listening { listener: TcpListener, token: Token },
}

impl Incoming {
    fn label(&self) -> String {
        match &self.host {
            Some(host) => format!("{host}/{}", self.port),
            None => format!("*/{}", self.port),
        }
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Accept IPv4 too when the host allows dual-stack sockets.
        let _ = socket.set_only_v6(false);
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl Bus {
    pub(crate) fn add_incoming(&mut self, reactor: &mut BusReactor, host: Option<&str>, port: &str, role: Role) {
        let id = self.next_id();
        self.counts.add(role);
        self.incoming.insert(
            id,
            Incoming {
                id: Uuid::new_v4(),
                host: host.map(str::to_string),
                port: port.to_string(),
                role,
                attempt: 0,
                state: IncomingState::Idle,
            },
        );
        self.incoming_resolve(reactor, id);
    }

    fn incoming_resolve(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(inc) = self.incoming.get_mut(&id) else {
            return;
        };
        info!(transport = %inc.id, "Resolving {}...", inc.label());
        let registered = self
            .resolver
            .resolve(inc.host.as_deref(), &inc.port, true)
            .and_then(|ticket| {
                let token = reactor.register(&ticket, Interest::READABLE, Route::Incoming(id))?;
                Ok((ticket, token))
            });
        match registered {
            Ok((ticket, token)) => inc.state = IncomingState::Resolving { ticket, token },
            Err(e) => {
                warn!(transport = %inc.id, "Failed to start lookup: {e}");
                self.incoming_retry(reactor, id);
            }
        }
    }

    pub(crate) fn incoming_ready(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(inc) = self.incoming.get_mut(&id) else {
            return;
        };
        match mem::replace(&mut inc.state, IncomingState::Idle) {
            IncomingState::Resolving { mut ticket, token } => {
                let Some(result) = ticket.try_result() else {
                    inc.state = IncomingState::Resolving { ticket, token };
                    return;
                };
                reactor.unregister(token);
                match result {
                    Ok(addrs) => self.incoming_bind(reactor, id, addrs),
                    Err(e) => {
                        warn!(transport = %inc.id, "Failed to resolve {}: {e}", inc.label());
                        self.incoming_retry(reactor, id);
                    }
                }
            }
            IncomingState::Listening { listener, token } => {
                let accepted = accept_all(&listener);
                inc.state = IncomingState::Listening { listener, token };
                let role = inc.role;
                let transport = inc.id;
                for (stream, addr) in accepted {
                    info!(%transport, "New incoming connection from {addr}");
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(%transport, "Dropping connection from {addr}: {e}");
                        continue;
                    }
                    if let Err(e) = set_keepalive(&stream) {
                        debug!(%transport, "keepalive: {e}");
                    }
                    if let Err(e) = self.attach_stream(reactor, Stream::Tcp(stream), role, None) {
                        warn!(%transport, "Connection from {addr} unusable: {e}");
                    }
                }
            }
            IncomingState::Idle => {}
        }
    }

    fn incoming_bind(&mut self, reactor: &mut BusReactor, id: PeerId, addrs: Vec<SocketAddr>) {
        let Some(inc) = self.incoming.get_mut(&id) else {
            return;
        };
        for addr in addrs {
            let listener = match bind_listener(addr) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(transport = %inc.id, "Failed to bind {addr}: {e}");
                    continue;
                }
            };
            match reactor.register(&listener, Interest::READABLE, Route::Incoming(id)) {
                Ok(token) => {
                    info!(transport = %inc.id, "Listening on {addr}");
                    inc.attempt = 0;
                    inc.state = IncomingState::Listening { listener, token };
                    return;
                }
                Err(e) => warn!(transport = %inc.id, "Can't watch listener on {addr}: {e}"),
            }
        }
        self.incoming_retry(reactor, id);
    }

    fn incoming_retry(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(inc) = self.incoming.get_mut(&id) else {
            return;
        };
        inc.state = IncomingState::Idle;
        let attempt = inc.attempt;
        inc.attempt = inc.attempt.saturating_add(1);
        let transport = inc.id;
        self.schedule_retry(reactor, transport, attempt, Wakeup::Incoming(id));
    }

    pub(crate) fn incoming_wakeup(&mut self, reactor: &mut BusReactor, id: PeerId) {
        if let Some(Incoming {
            state: IncomingState::Idle,
            ..
        }) = self.incoming.get(&id)
        {
            self.incoming_resolve(reactor, id);
        }
    }
}

/// Accept until the backlog is empty.
fn accept_all(listener: &TcpListener) -> Vec<(std::net::TcpStream, SocketAddr)> {
    let mut accepted = Vec::new();
    loop {
        match listener.accept() {
            Ok(conn) => accepted.push(conn),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
    accepted
}
