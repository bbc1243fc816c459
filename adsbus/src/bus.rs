//! The bus: every transport and peer, driven by one reactor.
//!
//! Transports (listeners, outgoing connections, child processes, files)
//! produce streams. Each stream becomes a receive peer, a send peer, or both
//! joined by a bridge. Receive peers feed the [`Dispatcher`]; the dispatcher
//! writes to send peers. When a stream dies its owning transport is told and
//! decides whether to try again.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};

use mio::Interest;
use tracing::{debug, info};
use uuid::Uuid;

use adsbus_core::{BusConfig, EndpointSpec, Format, Role, ServerInfo, Target};

use crate::exec::Exec;
use crate::file::{FileSource, FileTransport};
use crate::flow::{BridgeRegistry, BridgeRelease, CloseTarget, FlowCounts, Half, Owner, PeerId};
use crate::incoming::Incoming;
use crate::outgoing::Outgoing;
use crate::reactor::{EventHandler, Reactor, Readiness};
use crate::receive::ReceivePeer;
use crate::resolver::Resolver;
use crate::send::{Dispatcher, SendPeer};
use crate::stream::Stream;

/// What a registered fd belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Incoming(PeerId),
    Outgoing(PeerId),
    ExecLog(PeerId),
    Receive(PeerId),
    Send(PeerId),
}

/// Delayed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Incoming(PeerId),
    Outgoing(PeerId),
    Exec(PeerId),
    ExecReap(PeerId),
    File(PeerId),
}

pub type BusReactor = Reactor<Route, Wakeup>;

pub struct Bus {
    pub(crate) server: ServerInfo,
    pub(crate) config: BusConfig,
    pub(crate) resolver: Resolver,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) receivers: BTreeMap<PeerId, ReceivePeer>,
    pub(crate) incoming: BTreeMap<PeerId, Incoming>,
    pub(crate) outgoing: BTreeMap<PeerId, Outgoing>,
    pub(crate) execs: BTreeMap<PeerId, Exec>,
    pub(crate) files: BTreeMap<PeerId, FileTransport>,
    pub(crate) bridges: BridgeRegistry,
    pub(crate) counts: FlowCounts,
    next_id: PeerId,
}

impl Bus {
    /// Starts the resolver pool. Install signal handling on the reactor
    /// first so the workers inherit the blocked mask.
    pub fn new(config: BusConfig, server: ServerInfo) -> io::Result<Self> {
        let resolver = Resolver::new(config.resolver_threads)?;
        info!(server_id = %server.id, "{} starting", server.version);
        Ok(Bus {
            dispatcher: Dispatcher::new(config.max_hops),
            server,
            config,
            resolver,
            receivers: BTreeMap::new(),
            incoming: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            execs: BTreeMap::new(),
            files: BTreeMap::new(),
            bridges: BridgeRegistry::new(),
            counts: FlowCounts::default(),
            next_id: 0,
        })
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn counts(&self) -> FlowCounts {
        self.counts
    }

    pub(crate) fn next_id(&mut self) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Create the transport for `spec` and start it.
    pub fn add_endpoint(&mut self, reactor: &mut BusReactor, spec: &EndpointSpec) {
        debug!(?spec, "adding endpoint");
        match &spec.target {
            Target::Connect { host, port } => self.add_outgoing(reactor, host, port, spec.role),
            Target::Listen { host, port } => self.add_incoming(reactor, host.as_deref(), port, spec.role),
            Target::Exec { command } => self.add_exec(reactor, command, spec.role),
            Target::File { path, mode } => self.add_file(
                reactor,
                FileSource::Path {
                    path: path.clone(),
                    mode: *mode,
                },
                spec.role,
            ),
            Target::Stdin => self.add_file(reactor, FileSource::Stdin, spec.role),
            Target::Stdout => self.add_file(reactor, FileSource::Stdout, spec.role),
        }
    }

    /// Schedule `wakeup` after the backoff delay for `attempt`.
    pub(crate) fn schedule_retry(&self, reactor: &mut BusReactor, transport: Uuid, attempt: u32, wakeup: Wakeup) {
        let delay = self.config.retry.delay(attempt);
        info!(%transport, "Will retry in {:.1}s", delay.as_secs_f64());
        reactor.schedule(delay, wakeup);
    }

    // -----------------------------------------------------------------------
    // Streams to peers
    // -----------------------------------------------------------------------

    /// Turn a freshly usable stream into peers for `role`. On error nothing
    /// was registered and the stream is closed; the caller should retry.
    pub(crate) fn attach_stream(
        &mut self,
        reactor: &mut BusReactor,
        mut stream: Stream,
        role: Role,
        owner: Option<Owner>,
    ) -> io::Result<()> {
        if let Some(format) = role.send_format() {
            let greeting = self
                .dispatcher
                .greeting(format, &self.server)
                .map_err(io::Error::other)?;
            if !greeting.is_empty() {
                stream.write_all(&greeting)?;
            }
        }

        match role {
            Role::Receive => {
                self.add_receiver(reactor, stream, owner.into())?;
            }
            Role::Send(format) => {
                // Never read stdout: on a terminal that would eat keyboard input.
                let watch = !matches!(
                    owner,
                    Some(Owner::File(id)) if self.files.get(&id).is_some_and(FileTransport::is_stdout)
                );
                self.add_sender(reactor, stream, format, owner.into(), watch)?;
            }
            Role::SendReceive(format) => {
                let send_half = stream.try_clone()?;
                let coupled = stream.is_socket();
                let bridge = self.bridges.allocate();
                let send_id = self.add_sender(reactor, send_half, format, CloseTarget::Bridge(bridge), false)?;
                let receive_id = match self.add_receiver(reactor, stream, CloseTarget::Bridge(bridge)) {
                    Ok(id) => id,
                    Err(e) => {
                        self.dispatcher.remove(send_id);
                        return Err(e);
                    }
                };
                self.bridges.open(bridge, owner, send_id, receive_id, coupled);
            }
        }
        Ok(())
    }

    fn add_receiver(&mut self, reactor: &mut BusReactor, stream: Stream, close: CloseTarget) -> io::Result<PeerId> {
        let id = self.next_id();
        let token = reactor.register(&stream, Interest::READABLE, Route::Receive(id))?;
        let peer = ReceivePeer::new(stream, token, close);
        debug!(peer = %peer.id, "receive peer open");
        self.receivers.insert(id, peer);
        Ok(id)
    }

    /// `watch` registers the stream so a peer hang-up is noticed without
    /// waiting for a write to fail. Bridge send halves share their fd with
    /// the receive half and must not compete for reads.
    fn add_sender(
        &mut self,
        reactor: &mut BusReactor,
        stream: Stream,
        format: Format,
        close: CloseTarget,
        watch: bool,
    ) -> io::Result<PeerId> {
        let id = self.next_id();
        let mut peer = SendPeer::new(stream, format, close);
        if watch {
            peer.token = reactor.try_register(&peer.stream, Interest::READABLE, Route::Send(id))?;
        }
        debug!(peer = %peer.id, %format, "send peer open");
        self.dispatcher.insert(id, peer);
        Ok(id)
    }

    /// Returns whether a peer was actually closed.
    pub(crate) fn close_receive(&mut self, reactor: &mut BusReactor, id: PeerId, reason: &dyn fmt::Display) -> bool {
        let Some(peer) = self.receivers.remove(&id) else {
            return false;
        };
        reactor.unregister(peer.token);
        info!(peer = %peer.id, "Connection closed: {reason}");
        let close = peer.close;
        drop(peer);
        self.release(reactor, close, Half::Receive);
        true
    }

    pub(crate) fn close_send(&mut self, reactor: &mut BusReactor, id: PeerId, reason: &dyn fmt::Display) -> bool {
        let Some(peer) = self.dispatcher.remove(id) else {
            return false;
        };
        if let Some(token) = peer.token {
            reactor.unregister(token);
        }
        info!(peer = %peer.id, "Connection closed: {reason}");
        let close = peer.close;
        drop(peer);
        self.release(reactor, close, Half::Send);
        true
    }

    fn release(&mut self, reactor: &mut BusReactor, close: CloseTarget, half: Half) {
        match close {
            CloseTarget::None => {}
            CloseTarget::Owner(owner) => self.owner_closed(reactor, owner),
            CloseTarget::Bridge(bridge) => match self.bridges.release(bridge, half) {
                Some(BridgeRelease::Partial {
                    partner: Some((Half::Send, partner)),
                }) => {
                    self.close_send(reactor, partner, &"bridge partner closed");
                }
                Some(BridgeRelease::Partial {
                    partner: Some((Half::Receive, partner)),
                }) => {
                    self.close_receive(reactor, partner, &"bridge partner closed");
                }
                Some(BridgeRelease::Finished(Some(owner))) => self.owner_closed(reactor, owner),
                Some(BridgeRelease::Partial { partner: None }) | Some(BridgeRelease::Finished(None)) | None => {}
            },
        }
    }

    fn owner_closed(&mut self, reactor: &mut BusReactor, owner: Owner) {
        match owner {
            Owner::Outgoing(id) => self.outgoing_closed(reactor, id),
            Owner::Exec(id) => self.exec_closed(reactor, id),
            Owner::File(id) => self.file_closed(reactor, id),
        }
    }

    fn owned_by(&self, close: CloseTarget, owner: Owner) -> bool {
        match close {
            CloseTarget::None => false,
            CloseTarget::Owner(o) => o == owner,
            CloseTarget::Bridge(bridge) => self.bridges.owner(bridge) == Some(owner),
        }
    }

    /// Close every peer whose stream came from `owner`. Returns how many
    /// were closed.
    pub(crate) fn close_owned(&mut self, reactor: &mut BusReactor, owner: Owner, reason: &dyn fmt::Display) -> usize {
        let receive: Vec<PeerId> = self
            .receivers
            .iter()
            .filter(|(_, p)| self.owned_by(p.close, owner))
            .map(|(&id, _)| id)
            .collect();
        let send: Vec<PeerId> = self
            .dispatcher
            .peers()
            .filter(|(_, p)| self.owned_by(p.close, owner))
            .map(|(id, _)| id)
            .collect();
        let mut closed = 0;
        for id in receive {
            closed += usize::from(self.close_receive(reactor, id, reason));
        }
        for id in send {
            closed += usize::from(self.close_send(reactor, id, reason));
        }
        closed
    }

    fn flush_failed(&mut self, reactor: &mut BusReactor) {
        for id in self.dispatcher.take_failed() {
            self.close_send(reactor, id, &"write failed");
        }
    }

    // -----------------------------------------------------------------------
    // Peer readiness
    // -----------------------------------------------------------------------

    fn receive_ready(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(peer) = self.receivers.get_mut(&id) else {
            return;
        };
        if let Err(reason) = peer.on_readable(&mut self.dispatcher, &self.server) {
            self.close_receive(reactor, id, &reason);
        }
    }

    /// Send peers never expect input: discard it, and close on hang-up.
    fn send_ready(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(peer) = self.dispatcher.get_mut(id) else {
            return;
        };
        let mut scratch = [0u8; 512];
        let closed = loop {
            match peer.stream.read(&mut scratch) {
                Ok(0) => break Some("peer closed".to_string()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(e.to_string()),
            }
        };
        if let Some(reason) = closed {
            self.close_send(reactor, id, &reason);
        }
    }
}

impl EventHandler<Route, Wakeup> for Bus {
    fn on_ready(&mut self, reactor: &mut BusReactor, route: Route, _readiness: Readiness) {
        match route {
            Route::Receive(id) => self.receive_ready(reactor, id),
            Route::Send(id) => self.send_ready(reactor, id),
            Route::Incoming(id) => self.incoming_ready(reactor, id),
            Route::Outgoing(id) => self.outgoing_ready(reactor, id),
            Route::ExecLog(id) => self.exec_log_ready(reactor, id),
        }
        self.flush_failed(reactor);
    }

    fn on_wakeup(&mut self, reactor: &mut BusReactor, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Incoming(id) => self.incoming_wakeup(reactor, id),
            Wakeup::Outgoing(id) => self.outgoing_wakeup(reactor, id),
            Wakeup::Exec(id) => self.exec_wakeup(reactor, id),
            Wakeup::ExecReap(id) => self.exec_reap(reactor, id),
            Wakeup::File(id) => self.file_wakeup(reactor, id),
        }
        self.flush_failed(reactor);
    }

    fn on_signal(&mut self, reactor: &mut BusReactor, signal: i32) {
        if signal == libc::SIGCHLD {
            let ids: Vec<PeerId> = self.execs.keys().copied().collect();
            for id in ids {
                self.exec_reap(reactor, id);
            }
            self.flush_failed(reactor);
        }
    }

    fn should_continue(&self) -> bool {
        self.counts.is_live()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::fs::{File, OpenOptions};
    use std::io::BufRead;
    use std::io::BufReader;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use adsbus_core::RetryPolicy;

    use crate::reactor::ShutdownHandle;

    const FRAME_IN: &[u8] = b"*5D4840D6202CC3;0000000A;01;00FF;\n";
    const FRAME_OUT: &[u8] = b"*5D4840D6202CC3;\n";

    fn endpoint(flag: &str, value: &str) -> EndpointSpec {
        EndpointSpec::parse(flag, value).unwrap()
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    /// Run a bus on its own thread with `endpoints`.
    fn spawn_bus(endpoints: Vec<EndpointSpec>) -> (ShutdownHandle, thread::JoinHandle<FlowCounts>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut reactor = BusReactor::new().unwrap();
            let config = BusConfig {
                resolver_threads: 1,
                retry: RetryPolicy {
                    base_ms: 50,
                    cap_ms: 200,
                },
                ..BusConfig::default()
            };
            let mut bus = Bus::new(config, ServerInfo::generate()).unwrap();
            for spec in &endpoints {
                bus.add_endpoint(&mut reactor, spec);
            }
            tx.send(reactor.shutdown_handle()).unwrap();
            reactor.run(&mut bus).unwrap();
            bus.counts()
        });
        (rx.recv().unwrap(), handle)
    }

    fn accept_within(listener: &TcpListener, timeout: Duration) -> TcpStream {
        listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    return stream;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "bus never connected");
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("accept: {e}"),
            }
        }
    }

    fn connect_within(port: u16, timeout: Duration) -> TcpStream {
        let deadline = Instant::now() + timeout;
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return stream,
                Err(_) => {
                    assert!(Instant::now() < deadline, "bus never listened");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Keep writing a frame into `producer` until its conversion arrives on
    /// `output`. The bus may still be wiring up either end.
    fn forward_one(producer: &mut TcpStream, output: &TcpStream) {
        output.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut reader = BufReader::new(output);
        let mut line = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !line.ends_with(b"\n") {
            assert!(Instant::now() < deadline, "no frame forwarded");
            producer.write_all(FRAME_IN).unwrap();
            let _ = reader.read_until(b'\n', &mut line);
        }
        assert_eq!(line, FRAME_OUT);
    }

    fn wait_for_contents(path: &Path, expected: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let contents = std::fs::read(path).unwrap_or_default();
            if contents == expected {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "{} holds {:?}",
                path.display(),
                String::from_utf8_lossy(&contents)
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn pids_in(path: &Path) -> Vec<libc::pid_t> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }

    #[test]
    fn test_listen_receive_to_connect_send() {
        let consumer = TcpListener::bind("127.0.0.1:0").unwrap();
        let consumer_port = consumer.local_addr().unwrap().port();
        let input_port = free_port();

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("listen-receive", &format!("127.0.0.1/{input_port}")),
            endpoint("connect-send", &format!("raw=127.0.0.1/{consumer_port}")),
        ]);

        let output = accept_within(&consumer, Duration::from_secs(5));
        output.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut producer = connect_within(input_port, Duration::from_secs(5));

        // The bus may still be wiring up the output; keep feeding until a
        // frame comes through.
        let mut reader = BufReader::new(&output);
        let mut line = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !line.ends_with(b"\n") {
            assert!(Instant::now() < deadline, "no frame forwarded");
            producer.write_all(FRAME_IN).unwrap();
            let _ = reader.read_until(b'\n', &mut line);
        }
        assert_eq!(line, FRAME_OUT);

        shutdown.shutdown();
        let counts = bus.join().unwrap();
        assert_eq!(counts.inputs(), 1);
        assert_eq!(counts.outputs(), 1);
    }

    #[test]
    fn test_bridge_does_not_echo() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = upstream.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.txt");

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("connect-send-receive", &format!("raw=127.0.0.1/{port}")),
            endpoint("file-write", &format!("raw={}", out_path.display())),
        ]);

        let mut bridge = accept_within(&upstream, Duration::from_secs(5));
        bridge.write_all(FRAME_IN).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let written = std::fs::read(&out_path).unwrap_or_default();
            if written == FRAME_OUT {
                break;
            }
            assert!(Instant::now() < deadline, "file output never written");
            thread::sleep(Duration::from_millis(10));
        }

        bridge.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 64];
        let echoed = bridge.read(&mut buf);
        assert!(
            matches!(&echoed, Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)),
            "unexpected echo: {echoed:?}"
        );

        shutdown.shutdown();
        bus.join().unwrap();
    }

    #[test]
    fn test_stops_when_input_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.txt");
        let out_path = dir.path().join("out.json");
        std::fs::write(&in_path, b"*7700;\n*8D4840D6202CC371C32CE0576098;\n").unwrap();

        let (_shutdown, bus) = spawn_bus(vec![
            endpoint("file-read", &in_path.display().to_string()),
            endpoint("file-write", &format!("json={}", out_path.display())),
        ]);
        let counts = bus.join().unwrap();
        assert_eq!(counts.inputs(), 0);

        let text = std::fs::read_to_string(&out_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"type\":\"header\""));
        assert!(lines[1].contains("\"payload\":\"7700\""));
        assert!(lines[2].contains("\"type\":\"Mode-S long\""));
        assert!(lines[2].contains("\"hops\":1"));
    }

    #[test]
    fn test_outgoing_reconnects_after_hangup() {
        let consumer = TcpListener::bind("127.0.0.1:0").unwrap();
        let consumer_port = consumer.local_addr().unwrap().port();
        let input_port = free_port();

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("listen-receive", &format!("127.0.0.1/{input_port}")),
            endpoint("connect-send", &format!("raw=127.0.0.1/{consumer_port}")),
        ]);

        let first = accept_within(&consumer, Duration::from_secs(5));
        drop(first);
        let second = accept_within(&consumer, Duration::from_secs(5));
        let mut producer = connect_within(input_port, Duration::from_secs(5));
        forward_one(&mut producer, &second);

        shutdown.shutdown();
        bus.join().unwrap();
    }

    #[test]
    fn test_outgoing_retries_refused_connect() {
        let consumer_port = free_port();
        let input_port = free_port();

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("listen-receive", &format!("127.0.0.1/{input_port}")),
            endpoint("connect-send", &format!("raw=127.0.0.1/{consumer_port}")),
        ]);

        // Nothing listens yet: the first connects are refused.
        thread::sleep(Duration::from_millis(300));
        let consumer = TcpListener::bind(("127.0.0.1", consumer_port)).unwrap();
        let output = accept_within(&consumer, Duration::from_secs(5));
        let mut producer = connect_within(input_port, Duration::from_secs(5));
        forward_one(&mut producer, &output);

        shutdown.shutdown();
        bus.join().unwrap();
    }

    #[test]
    fn test_listen_retries_until_port_is_free() {
        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let input_port = blocker.local_addr().unwrap().port();
        let consumer = TcpListener::bind("127.0.0.1:0").unwrap();
        let consumer_port = consumer.local_addr().unwrap().port();

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("listen-receive", &format!("127.0.0.1/{input_port}")),
            endpoint("connect-send", &format!("raw=127.0.0.1/{consumer_port}")),
        ]);
        let output = accept_within(&consumer, Duration::from_secs(5));

        thread::sleep(Duration::from_millis(300));
        drop(blocker);
        let mut producer = connect_within(input_port, Duration::from_secs(5));
        forward_one(&mut producer, &output);

        shutdown.shutdown();
        bus.join().unwrap();
    }

    #[test]
    fn test_exited_child_is_respawned() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.txt");

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("exec-receive", r"printf '*7700;\n'"),
            endpoint("file-write", &format!("raw={}", out_path.display())),
        ]);
        wait_for_contents(&out_path, b"*7700;\n*7700;\n*7700;\n");

        shutdown.shutdown();
        bus.join().unwrap();
    }

    #[test]
    fn test_child_ignoring_sigterm_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.txt");
        let pid_path = dir.path().join("pids");
        // Closing stdin and stdout ends the stream while the process lives on.
        let command = format!(
            r"trap '' TERM; echo $$ >> '{}'; printf '*7700;\n'; exec sleep 30 0<&- 1>&-",
            pid_path.display()
        );

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("exec-receive", &command),
            endpoint("file-write", &format!("raw={}", out_path.display())),
        ]);

        let deadline = Instant::now() + Duration::from_secs(15);
        while pids_in(&pid_path).len() < 2 {
            assert!(Instant::now() < deadline, "child never respawned");
            thread::sleep(Duration::from_millis(50));
        }
        let pids = pids_in(&pid_path);
        // SAFETY: signal 0 only checks that the process exists.
        assert_eq!(unsafe { libc::kill(pids[0], 0) }, -1, "first child still alive");
        wait_for_contents(&out_path, b"*7700;\n*7700;\n");

        shutdown.shutdown();
        bus.join().unwrap();
        for &pid in &pids[1..] {
            // SAFETY: plain kill(2) on a pid this test started.
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
    }

    /// Open the write end of a FIFO once the bus has its read end open.
    fn open_fifo_writer(path: &Path) -> File {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => return file,
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    assert!(Instant::now() < deadline, "bus never opened the fifo");
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("open fifo: {e}"),
            }
        }
    }

    #[test]
    fn test_fifo_is_reopened_after_writer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("feed");
        let out_path = dir.path().join("out.txt");
        let c_path = CString::new(fifo.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let (shutdown, bus) = spawn_bus(vec![
            endpoint("file-read", &fifo.display().to_string()),
            endpoint("file-write", &format!("raw={}", out_path.display())),
        ]);

        let mut expected = Vec::new();
        for _ in 0..2 {
            let mut writer = open_fifo_writer(&fifo);
            writer.write_all(FRAME_IN).unwrap();
            drop(writer);
            expected.extend_from_slice(FRAME_OUT);
            wait_for_contents(&out_path, &expected);
            // Let the bus see EOF and close its end.
            thread::sleep(Duration::from_millis(200));
        }

        shutdown.shutdown();
        let counts = bus.join().unwrap();
        assert_eq!(counts.inputs(), 1);
    }
}
