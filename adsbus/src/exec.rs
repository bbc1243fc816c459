//! Child processes. The command runs under `/bin/sh -c` in its own process
//! group, with stdin and stdout on one end of a socket pair and stderr on a
//! second pair whose lines are logged. The child is restarted whenever it
//! exits or its stream closes.

use std::io::{self, Read};
use std::mem;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use mio::{Interest, Token};
use tracing::{debug, info, warn};
use uuid::Uuid;

use adsbus_core::Role;

use crate::bus::{Bus, BusReactor, Route, Wakeup};
use crate::flow::{Owner, PeerId};
use crate::stream::Stream;
use crate::sys;

/// How often a stopping child is checked for exit.
const REAP_POLL: Duration = Duration::from_millis(100);
/// Polls after SIGTERM before escalating to SIGKILL.
const KILL_AFTER_POLLS: u32 = 50;
/// Longest stderr line logged in one piece.
const LOG_LINE_MAX: usize = 4096;

pub struct Exec {
    pub id: Uuid,
    command: String,
    role: Role,
    attempt: u32,
    state: ExecState,
    log: Option<ChildLog>,
}

enum ExecState {
    /// No child. Either waiting for a retry timer, or the child was reaped
    /// and its stream is being torn down.
    Idle,
    Running(Child),
    /// Stream closed and SIGTERM sent; waiting for exit.
    Stopping { child: Child, polls: u32 },
}

struct ChildLog {
    stream: UnixStream,
    token: Token,
    partial: Vec<u8>,
}

impl Drop for Exec {
    fn drop(&mut self) {
        if let ExecState::Running(child) | ExecState::Stopping { child, .. } = &mut self.state {
            let _ = sys::kill_group(child.id(), libc::SIGTERM);
            let _ = child.try_wait();
        }
    }
}

struct Spawned {
    child: Child,
    data: UnixStream,
    log: UnixStream,
}

fn spawn_child(command: &str) -> io::Result<Spawned> {
    let (data, child_data) = UnixStream::pair()?;
    let (log, child_log) = UnixStream::pair()?;
    let child_stdin = OwnedFd::from(child_data.try_clone()?);

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::from(child_stdin))
        .stdout(Stdio::from(OwnedFd::from(child_data)))
        .stderr(Stdio::from(OwnedFd::from(child_log)))
        .process_group(0);
    let child = cmd.spawn()?;
    // The command holds the child's ends; EOF is only seen once they close.
    drop(cmd);

    data.set_nonblocking(true)?;
    log.set_nonblocking(true)?;
    Ok(Spawned { child, data, log })
}

/// Split complete lines off `partial`. With `flush`, the remainder counts as
/// a line too.
fn take_lines(partial: &mut Vec<u8>, flush: bool) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = partial.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
    }
    if (flush && !partial.is_empty()) || partial.len() >= LOG_LINE_MAX {
        lines.push(String::from_utf8_lossy(partial).trim_end().to_string());
        partial.clear();
    }
    lines
}

impl Bus {
    pub(crate) fn add_exec(&mut self, reactor: &mut BusReactor, command: &str, role: Role) {
        let id = self.next_id();
        self.counts.add(role);
        self.execs.insert(
            id,
            Exec {
                id: Uuid::new_v4(),
                command: command.to_string(),
                role,
                attempt: 0,
                state: ExecState::Idle,
                log: None,
            },
        );
        self.exec_spawn(reactor, id);
    }

    fn exec_spawn(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(ex) = self.execs.get_mut(&id) else {
            return;
        };
        let transport = ex.id;
        info!(%transport, "Executing: {}", ex.command);
        let Spawned { child, data, log } = match spawn_child(&ex.command) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(%transport, "Failed to execute: {e}");
                self.exec_retry(reactor, id);
                return;
            }
        };
        info!(%transport, "Child started as process {}", child.id());
        ex.attempt = 0;
        ex.state = ExecState::Running(child);

        if let Some(old) = ex.log.take() {
            reactor.unregister(old.token);
        }
        match reactor.register(&log, Interest::READABLE, Route::ExecLog(id)) {
            Ok(token) => {
                ex.log = Some(ChildLog {
                    stream: log,
                    token,
                    partial: Vec::new(),
                })
            }
            Err(e) => warn!(%transport, "Child output will not be logged: {e}"),
        }

        let role = ex.role;
        if let Err(e) = self.attach_stream(reactor, Stream::Unix(data), role, Some(Owner::Exec(id))) {
            warn!(%transport, "Child stream unusable: {e}");
            self.exec_closed(reactor, id);
        }
    }

    fn exec_retry(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(ex) = self.execs.get_mut(&id) else {
            return;
        };
        ex.state = ExecState::Idle;
        let attempt = ex.attempt;
        ex.attempt = ex.attempt.saturating_add(1);
        let transport = ex.id;
        self.schedule_retry(reactor, transport, attempt, Wakeup::Exec(id));
    }

    pub(crate) fn exec_wakeup(&mut self, reactor: &mut BusReactor, id: PeerId) {
        if let Some(Exec {
            state: ExecState::Idle,
            ..
        }) = self.execs.get(&id)
        {
            self.exec_spawn(reactor, id);
        }
    }

    /// The child's stream is gone: stop the child, then retry once reaped.
    pub(crate) fn exec_closed(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(ex) = self.execs.get_mut(&id) else {
            return;
        };
        let transport = ex.id;
        match mem::replace(&mut ex.state, ExecState::Idle) {
            ExecState::Running(mut child) => {
                info!(%transport, "Child stream closed; stopping process {}", child.id());
                if let Err(e) = sys::kill_group(child.id(), libc::SIGTERM) {
                    debug!(%transport, "kill: {e}");
                }
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(%transport, "Child exited: {status}");
                        self.exec_retry(reactor, id);
                    }
                    _ => {
                        ex.state = ExecState::Stopping { child, polls: 0 };
                        reactor.schedule(REAP_POLL, Wakeup::ExecReap(id));
                    }
                }
            }
            // Child already reaped.
            ExecState::Idle => self.exec_retry(reactor, id),
            stopping @ ExecState::Stopping { .. } => ex.state = stopping,
        }
    }

    /// Check whether the child has exited. Runs on SIGCHLD and on the
    /// polling timer while stopping.
    pub(crate) fn exec_reap(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(ex) = self.execs.get_mut(&id) else {
            return;
        };
        let transport = ex.id;
        match mem::replace(&mut ex.state, ExecState::Idle) {
            ExecState::Running(mut child) => match child.try_wait() {
                Ok(Some(status)) => {
                    info!(%transport, "Child exited: {status}");
                    // Idle now; closing the stream retries. With no stream
                    // left to close, retry directly.
                    if self.close_owned(reactor, Owner::Exec(id), &"child exited") == 0 {
                        self.exec_retry(reactor, id);
                    }
                }
                Ok(None) => ex.state = ExecState::Running(child),
                Err(e) => {
                    warn!(%transport, "wait failed: {e}");
                    ex.state = ExecState::Running(child);
                }
            },
            ExecState::Stopping { mut child, polls } => match child.try_wait() {
                Ok(Some(status)) => {
                    info!(%transport, "Child exited: {status}");
                    self.exec_retry(reactor, id);
                }
                _ => {
                    if polls == KILL_AFTER_POLLS {
                        warn!(%transport, "Process {} ignored SIGTERM; killing", child.id());
                        let _ = sys::kill_group(child.id(), libc::SIGKILL);
                    }
                    ex.state = ExecState::Stopping {
                        child,
                        polls: polls.saturating_add(1),
                    };
                    reactor.schedule(REAP_POLL, Wakeup::ExecReap(id));
                }
            },
            ExecState::Idle => {}
        }
    }

    /// Log whatever the child wrote to stderr.
    pub(crate) fn exec_log_ready(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(ex) = self.execs.get_mut(&id) else {
            return;
        };
        let Some(log) = ex.log.as_mut() else {
            return;
        };
        let mut buf = [0u8; 1024];
        let eof = loop {
            match log.stream.read(&mut buf) {
                Ok(0) => break true,
                Ok(n) => log.partial.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break true,
            }
        };
        for line in take_lines(&mut log.partial, eof) {
            info!(transport = %ex.id, "(child output) {line}");
        }
        if eof {
            reactor.unregister(log.token);
            ex.log = None;
        }
    }
}
