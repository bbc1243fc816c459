//! Single-threaded readiness loop.
//!
//! Every fd the bus watches is registered with a route value `R` that tells
//! the handler what the fd belongs to. Delayed work is a `W` value in a
//! [`TimerQueue`]. Regular files cannot be polled, so they go into an
//! always-ready set that is dispatched once per iteration without blocking.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use crate::sys::{self, SignalFd};
use crate::wakeup::TimerQueue;

const WAKER: Token = Token(0);
const SIGNAL: Token = Token(1);
const FIRST_TOKEN: usize = 2;
const EVENT_CAPACITY: usize = 256;

/// What an fd is ready for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub closed: bool,
}

impl Readiness {
    /// Reported for fds in the always-ready set.
    pub const ALWAYS: Readiness = Readiness {
        readable: true,
        writable: true,
        error: false,
        closed: false,
    };
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            closed: event.is_read_closed() || event.is_write_closed(),
        }
    }
}

/// Callbacks driven by [`Reactor::run`].
pub trait EventHandler<R, W> {
    fn on_ready(&mut self, reactor: &mut Reactor<R, W>, route: R, readiness: Readiness);

    fn on_wakeup(&mut self, reactor: &mut Reactor<R, W>, wakeup: W);

    /// Any installed signal other than SIGINT/SIGTERM.
    fn on_signal(&mut self, _reactor: &mut Reactor<R, W>, _signal: i32) {}

    /// Checked after every iteration; `false` ends the loop.
    fn should_continue(&self) -> bool {
        true
    }
}

/// Stops a running reactor from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake event loop: {e}");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Registration<R> {
    fd: RawFd,
    route: R,
}

pub struct Reactor<R, W> {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    signals: Option<SignalFd>,
    routes: HashMap<Token, Registration<R>>,
    always_ready: BTreeMap<Token, R>,
    timers: TimerQueue<W>,
    next_token: usize,
}

impl<R: Copy, W> Reactor<R, W> {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Reactor {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            signals: None,
            routes: HashMap::new(),
            always_ready: BTreeMap::new(),
            timers: TimerQueue::new(),
            next_token: FIRST_TOKEN,
        })
    }

    /// Route SIGINT, SIGTERM and SIGCHLD through the loop. Call before any
    /// thread is spawned.
    pub fn install_signals(&mut self) -> io::Result<()> {
        let signals = SignalFd::install(&sys::HANDLED)?;
        let fd = signals.as_raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), SIGNAL, Interest::READABLE)?;
        self.signals = Some(signals);
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Watch `fd`. Returns `Ok(None)` if the fd type cannot be polled
    /// (regular files).
    pub fn try_register(
        &mut self,
        fd: &impl AsRawFd,
        interest: Interest,
        route: R,
    ) -> io::Result<Option<Token>> {
        let raw = fd.as_raw_fd();
        let token = self.allocate_token();
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&raw), token, interest)
        {
            Ok(()) => {
                self.routes.insert(token, Registration { fd: raw, route });
                Ok(Some(token))
            }
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Watch `fd`, falling back to the always-ready set for fds that cannot
    /// be polled.
    pub fn register(&mut self, fd: &impl AsRawFd, interest: Interest, route: R) -> io::Result<Token> {
        if let Some(token) = self.try_register(fd, interest, route)? {
            return Ok(token);
        }
        let token = self.allocate_token();
        debug!(fd = fd.as_raw_fd(), "fd is not pollable; treating as always ready");
        self.always_ready.insert(token, route);
        Ok(token)
    }

    /// Stop watching. Must be called before the fd is closed.
    pub fn unregister(&mut self, token: Token) {
        if let Some(reg) = self.routes.remove(&token) {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&reg.fd)) {
                debug!(fd = reg.fd, "deregister failed: {e}");
            }
        }
        self.always_ready.remove(&token);
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.routes.contains_key(&token) || self.always_ready.contains_key(&token)
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.routes.len() + self.always_ready.len()
    }

    pub fn schedule(&mut self, delay: Duration, wakeup: W) {
        self.timers.schedule(delay, wakeup);
    }

    #[cfg(test)]
    pub(crate) fn pending_wakeups(&self) -> usize {
        self.timers.len()
    }

    /// Loop until shut down or the handler reports nothing left to do.
    pub fn run<H: EventHandler<R, W>>(&mut self, handler: &mut H) -> io::Result<()> {
        while !self.shutdown.load(Ordering::SeqCst) && handler.should_continue() {
            self.turn(handler)?;
        }
        Ok(())
    }

    /// One iteration: wait, dispatch ready fds, then fire due timers.
    pub fn turn<H: EventHandler<R, W>>(&mut self, handler: &mut H) -> io::Result<()> {
        let timeout = if self.always_ready.is_empty() {
            self.timers.next_deadline(Instant::now())
        } else {
            Some(Duration::ZERO)
        };
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
        }

        let mut ready = Vec::new();
        let mut signalled = false;
        for event in self.events.iter() {
            match event.token() {
                WAKER => {}
                SIGNAL => signalled = true,
                token => {
                    if let Some(reg) = self.routes.get(&token) {
                        ready.push((token, reg.route, Readiness::from(event)));
                    }
                }
            }
        }
        ready.extend(
            self.always_ready
                .iter()
                .map(|(&token, &route)| (token, route, Readiness::ALWAYS)),
        );

        if signalled {
            let pending = match &self.signals {
                Some(signals) => signals.read_pending()?,
                None => Vec::new(),
            };
            for signal in pending {
                if signal == libc::SIGINT || signal == libc::SIGTERM {
                    info!("Received signal {signal}; shutting down");
                    self.shutdown.store(true, Ordering::SeqCst);
                } else {
                    handler.on_signal(self, signal);
                }
            }
        }

        for (token, route, readiness) in ready {
            // An earlier callback this iteration may have torn this fd down.
            if self.is_registered(token) {
                handler.on_ready(self, route, readiness);
            }
        }

        let now = Instant::now();
        while let Some(wakeup) = self.timers.pop_expired(now) {
            handler.on_wakeup(self, wakeup);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
