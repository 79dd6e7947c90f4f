//! The event loop itself.
//!
//! Each call to [`EventLoop::run_once`] is one tick:
//!
//! ```text
//!   wait budget = clamp(nearest timer - now, 10ms, 1s)
//!        │
//!        ▼
//!   mio::Poll::poll ──> snapshot ready (token, direction, callback)
//!        │
//!        ▼
//!   snapshot due timers ──> run timers ──> run file callbacks
//! ```
//!
//! Callbacks receive the loop and the server state, so they can register,
//! unregister, add timers or stop the loop. Anything a callback cancels takes
//! effect immediately: a snapshotted callback that is no longer registered
//! when its turn comes is skipped.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Lower bound of the poll wait.
pub const MIN_WAIT: Duration = Duration::from_millis(10);

/// Upper bound of the poll wait.
pub const MAX_WAIT: Duration = Duration::from_millis(1000);

const EVENTS_CAPACITY: usize = 1024;

/// Callback for readiness of a registered source.
pub type FileProc<S> = Rc<dyn Fn(&mut EventLoop<S>, &mut S, Token)>;

/// Callback for a timer.
pub type TimeProc<S> = Rc<dyn Fn(&mut EventLoop<S>, &mut S, TimerId)>;

/// Errors from the poller.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ReactorError {
    fn io(context: &'static str, source: io::Error) -> Self {
        ReactorError::Io { context, source }
    }
}

/// Which readiness a file callback is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Readable,
    Writable,
}

/// Whether a timer re-arms after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Repeating,
    Once,
}

/// Identifies a timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Registration<S> {
    readable: Option<FileProc<S>>,
    writable: Option<FileProc<S>>,
}

impl<S> Registration<S> {
    fn slot(&self, direction: Direction) -> &Option<FileProc<S>> {
        match direction {
            Direction::Readable => &self.readable,
            Direction::Writable => &self.writable,
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut Option<FileProc<S>> {
        match direction {
            Direction::Readable => &mut self.readable,
            Direction::Writable => &mut self.writable,
        }
    }

    fn interest(&self) -> Option<Interest> {
        match (self.readable.is_some(), self.writable.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct TimeEvent<S> {
    id: TimerId,
    kind: TimerKind,
    interval: Duration,
    when: Instant,
    proc: TimeProc<S>,
}

/// A single-threaded readiness reactor with timers.
pub struct EventLoop<S> {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, Registration<S>>,
    timers: VecDeque<TimeEvent<S>>,
    next_timer_id: u64,
    stopped: bool,
}

impl<S> fmt::Debug for EventLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("registrations", &self.registrations.len())
            .field("timers", &self.timers.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl<S> EventLoop<S> {
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(|e| ReactorError::io("create poll failed", e))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registrations: HashMap::new(),
            timers: VecDeque::new(),
            next_timer_id: 0,
            stopped: false,
        })
    }

    /// Registers `callback` for `direction` readiness of `source`.
    ///
    /// Registering the direction a token already has is a no-op that keeps
    /// the existing callback. Adding the other direction widens the interest.
    pub fn register<Src, F>(
        &mut self,
        source: &mut Src,
        token: Token,
        direction: Direction,
        callback: F,
    ) -> Result<(), ReactorError>
    where
        Src: Source + ?Sized,
        F: Fn(&mut EventLoop<S>, &mut S, Token) + 'static,
    {
        match self.registrations.get_mut(&token) {
            Some(reg) => {
                if reg.slot(direction).is_some() {
                    return Ok(());
                }
                *reg.slot_mut(direction) = Some(Rc::new(callback));
                let interest = reg.interest();
                if let Some(interest) = interest {
                    if let Err(e) = self.poll.registry().reregister(source, token, interest) {
                        if let Some(reg) = self.registrations.get_mut(&token) {
                            *reg.slot_mut(direction) = None;
                        }
                        return Err(ReactorError::io("reregister failed", e));
                    }
                }
            }
            None => {
                let mut reg = Registration {
                    readable: None,
                    writable: None,
                };
                *reg.slot_mut(direction) = Some(Rc::new(callback));
                let interest = match direction {
                    Direction::Readable => Interest::READABLE,
                    Direction::Writable => Interest::WRITABLE,
                };
                self.poll
                    .registry()
                    .register(source, token, interest)
                    .map_err(|e| ReactorError::io("register failed", e))?;
                self.registrations.insert(token, reg);
            }
        }
        trace!(token = token.0, ?direction, "Registered");
        Ok(())
    }

    /// Removes the `direction` callback of `token`. The source is deregistered
    /// once no direction is left. Unregistering an absent direction is a no-op.
    pub fn unregister<Src>(
        &mut self,
        source: &mut Src,
        token: Token,
        direction: Direction,
    ) -> Result<(), ReactorError>
    where
        Src: Source + ?Sized,
    {
        let Some(reg) = self.registrations.get_mut(&token) else {
            return Ok(());
        };
        if reg.slot_mut(direction).take().is_none() {
            return Ok(());
        }
        trace!(token = token.0, ?direction, "Unregistered");

        match reg.interest() {
            Some(interest) => self
                .poll
                .registry()
                .reregister(source, token, interest)
                .map_err(|e| ReactorError::io("reregister failed", e)),
            None => {
                self.registrations.remove(&token);
                self.poll
                    .registry()
                    .deregister(source)
                    .map_err(|e| ReactorError::io("deregister failed", e))
            }
        }
    }

    pub fn is_registered(&self, token: Token, direction: Direction) -> bool {
        self.registrations
            .get(&token)
            .is_some_and(|reg| reg.slot(direction).is_some())
    }

    /// Number of tokens with at least one direction registered.
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// Schedules `callback` to run `interval` from now.
    pub fn add_timer<F>(&mut self, kind: TimerKind, interval: Duration, callback: F) -> TimerId
    where
        F: Fn(&mut EventLoop<S>, &mut S, TimerId) + 'static,
    {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        self.timers.push_front(TimeEvent {
            id,
            kind,
            interval,
            when: Instant::now() + interval,
            proc: Rc::new(callback),
        });
        id
    }

    /// Cancels a timer. Unknown ids are ignored.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(pos) = self.timers.iter().position(|t| t.id == id) {
            self.timers.remove(pos);
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Makes `run` return after the current tick.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Runs ticks until [`stop`](Self::stop) is called.
    pub fn run(&mut self, state: &mut S) -> Result<(), ReactorError> {
        self.stopped = false;
        while !self.stopped {
            self.run_once(state)?;
        }
        Ok(())
    }

    fn wait_budget(&self, now: Instant) -> Duration {
        self.timers
            .iter()
            .map(|t| t.when)
            .min()
            .map_or(MAX_WAIT, |when| {
                when.saturating_duration_since(now).clamp(MIN_WAIT, MAX_WAIT)
            })
    }

    /// Runs one tick. Returns the number of callbacks invoked.
    pub fn run_once(&mut self, state: &mut S) -> Result<usize, ReactorError> {
        let timeout = self.wait_budget(Instant::now());
        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::io("poll wait failed", e)),
            }
        }

        let mut fired: Vec<(Token, Direction, FileProc<S>)> = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            let Some(reg) = self.registrations.get(&token) else {
                continue;
            };
            // Errors and hangups go to the read side, which observes them as
            // EOF or an I/O error.
            let closed = event.is_error() || event.is_read_closed() || event.is_write_closed();
            if event.is_readable() || closed {
                if let Some(cb) = &reg.readable {
                    fired.push((token, Direction::Readable, Rc::clone(cb)));
                }
            }
            if event.is_writable() || (closed && reg.readable.is_none()) {
                if let Some(cb) = &reg.writable {
                    fired.push((token, Direction::Writable, Rc::clone(cb)));
                }
            }
        }

        let now = Instant::now();
        let due: Vec<(TimerId, TimeProc<S>)> = self
            .timers
            .iter()
            .filter(|t| t.when <= now)
            .map(|t| (t.id, Rc::clone(&t.proc)))
            .collect();

        let mut invoked = 0;
        for (id, proc) in due {
            if !self.timer_is_current(id, &proc) {
                continue;
            }
            proc(self, state, id);
            invoked += 1;

            let now = Instant::now();
            if let Some(pos) = self.timers.iter().position(|t| t.id == id) {
                match self.timers[pos].kind {
                    TimerKind::Repeating => {
                        let interval = self.timers[pos].interval;
                        self.timers[pos].when = now + interval;
                    }
                    TimerKind::Once => {
                        self.timers.remove(pos);
                    }
                }
            }
        }

        for (token, direction, cb) in fired {
            if !self.file_is_current(token, direction, &cb) {
                trace!(token = token.0, ?direction, "Skipping stale callback");
                continue;
            }
            cb(self, state, token);
            invoked += 1;
        }

        Ok(invoked)
    }

    fn timer_is_current(&self, id: TimerId, proc: &TimeProc<S>) -> bool {
        self.timers
            .iter()
            .any(|t| t.id == id && Rc::ptr_eq(&t.proc, proc))
    }

    fn file_is_current(&self, token: Token, direction: Direction, cb: &FileProc<S>) -> bool {
        self.registrations
            .get(&token)
            .and_then(|reg| reg.slot(direction).as_ref())
            .is_some_and(|current| Rc::ptr_eq(current, cb))
    }
}
