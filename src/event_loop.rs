use std::io;
use std::thread;
use std::time::{Duration, Instant};

bitflags::bitflags! {
    /// Readiness reported to a source callback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Readiness: u8 {
        const IN = 0x01;
        const OUT = 0x02;
        const ERR = 0x04;
        /// The source's timeout elapsed without any readiness.
        const TIMEOUT = 0x08;
    }
}

/// Something the multiplexer can check for readiness without blocking.
pub trait Pollable {
    fn poll_ready(&mut self, interest: Readiness) -> io::Result<Readiness>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAction {
    Continue,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

pub type SourceCallback<C> = Box<dyn FnMut(&mut C, Readiness) -> SourceAction>;

enum WaitCondition {
    Timer,
    Io {
        handle: Box<dyn Pollable>,
        interest: Readiness,
    },
}

struct Source<C> {
    id: SourceId,
    condition: WaitCondition,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    callback: SourceCallback<C>,
}

/// Single-threaded multiplexer over timers and pollable handles.
///
/// Every callback receives a mutable reference to the loop's context `C`
/// (the session's datafeed bus in practice) and returns whether it wants to
/// stay registered.
pub struct EventLoop<C> {
    sources: Vec<Source<C>>,
    next_id: u64,
    poll_interval: Duration,
}

impl<C> EventLoop<C> {
    /// Upper bound on a single sleep while pollable handles are registered.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub fn new(poll_interval: Duration) -> Self {
        Self {
            sources: Vec::new(),
            next_id: 0,
            poll_interval,
        }
    }

    fn register(
        &mut self,
        condition: WaitCondition,
        timeout: Option<Duration>,
        callback: SourceCallback<C>,
    ) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        self.sources.push(Source {
            id,
            condition,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            callback,
        });
        log::debug!("Registered event source {:?} (timeout {:?})", id, timeout);
        id
    }

    /// Calls `callback` every `timeout`.
    pub fn add_timer(
        &mut self,
        timeout: Duration,
        callback: impl FnMut(&mut C, Readiness) -> SourceAction + 'static,
    ) -> SourceId {
        self.register(WaitCondition::Timer, Some(timeout), Box::new(callback))
    }

    /// Calls `callback` whenever `handle` is ready for `interest`, or when
    /// `timeout` passes without that happening.
    pub fn add_io(
        &mut self,
        handle: Box<dyn Pollable>,
        interest: Readiness,
        timeout: Option<Duration>,
        callback: impl FnMut(&mut C, Readiness) -> SourceAction + 'static,
    ) -> SourceId {
        self.register(WaitCondition::Io { handle, interest }, timeout, Box::new(callback))
    }

    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        before != self.sources.len()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.iter().any(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sources.iter().filter_map(|s| s.deadline).min()
    }

    fn has_pollables(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s.condition, WaitCondition::Io { .. }))
    }

    fn collect_ready(&mut self, now: Instant) -> Vec<(SourceId, Readiness)> {
        let mut ready = Vec::new();
        for source in &mut self.sources {
            let mut revents = match &mut source.condition {
                WaitCondition::Timer => Readiness::empty(),
                WaitCondition::Io { handle, interest } => match handle.poll_ready(*interest) {
                    Ok(r) => r & (*interest | Readiness::ERR),
                    Err(e) => {
                        log::warn!("Polling source {:?} failed: {}", source.id, e);
                        Readiness::ERR
                    }
                },
            };
            if revents.is_empty() && source.deadline.is_some_and(|d| d <= now) {
                revents = Readiness::TIMEOUT;
            }
            if !revents.is_empty() {
                ready.push((source.id, revents));
            }
        }
        ready
    }

    /// Runs one round: waits (if `block`) until at least one source is ready
    /// or timed out, then invokes each such source once in registration
    /// order. Returns the number of callbacks invoked.
    pub fn iteration(&mut self, ctx: &mut C, block: bool) -> usize {
        if self.sources.is_empty() {
            return 0;
        }

        let ready = loop {
            let now = Instant::now();
            let ready = self.collect_ready(now);
            if !ready.is_empty() || !block {
                break ready;
            }
            let mut wait = self
                .next_deadline()
                .map_or(self.poll_interval, |d| d.saturating_duration_since(now));
            if self.has_pollables() {
                wait = wait.min(self.poll_interval);
            }
            thread::sleep(wait);
        };

        let mut dispatched = 0;
        for (id, revents) in ready {
            let Some(pos) = self.sources.iter().position(|s| s.id == id) else {
                continue;
            };
            let source = &mut self.sources[pos];
            let action = (source.callback)(ctx, revents);
            dispatched += 1;
            match action {
                SourceAction::Continue => {
                    source.deadline = source.timeout.map(|t| Instant::now() + t);
                }
                SourceAction::Remove => {
                    log::debug!("Event source {:?} removed by its callback", id);
                    self.sources.remove(pos);
                }
            }
        }
        dispatched
    }
}

impl<C> Default for EventLoop<C> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_POLL_INTERVAL)
    }
}
