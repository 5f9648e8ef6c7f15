//! Upstream callbacks
//!
//! The pipeline reports liveness and activity through a small set of
//! optional callbacks. All of them are invoked from pipeline threads and
//! must do next to nothing: flip a flag, kick a GPIO, post a signal.

/// A callback taking no arguments.
pub type Hook = Box<dyn Fn() + Send + Sync>;

/// Optional callbacks installed by the embedding application.
#[derive(Default)]
pub struct StreamHooks {
    watchdog: Option<Hook>,
    now_streaming: Option<Hook>,
    datagram_ready: Option<Box<dyn Fn(usize) + Send + Sync>>,
    overflow_start: Option<Hook>,
    overflow_stop: Option<Box<dyn Fn(u32) + Send + Sync>>,
    round_trip: Option<Box<dyn Fn(i64) + Send + Sync>>,
}

impl StreamHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the send thread on every successful datagram and on
    /// every idle wake.
    pub fn with_watchdog(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.watchdog = Some(Box::new(f));
        self
    }

    /// Called from the send thread on every successful datagram while the
    /// audio link is confirmed up.
    pub fn with_now_streaming(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.now_streaming = Some(Box::new(f));
        self
    }

    /// Called when a datagram container becomes ready to read. Treat this
    /// as a wake signal only; the argument is the container index.
    pub fn with_datagram_ready(mut self, f: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.datagram_ready = Some(Box::new(f));
        self
    }

    /// Called when a run of ring overflows begins.
    pub fn with_overflow_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.overflow_start = Some(Box::new(f));
        self
    }

    /// Called when a run of ring overflows ends, with the number of
    /// datagrams dropped since the last stop.
    pub fn with_overflow_stop(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.overflow_stop = Some(Box::new(f));
        self
    }

    /// Called with the measured round-trip delay in microseconds each
    /// time a fresh timing datagram arrives.
    pub fn with_round_trip(mut self, f: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.round_trip = Some(Box::new(f));
        self
    }

    pub(crate) fn kick_watchdog(&self) {
        if let Some(f) = &self.watchdog {
            f();
        }
    }

    pub(crate) fn notify_streaming(&self) {
        if let Some(f) = &self.now_streaming {
            f();
        }
    }

    pub(crate) fn notify_datagram_ready(&self, index: usize) {
        if let Some(f) = &self.datagram_ready {
            f(index);
        }
    }

    pub(crate) fn notify_overflow_start(&self) {
        if let Some(f) = &self.overflow_start {
            f();
        }
    }

    pub(crate) fn notify_overflow_stop(&self, count: u32) {
        if let Some(f) = &self.overflow_stop {
            f(count);
        }
    }

    pub(crate) fn notify_round_trip(&self, delay_us: i64) {
        if let Some(f) = &self.round_trip {
            f(delay_us);
        }
    }
}

impl std::fmt::Debug for StreamHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHooks")
            .field("watchdog", &self.watchdog.is_some())
            .field("now_streaming", &self.now_streaming.is_some())
            .field("datagram_ready", &self.datagram_ready.is_some())
            .field("overflow_start", &self.overflow_start.is_some())
            .field("overflow_stop", &self.overflow_stop.is_some())
            .field("round_trip", &self.round_trip.is_some())
            .finish()
    }
}
