use std::borrow::Cow;
use std::time::Duration;

/// Tuning knobs shared by the combining locks.
///
/// Every lock reads only the fields that apply to it: the publication list
/// based locks ([`fc`], [`fcf`] and [`fcfpq`]) use the cleanup settings,
/// [`ccsynch`] uses the hop bound and [`fcfpq`] uses the combine budget and the
/// decay switch. All of them use the spin limit.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use dlock::{Config, fcfpq};
///
/// let config = Config::new()
///     .spin_limit(50)
///     .combine_budget(Duration::from_micros(20));
/// let mutex = fcfpq::spins::Mutex::with_config(0, config);
/// assert_eq!(mutex.lock_then(|data| { *data += 1; *data }), 1);
/// ```
///
/// [`fc`]: crate::fc
/// [`fcf`]: crate::fcf
/// [`fcfpq`]: crate::fcfpq
/// [`ccsynch`]: crate::ccsynch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub(crate) spin_limit: u32,
    pub(crate) cleanup_period: u32,
    pub(crate) cleanup_age: u32,
    pub(crate) hop_bound: usize,
    pub(crate) combine_budget: Duration,
    pub(crate) decay: bool,
}

impl Config {
    /// Creates the default configuration.
    pub const fn new() -> Self {
        Self {
            spin_limit: 100,
            cleanup_period: 50,
            cleanup_age: 50,
            hop_bound: 16,
            combine_budget: Duration::from_micros(50),
            decay: false,
        }
    }

    /// Number of relax rounds a waiter spends on its own request before it
    /// yields the processor and retries combiner election.
    pub const fn spin_limit(mut self, rounds: u32) -> Self {
        self.spin_limit = rounds;
        self
    }

    /// Every `passes` combine passes, the combiner unlinks participants that
    /// went idle. Clamped to at least one.
    pub const fn cleanup_period(mut self, passes: u32) -> Self {
        self.cleanup_period = if passes == 0 { 1 } else { passes };
        self
    }

    /// A participant whose last served pass is more than `passes` passes old
    /// is considered idle by cleanup.
    pub const fn cleanup_age(mut self, passes: u32) -> Self {
        self.cleanup_age = passes;
        self
    }

    /// Maximum number of requests a single CC-Synch combiner serves before it
    /// hands the role over. Clamped to at least one.
    pub const fn hop_bound(mut self, hops: usize) -> Self {
        self.hop_bound = if hops == 0 { 1 } else { hops };
        self
    }

    /// Time budget of a single priority queue combine pass. A pass always
    /// serves at least one request.
    pub const fn combine_budget(mut self, budget: Duration) -> Self {
        self.combine_budget = budget;
        self
    }

    /// Whether requests left queued after a pass have their usage lowered by
    /// the running average service time, so that they climb the queue.
    pub const fn decay(mut self, decay: bool) -> Self {
        self.decay = decay;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of an RCL [`Server`].
///
/// [`Server`]: crate::rcl::Server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub(crate) clients: usize,
    pub(crate) max_threads: usize,
    pub(crate) tick: Duration,
    pub(crate) name: Cow<'static, str>,
}

impl ServerConfig {
    /// Creates the default server configuration.
    pub const fn new() -> Self {
        Self {
            clients: 128,
            max_threads: 4,
            tick: Duration::from_millis(10),
            name: Cow::Borrowed("rcl"),
        }
    }

    /// Size of the request table, that is, the number of distinct client
    /// threads the server can ever accept. Clamped to at least one.
    pub fn clients(mut self, clients: usize) -> Self {
        self.clients = if clients == 0 { 1 } else { clients };
        self
    }

    /// Upper bound on serving threads, counting parked ones. Clamped to at
    /// least one.
    pub fn max_threads(mut self, threads: usize) -> Self {
        self.max_threads = if threads == 0 { 1 } else { threads };
        self
    }

    /// Period of the management thread's liveness check.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Prefix of the server's thread names.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::time::Duration;

    use super::{Config, ServerConfig};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.spin_limit, 100);
        assert_eq!(config.cleanup_period, 50);
        assert_eq!(config.cleanup_age, 50);
        assert_eq!(config.hop_bound, 16);
        assert_eq!(config.combine_budget, Duration::from_micros(50));
        assert!(!config.decay);

        let server = ServerConfig::default();
        assert_eq!(server.clients, 128);
        assert_eq!(server.max_threads, 4);
        assert_eq!(server.name, "rcl");
    }

    #[test]
    fn zero_is_clamped() {
        let config = Config::new().cleanup_period(0).hop_bound(0);
        assert_eq!(config.cleanup_period, 1);
        assert_eq!(config.hop_bound, 1);

        let server = ServerConfig::new().clients(0).max_threads(0);
        assert_eq!(server.clients, 1);
        assert_eq!(server.max_threads, 1);
    }
}
