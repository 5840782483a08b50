use std::net::SocketAddr;
use std::path::PathBuf;

/// Durability flush policy for the journal.
///
/// `Immediate` fsyncs after every committed record. `Deferred` fsyncs on a
/// timer instead, trading a bounded data-loss window for throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    Immediate,
    Deferred { interval_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the client listener binds to.
    pub client_addr: SocketAddr,
    /// Address the agent listener binds to.
    pub agent_addr: SocketAddr,
    /// Directory holding `journal.dat` and `snapshot.dat`.
    pub state_dir: PathBuf,
    /// Admission sweep interval.
    pub sched_freq_ms: u64,
    /// Maximum candidates considered per admission sweep.
    pub max_sched: usize,
    /// Cleanup sweep interval.
    pub cleanup_freq_ms: u64,
    /// Maximum terminal jobs removed per cleanup sweep.
    pub max_cleanup: usize,
    /// Retention window for terminal jobs before cleanup removes them.
    pub retention_ms: i64,
    /// Background snapshot interval.
    pub background_save_ms: u64,
    /// Deferred-release sweep interval (wakes elapsed DEFERRED jobs).
    pub defer_check_ms: u64,
    pub flush: FlushPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: hardcoded valid addresses that will always parse
            client_addr: "127.0.0.1:7470"
                .parse()
                .expect("default client address is valid"),
            agent_addr: "127.0.0.1:7471"
                .parse()
                .expect("default agent address is valid"),
            state_dir: PathBuf::from("/var/lib/batchd"),
            sched_freq_ms: 500,
            max_sched: 1024,
            cleanup_freq_ms: 5000,
            max_cleanup: 50,
            retention_ms: 60_000,
            background_save_ms: 300_000,
            defer_check_ms: 750,
            flush: FlushPolicy::Immediate,
        }
    }
}

impl ServerConfig {
    pub fn new(client_addr: SocketAddr, agent_addr: SocketAddr, state_dir: PathBuf) -> Self {
        Self {
            client_addr,
            agent_addr,
            state_dir,
            ..Default::default()
        }
    }

    pub fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_sched_freq(mut self, ms: u64) -> Self {
        self.sched_freq_ms = ms;
        self
    }
}
