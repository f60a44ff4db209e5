//! Tunnel session lifecycle and the per-packet pipeline.
//!
//! At most one session exists per [`TunnelController`]. A session owns the
//! virtual interface and one dedicated worker thread that reads frames,
//! answers blocked queries locally and relays the others upstream.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::blocklist::BlocklistStore;
use crate::config::TunnelSettings;
use crate::dns::{Blocker, DnsForwarder};
use crate::error::{NetworkError, Result};
use crate::network::{MAX_FRAME_SIZE, TunnelDevice, TunnelProvider, packet};

/// Lifecycle of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Establishing,
    Running,
    Stopping,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Establishing => "establishing",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Status payload reported to the surrounding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub is_running: bool,
    pub blocked_count: u64,
    pub domains_loaded: u64,
}

/// Point-in-time copy of all session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelCounters {
    pub blocked: u64,
    pub domains_loaded: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Session counters. Written by the worker only.
#[derive(Debug, Default)]
struct TunnelStats {
    blocked: AtomicU64,
    domains_loaded: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl TunnelStats {
    fn reset(&self, domains_loaded: u64) {
        self.blocked.store(0, Ordering::Relaxed);
        self.forwarded.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.domains_loaded.store(domains_loaded, Ordering::Relaxed);
        metrics::gauge!("focuslock_domains_loaded").set(domains_loaded as f64);
    }

    fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("focuslock_queries_blocked_total").increment(1);
    }

    fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("focuslock_queries_forwarded_total").increment(1);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("focuslock_queries_dropped_total").increment(1);
    }

    fn snapshot(&self) -> TunnelCounters {
        TunnelCounters {
            blocked: self.blocked.load(Ordering::Relaxed),
            domains_loaded: self.domains_loaded.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// What the worker does with one frame read from the interface.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameAction {
    /// Not a DNS query; neither answered nor relayed.
    Ignore,
    /// A DNS query that could not be handled.
    Drop,
    /// Synthesized answer for a blocked domain.
    Block(Vec<u8>),
    /// Upstream answer wrapped for the requester.
    Relay(Vec<u8>),
}

/// Decide and build the reply for a single frame.
///
/// Never fails: every per-packet problem turns into [`FrameAction::Drop`].
pub fn handle_frame(frame: &[u8], blocker: &Blocker, forwarder: &dyn DnsForwarder) -> FrameAction {
    if !packet::is_dns_query(frame) {
        return FrameAction::Ignore;
    }

    let Some(domain) = packet::extract_domain(frame) else {
        debug!(len = frame.len(), "dropping query with unreadable name");
        return FrameAction::Drop;
    };

    if blocker.should_block(&domain) {
        return match packet::build_blocked_response(frame) {
            Ok(reply) => {
                debug!(domain = %domain, "blocked");
                FrameAction::Block(reply)
            }
            Err(err) => {
                warn!(domain = %domain, error = %err, "failed to build blocked answer");
                FrameAction::Drop
            }
        };
    }

    let Some(query) = packet::extract_dns_payload(frame) else {
        return FrameAction::Drop;
    };

    let answer = match forwarder.forward(query) {
        Ok(answer) => answer,
        Err(err) => {
            warn!(domain = %domain, error = %err, "upstream query failed");
            return FrameAction::Drop;
        }
    };

    match packet::build_forwarded_response(frame, &answer) {
        Ok(reply) => {
            debug!(domain = %domain, "forwarded");
            FrameAction::Relay(reply)
        }
        Err(err) => {
            warn!(domain = %domain, error = %err, "failed to wrap upstream answer");
            FrameAction::Drop
        }
    }
}

struct Worker {
    device: Box<dyn TunnelDevice>,
    blocker: Blocker,
    forwarder: Arc<dyn DnsForwarder>,
    stats: Arc<TunnelStats>,
    cancel: Arc<AtomicBool>,
    state: Arc<RwLock<TunnelState>>,
}

impl Worker {
    /// Run until cancelled or the interface fails; hands the device back so
    /// the controller closes it only after the loop has exited.
    fn run(mut self) -> Box<dyn TunnelDevice> {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];

        while !self.cancel.load(Ordering::Acquire) {
            let len = match self.device.read_frame(&mut buf) {
                Ok(0) => continue,
                Ok(len) => len,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::Interrupted
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    if !self.cancel.load(Ordering::Acquire) {
                        error!(error = %err, "tunnel read failed, stopping worker");
                        let mut state = self.state.write();
                        if *state == TunnelState::Running {
                            *state = TunnelState::Stopped;
                        }
                    }
                    break;
                }
            };

            let reply = match handle_frame(&buf[..len], &self.blocker, self.forwarder.as_ref()) {
                FrameAction::Ignore => continue,
                FrameAction::Drop => {
                    self.stats.record_dropped();
                    continue;
                }
                FrameAction::Block(reply) => {
                    self.stats.record_blocked();
                    reply
                }
                FrameAction::Relay(reply) => {
                    self.stats.record_forwarded();
                    reply
                }
            };

            if let Err(err) = self.device.write_frame(&reply) {
                warn!(error = %err, "failed to write reply to tunnel");
            }
        }

        debug!("tunnel worker exited");
        self.device
    }
}

struct Session {
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<Box<dyn TunnelDevice>>,
}

impl Session {
    /// Signal the worker, wait for it and close the interface.
    fn shutdown(self) {
        self.cancel.store(true, Ordering::Release);
        match self.worker.join() {
            Ok(device) => drop(device),
            Err(_) => error!("tunnel worker panicked"),
        }
    }
}

/// Owns the single tunnel session and its state machine.
pub struct TunnelController {
    provider: Arc<dyn TunnelProvider>,
    forwarder: Arc<dyn DnsForwarder>,
    store: BlocklistStore,
    settings: TunnelSettings,
    state: Arc<RwLock<TunnelState>>,
    stats: Arc<TunnelStats>,
    /// Held for the whole of `start` and `stop`.
    session: Mutex<Option<Session>>,
}

impl TunnelController {
    pub fn new(
        provider: Arc<dyn TunnelProvider>,
        forwarder: Arc<dyn DnsForwarder>,
        store: BlocklistStore,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            provider,
            forwarder,
            store,
            settings,
            state: Arc::new(RwLock::new(TunnelState::Stopped)),
            stats: Arc::new(TunnelStats::default()),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TunnelState::Running
    }

    pub fn status(&self) -> TunnelStatus {
        let counters = self.stats.snapshot();
        TunnelStatus {
            is_running: self.is_running(),
            blocked_count: counters.blocked,
            domains_loaded: counters.domains_loaded,
        }
    }

    pub fn counters(&self) -> TunnelCounters {
        self.stats.snapshot()
    }

    /// Start a session from the persisted domain list.
    ///
    /// A no-op when already running. Interface establishment failure leaves
    /// the tunnel stopped and is returned to the caller.
    pub fn start(&self) -> Result<()> {
        let mut session = self.session.lock();
        if self.is_running() {
            debug!("tunnel already running");
            return Ok(());
        }
        // Reap a worker that ended on its own.
        if let Some(stale) = session.take() {
            stale.shutdown();
        }

        self.set_state(TunnelState::Establishing);
        match self.establish() {
            Ok(new_session) => {
                *session = Some(new_session);
                info!(
                    domains = self.stats.snapshot().domains_loaded,
                    "tunnel running"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(TunnelState::Stopped);
                error!(error = %err, "failed to start tunnel");
                Err(err)
            }
        }
    }

    /// Stop the running session. Idempotent.
    pub fn stop(&self) {
        let mut session = self.session.lock();
        let Some(running) = session.take() else {
            self.set_state(TunnelState::Stopped);
            return;
        };

        self.set_state(TunnelState::Stopping);
        running.shutdown();
        self.set_state(TunnelState::Stopped);
        info!("tunnel stopped");
    }

    fn establish(&self) -> Result<Session> {
        let blocker = Blocker::new(self.store.domains()?);
        self.stats.reset(blocker.len() as u64);

        let device = self.provider.establish(&self.settings)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            device,
            blocker,
            forwarder: Arc::clone(&self.forwarder),
            stats: Arc::clone(&self.stats),
            cancel: Arc::clone(&cancel),
            state: Arc::clone(&self.state),
        };

        // Set before spawning: the worker may fail its first read at once.
        self.set_state(TunnelState::Running);
        let worker = thread::Builder::new()
            .name("focuslock-tunnel".into())
            .spawn(move || worker.run())
            .map_err(NetworkError::WorkerSpawn)?;

        Ok(Session { cancel, worker })
    }

    fn set_state(&self, state: TunnelState) {
        *self.state.write() = state;
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.shutdown();
        }
    }
}
