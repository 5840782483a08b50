use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FlushPolicy, ServerConfig};
use crate::error::Result;
use crate::events::{EventRegistry, Maintenance};
use crate::net::{ConnEvent, ConnId, Listener, PeerKind};
use crate::protocol::Message;
use crate::sched::{Dispatch, Scheduler};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// One connected peer, as the server loop sees it.
struct Session {
    kind: PeerKind,
    outbound: mpsc::UnboundedSender<Message>,
    /// Commands received but not yet run. Each drain runs at most one per
    /// session, so a chatty peer cannot starve the rest of the loop.
    pending: VecDeque<Message>,
}

/// The server: recovers durable state, binds the client and agent listeners,
/// then runs every state mutation on this single task. Connection tasks only
/// frame bytes; ordering within a connection is preserved by its channel.
pub struct Server {
    config: ServerConfig,
    sched: Scheduler,
    registry: EventRegistry,
    sessions: HashMap<ConnId, Session>,
    events_rx: mpsc::Receiver<ConnEvent>,
    client_addr: SocketAddr,
    agent_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Server {
    /// Recover state and bind both listeners. Nothing is accepted until
    /// recovery has finished, so no request can observe partial state.
    pub async fn start(config: ServerConfig, shutdown: CancellationToken) -> Result<Server> {
        let sched = Scheduler::recover(&config.state_dir, &config)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let clients = Listener::bind(
            config.client_addr,
            PeerKind::Client,
            events_tx.clone(),
            shutdown.clone(),
        )
        .await?;
        let agents = Listener::bind(
            config.agent_addr,
            PeerKind::Agent,
            events_tx,
            shutdown.clone(),
        )
        .await?;
        let client_addr = clients.local_addr()?;
        let agent_addr = agents.local_addr()?;
        tokio::spawn(clients.run());
        tokio::spawn(agents.run());

        let mut registry = EventRegistry::new();
        registry.register(Maintenance::DrainClients, 0);
        registry.register(Maintenance::DrainAgents, 0);
        registry.register(Maintenance::AdmissionSweep, config.sched_freq_ms);
        registry.register(Maintenance::DeferredRelease, config.defer_check_ms);
        registry.register(Maintenance::CleanupSweep, config.cleanup_freq_ms);
        registry.register(Maintenance::BackgroundSave, config.background_save_ms);
        if let FlushPolicy::Deferred { interval_ms } = config.flush {
            registry.register(Maintenance::DurabilityFlush, interval_ms);
        }

        Ok(Server {
            config,
            sched,
            registry,
            sessions: HashMap::new(),
            events_rx,
            client_addr,
            agent_addr,
            shutdown,
        })
    }

    /// The bound client address; differs from the configured one when
    /// binding to port 0.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_addr
    }

    /// The event loop. Returns after shutdown is requested and the journal
    /// has been flushed.
    pub async fn run(mut self) -> Result<()> {
        let tick = self.registry.min_interval().unwrap_or(DEFAULT_TICK);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_ms = tick.as_millis() as u64, "server running");

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_conn_event(event)?,
                        // All listener tasks gone; only happens at shutdown.
                        None => break,
                    }
                }
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => break,
            }
            self.run_maintenance()?;
        }

        self.sched.flush_journal()?;
        info!("server stopped");
        Ok(())
    }

    fn handle_conn_event(&mut self, event: ConnEvent) -> Result<()> {
        match event {
            ConnEvent::Connected { conn, kind, outbound } => {
                self.sessions.insert(
                    conn,
                    Session {
                        kind,
                        outbound,
                        pending: VecDeque::new(),
                    },
                );
            }
            ConnEvent::Inbound { conn, message } => {
                if let Some(session) = self.sessions.get_mut(&conn) {
                    session.pending.push_back(message);
                }
            }
            ConnEvent::Closed { conn } => {
                if let Some(session) = self.sessions.remove(&conn) {
                    if session.kind == PeerKind::Agent {
                        self.sched.agent_lost(conn, Utc::now())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every due maintenance entry, in registration order. Each entry is
    /// stamped with the time its handler returned.
    fn run_maintenance(&mut self) -> Result<()> {
        for kind in self.registry.due(Instant::now()) {
            match kind {
                Maintenance::DrainClients => self.drain(PeerKind::Client)?,
                Maintenance::DrainAgents => self.drain(PeerKind::Agent)?,
                Maintenance::AdmissionSweep => {
                    let dispatches = self.sched.admission_sweep(Utc::now())?;
                    if !dispatches.is_empty() {
                        self.commit()?;
                        self.route_dispatches(dispatches);
                    }
                }
                Maintenance::DeferredRelease => {
                    if self.sched.release_deferred(Utc::now())? > 0 {
                        self.commit()?;
                    }
                }
                Maintenance::CleanupSweep => {
                    if self.sched.cleanup_sweep(Utc::now(), self.config.max_cleanup)? > 0 {
                        self.commit()?;
                    }
                }
                Maintenance::BackgroundSave => {
                    if let Err(e) = self.sched.save_snapshot() {
                        // The journal still holds everything; retry next time.
                        error!(error = %e, "background snapshot failed");
                    }
                }
                Maintenance::DurabilityFlush => self.sched.flush_journal()?,
            }
            self.registry.fired(kind, Instant::now());
        }
        Ok(())
    }

    /// Run at most one pending command per session of the given kind. The
    /// command runs to completion (state change, journal append, flush under
    /// the immediate policy) before its reply or directives are queued.
    fn drain(&mut self, kind: PeerKind) -> Result<()> {
        let ready: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.kind == kind && !s.pending.is_empty())
            .map(|(conn, _)| *conn)
            .collect();

        for conn in ready {
            let Some(message) = self
                .sessions
                .get_mut(&conn)
                .and_then(|s| s.pending.pop_front())
            else {
                continue;
            };
            match kind {
                PeerKind::Client => {
                    debug!(conn, command = %message.command, "client command");
                    let (reply, dispatches) =
                        self.sched.run_client_command(&message, Utc::now());
                    if !reply.is_error() {
                        self.commit()?;
                    }
                    self.send_to(conn, reply);
                    self.route_dispatches(dispatches);
                }
                PeerKind::Agent => {
                    debug!(conn, command = %message.command, "agent command");
                    if let Err(e) = self.sched.run_agent_command(conn, &message, Utc::now()) {
                        // Agents are trusted infrastructure; a bad command
                        // means a broken or impostor agent. Drop it.
                        warn!(conn, error = %e, "agent failed, closing connection");
                        self.sessions.remove(&conn);
                        self.sched.agent_lost(conn, Utc::now())?;
                        continue;
                    }
                    self.commit()?;
                }
            }
        }
        Ok(())
    }

    /// Make journaled mutations durable before any acknowledgement leaves
    /// the server, under the immediate policy. Deferred flushing leaves this
    /// to the timer.
    fn commit(&mut self) -> Result<()> {
        if self.config.flush == FlushPolicy::Immediate && self.sched.journal_dirty() {
            self.sched.flush_journal()?;
        }
        Ok(())
    }

    fn route_dispatches(&mut self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            self.send_to(dispatch.conn, dispatch.message);
        }
    }

    fn send_to(&mut self, conn: ConnId, message: Message) {
        if let Some(session) = self.sessions.get(&conn) {
            // A send failure means the connection task already exited; the
            // Closed event will clean the session up.
            if session.outbound.send(message).is_err() {
                debug!(conn, "send to closed connection dropped");
            }
        }
    }
}
