//! Per-client control session
//!
//! One `Control` owns the control connection, the tunnels it advertised,
//! and the pipe pool. Five tasks cooperate: a receiver, a sender, the
//! pipe-manager, a watchdog, and a moderator that runs the ordered
//! teardown. All of them stop once `die` flips.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_mux::{Conn, MuxSession};
use burrow_proto::{self as proto, Message};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{EncryptMode, ServerConfig};
use crate::hooks::MemberNotifier;
use crate::pool::PipePool;
use crate::registry::Registry;
use crate::tunnel::Tunnel;

/// Server-side state for one client's control connection
pub struct Control {
    client_id: Uuid,
    encrypt_mode: EncryptMode,
    pre_master: Option<Vec<u8>>,
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    notifier: Arc<dyn MemberNotifier>,

    /// Session start; the monotonic base for keepalive arithmetic
    started: Instant,
    /// Nanoseconds since `started` of the last successful inbound read
    last_read: AtomicU64,

    pub(crate) tunnels: Mutex<Vec<Tunnel>>,

    write_tx: mpsc::Sender<Message>,
    pipe_add_tx: mpsc::Sender<MuxSession>,
    pipe_get_tx: mpsc::Sender<oneshot::Sender<MuxSession>>,
    to_die_tx: mpsc::Sender<()>,
    die: watch::Sender<bool>,
}

impl Control {
    /// Start serving a handshaken control connection.
    ///
    /// Inserts the session into the registry and spawns its tasks; the
    /// returned handle is shared with the registry and every task.
    pub fn spawn(
        conn: Box<dyn Conn>,
        client_id: Uuid,
        pre_master: Option<Vec<u8>>,
        config: Arc<ServerConfig>,
        registry: Arc<Registry>,
        notifier: Arc<dyn MemberNotifier>,
    ) -> Arc<Self> {
        let tuning = &config.tuning;
        let (write_tx, write_rx) = mpsc::channel(tuning.write_chan_buffer);
        let (pipe_add_tx, pipe_add_rx) = mpsc::channel(1);
        let (pipe_get_tx, pipe_get_rx) = mpsc::channel(128);
        let (to_die_tx, to_die_rx) = mpsc::channel(1);
        let (die, _) = watch::channel(false);

        let encrypt_mode = config.encrypt_mode;
        let control = Arc::new(Self {
            client_id,
            encrypt_mode,
            pre_master,
            config,
            registry: registry.clone(),
            notifier,
            started: Instant::now(),
            last_read: AtomicU64::new(0),
            tunnels: Mutex::new(Vec::new()),
            write_tx,
            pipe_add_tx,
            pipe_get_tx,
            to_die_tx,
            die,
        });

        registry.insert_control(control.clone());

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(control.clone().moderator(to_die_rx));
        tokio::spawn(control.clone().recv_loop(reader));
        tokio::spawn(control.clone().write_loop(writer, write_rx));
        tokio::spawn(control.clone().pipe_manager(pipe_add_rx, pipe_get_rx));
        tokio::spawn(control.clone().watchdog());

        info!(client_id = %client_id, "control session serving");
        control
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn encrypt_mode(&self) -> EncryptMode {
        self.encrypt_mode
    }

    pub(crate) fn pre_master(&self) -> Option<&[u8]> {
        self.pre_master.as_deref()
    }

    pub(crate) fn server_config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn MemberNotifier> {
        &self.notifier
    }

    /// Ask the session to shut down. Non-blocking and idempotent; the
    /// moderator picks the request up exactly once.
    pub fn close(&self) {
        let _ = self.to_die_tx.try_send(());
    }

    /// True once `die` has flipped
    pub fn is_closed(&self) -> bool {
        *self.die.borrow()
    }

    pub(crate) fn subscribe_die(&self) -> watch::Receiver<bool> {
        self.die.subscribe()
    }

    fn touch_last_read(&self) {
        let nanos = self.started.elapsed().as_nanos() as u64;
        self.last_read.store(nanos, Ordering::Relaxed);
    }

    fn since_last_read(&self) -> Duration {
        let now = self.started.elapsed().as_nanos() as u64;
        Duration::from_nanos(now.saturating_sub(self.last_read.load(Ordering::Relaxed)))
    }

    /// Enqueue a message for the sender task. Returns false if the
    /// session died before the message was accepted.
    pub(crate) async fn send(&self, msg: Message) -> bool {
        let mut die = self.die.subscribe();
        tokio::select! {
            _ = die.wait_for(|dead| *dead) => false,
            result = self.write_tx.send(msg) => result.is_ok(),
        }
    }

    /// Obtain a pipe with stream capacity; blocks until one is available.
    /// Returns `None` only once the session is dying.
    pub async fn get_pipe(&self) -> Option<MuxSession> {
        if self.is_closed() {
            return None;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.pipe_get_tx.send(reply_tx).await.is_err() {
            return None;
        }
        let mut die = self.die.subscribe();
        tokio::select! {
            _ = die.wait_for(|dead| *dead) => None,
            result = reply_rx => result.ok(),
        }
    }

    /// Hand a pipe (back) to the pool. Closes it instead if the session
    /// is dying.
    pub async fn put_pipe(&self, session: MuxSession) {
        if self.is_closed() {
            session.close();
            return;
        }
        if let Err(rejected) = self.pipe_add_tx.send(session).await {
            rejected.0.close();
        }
    }

    /// Receiver: reads framed messages until the connection or session
    /// dies. Every successful read advances `last_read`.
    async fn recv_loop(self: Arc<Self>, mut reader: ReadHalf<Box<dyn Conn>>) {
        self.touch_last_read();
        let mut die = self.die.subscribe();
        loop {
            let msg = tokio::select! {
                _ = die.wait_for(|dead| *dead) => return,
                result = proto::read_message(&mut reader) => match result {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(client_id = %self.client_id, error = %err, "control read failed");
                        self.close();
                        return;
                    }
                },
            };
            self.touch_last_read();

            match msg {
                Message::AddTunnels { tunnels } => {
                    let control = self.clone();
                    tokio::spawn(async move {
                        control.add_tunnels(tunnels).await;
                    });
                }
                Message::Ping => {
                    if !self.send(Message::Pong).await {
                        return;
                    }
                }
                Message::Pong => {}
                other => {
                    warn!(
                        client_id = %self.client_id,
                        message = ?other,
                        "unexpected message on control channel"
                    );
                    self.close();
                    return;
                }
            }
        }
    }

    /// Sender: the only task writing to the control connection, so frame
    /// boundaries are never interleaved. Coalesces keepalive frames that
    /// would land closer than half a ping interval apart.
    async fn write_loop(
        self: Arc<Self>,
        mut writer: WriteHalf<Box<dyn Conn>>,
        mut write_rx: mpsc::Receiver<Message>,
    ) {
        let ping_gap = self.config.tuning.ping_interval / 2;
        let mut last_write: Option<Instant> = None;
        let mut die = self.die.subscribe();
        loop {
            let msg = tokio::select! {
                _ = die.wait_for(|dead| *dead) => return,
                maybe = write_rx.recv() => match maybe {
                    Some(msg) => msg,
                    None => return,
                },
            };

            if matches!(msg, Message::Ping | Message::Pong) {
                if let Some(at) = last_write {
                    if at.elapsed() < ping_gap {
                        continue;
                    }
                }
            }

            last_write = Some(Instant::now());
            if let Err(err) = proto::write_message(&mut writer, &msg).await {
                warn!(client_id = %self.client_id, error = %err, "control write failed");
                self.close();
                return;
            }
        }
    }

    /// Watchdog: pings on the interval and closes the session once the
    /// peer has been silent past the timeout.
    async fn watchdog(self: Arc<Self>) {
        let tuning = self.config.tuning.clone();
        let mut ticker =
            tokio::time::interval_at(Instant::now() + tuning.ping_interval, tuning.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut die = self.die.subscribe();
        loop {
            let should_ping = tokio::select! {
                _ = die.wait_for(|dead| *dead) => return,
                _ = ticker.tick() => {
                    if self.since_last_read() > tuning.ping_timeout {
                        warn!(client_id = %self.client_id, "keepalive timeout");
                        self.close();
                        return;
                    }
                    true
                }
            };
            if should_ping && !self.send(Message::Ping).await {
                return;
            }
        }
    }

    /// Pipe-manager: sole owner of the idle/busy lists. Alternates
    /// between preparing an available pipe and serving consumers.
    async fn pipe_manager(
        self: Arc<Self>,
        mut pipe_add_rx: mpsc::Receiver<MuxSession>,
        mut pipe_get_rx: mpsc::Receiver<oneshot::Sender<MuxSession>>,
    ) {
        let tuning = self.config.tuning.clone();
        let mut pool = PipePool::new(&tuning);
        let mut ticker = tokio::time::interval(tuning.clean_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut die = self.die.subscribe();
        let mut available: Option<MuxSession> = None;

        loop {
            // Prepare: ensure `available` holds an open pipe with capacity
            while available.as_ref().map_or(true, |s| s.is_closed()) {
                match self
                    .prepare_pipe(&mut pool, &mut pipe_add_rx, &mut ticker, &mut die)
                    .await
                {
                    Some(session) => available = Some(session),
                    None => {
                        if let Some(session) = available.take() {
                            session.close();
                        }
                        pool.close_all();
                        debug!(client_id = %self.client_id, "pipe manager stopped");
                        return;
                    }
                }
            }

            // Available: dispatch to a consumer, absorb arrivals, or clean
            let stop = tokio::select! {
                _ = die.wait_for(|dead| *dead) => true,
                _ = ticker.tick() => {
                    pool.clean();
                    trace!(
                        client_id = %self.client_id,
                        idle = pool.idle_count(),
                        busy = pool.busy_count(),
                        "pool cleaned"
                    );
                    false
                }
                request = pipe_get_rx.recv() => match request {
                    None => true,
                    Some(reply) => {
                        if let Some(session) = available.take() {
                            match reply.send(session) {
                                Ok(()) => debug!(client_id = %self.client_id, "dispatched pipe to consumer"),
                                // Consumer vanished; keep the pipe on hand
                                Err(returned) => available = Some(returned),
                            }
                        }
                        false
                    }
                },
                added = pipe_add_rx.recv() => match added {
                    None => true,
                    Some(session) => {
                        pool.absorb(session);
                        false
                    }
                },
            };

            if stop {
                if let Some(session) = available.take() {
                    session.close();
                }
                pool.close_all();
                debug!(client_id = %self.client_id, "pipe manager stopped");
                return;
            }
        }
    }

    /// Produce a usable pipe: pop idle, clean and re-pop, else ask the
    /// client for a fresh one and wait. Returns `None` once dying.
    async fn prepare_pipe(
        &self,
        pool: &mut PipePool,
        pipe_add_rx: &mut mpsc::Receiver<MuxSession>,
        ticker: &mut tokio::time::Interval,
        die: &mut watch::Receiver<bool>,
    ) -> Option<MuxSession> {
        let tuning = &self.config.tuning;
        loop {
            if let Some(session) = pool.pop_idle() {
                return Some(session);
            }
            pool.clean();
            if let Some(session) = pool.pop_idle() {
                return Some(session);
            }

            if !self.send(Message::PipeReq).await {
                return None;
            }
            debug!(client_id = %self.client_id, "requested a new pipe");

            let deadline = tokio::time::sleep(tuning.pipe_req_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = die.wait_for(|dead| *dead) => return None,
                    // Timed out; restart the cycle and re-emit the request
                    _ = &mut deadline => break,
                    _ = ticker.tick() => {
                        pool.clean();
                        if let Some(session) = pool.pop_idle() {
                            return Some(session);
                        }
                    }
                    added = pipe_add_rx.recv() => match added {
                        None => return None,
                        Some(session) => {
                            if session.is_closed() {
                                continue;
                            }
                            if session.num_streams() < tuning.max_streams {
                                return Some(session);
                            }
                            pool.push_busy(session);
                        }
                    },
                }
            }
        }
    }

    /// Moderator: waits for the first close request, flips `die`, then
    /// runs the ordered teardown. The reader and sender drop their
    /// connection halves when they observe `die`, which closes the
    /// control socket; the pipe-manager closes the pooled pipes it owns.
    async fn moderator(self: Arc<Self>, mut to_die_rx: mpsc::Receiver<()>) {
        let _ = to_die_rx.recv().await;
        info!(client_id = %self.client_id, "control session closing");
        let _ = self.die.send(true);

        let tunnels = std::mem::take(&mut *self.tunnels.lock().unwrap());
        for tunnel in tunnels {
            if let Some(task) = &tunnel.accept_task {
                task.abort();
            }
            self.registry.remove_tunnel(&tunnel.public_addr);
            if self.config.notify_enabled {
                if let Err(err) = self
                    .notifier
                    .remove_member(&self.config.server_domain, &tunnel.public_addr)
                    .await
                {
                    error!(
                        error = %err,
                        public_addr = %tunnel.public_addr,
                        "notify remove member failed"
                    );
                }
            }
            debug!(tunnel = %tunnel.name, public_addr = %tunnel.public_addr, "tunnel withdrawn");
        }

        self.registry.remove_control(&self.client_id);
        debug!(client_id = %self.client_id, "control session closed");
    }
}
