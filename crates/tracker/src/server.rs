//! Rendezvous server - accepts workers, assigns ranks and releases the group.
//!
//! Flow:
//! 1. Bind the listener (searching upward from the configured port)
//! 2. Accept loop spawns one handshake task per connection
//! 3. Event loop owns the registry: validates claims, reserves ranks, confirms
//!    them with Assigned off the loop, and frees ranks whose worker went away
//! 4. Once every rank is connected: stop accepting, compute topology
//! 5. Send Release to every worker, collect Acks, check nobody left, send Start
//! 6. On deadline, abort request or dispatch failure: Abort to every connection held

use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::TrackerCodec;
use crate::bridge::protocol::{Peer, Rank, RankClaim, SessionId, TrackerMessage, WorkerMessage};
use crate::config::BootstrapConfig;
use crate::env::WorkerEnv;
use crate::error::BootstrapError;
use crate::registry::ConnectionRegistry;
use crate::state::{SessionState, SessionStatus};
use crate::topology::{Topology, build_topology};

/// Tracker side of one worker connection.
pub type Connection = Framed<TcpStream, TrackerCodec>;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A decoded hello together with the connection it arrived on.
struct Handshake {
    peer: SocketAddr,
    claim: RankClaim,
    addr: String,
    session: Option<SessionId>,
    conn: Connection,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("unexpected message: expected {0}")]
    Unexpected(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Stops a running session from outside, e.g. when the spawn backend fails.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: mpsc::Sender<BootstrapError>,
}

impl AbortHandle {
    /// Request an abort. Ignored once the group is full and dispatch has begun.
    pub fn abort(&self, error: BootstrapError) {
        if self.tx.try_send(error).is_err() {
            tracing::debug!("Abort request dropped: session already finishing");
        }
    }
}

pub struct RendezvousServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tracker_addr: String,
    config: BootstrapConfig,
    session: SessionId,
    state_tx: watch::Sender<SessionState>,
    status: SessionStatus,
    abort_tx: mpsc::Sender<BootstrapError>,
    abort_rx: mpsc::Receiver<BootstrapError>,
}

impl RendezvousServer {
    /// Bind the listener. The session is LISTENING once this returns.
    pub async fn bind(config: BootstrapConfig) -> Result<Self, BootstrapError> {
        config.validate()?;

        let listener = bind_with_search(&config).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BootstrapError::io(format!("failed to read listener address: {e}")))?;
        let tracker_addr = advertised_addr(&config, local_addr);

        let session = SessionId::new();
        let (state_tx, status) = SessionStatus::channel();
        let (abort_tx, abort_rx) = mpsc::channel(1);

        tracing::info!(
            %session,
            %local_addr,
            tracker = %tracker_addr,
            world_size = config.world_size,
            "Tracker listening"
        );

        Ok(Self {
            listener,
            local_addr,
            tracker_addr,
            config,
            session,
            state_tx,
            status,
            abort_tx,
            abort_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` workers should dial.
    pub fn tracker_addr(&self) -> &str {
        &self.tracker_addr
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: self.abort_tx.clone(),
        }
    }

    /// Run the session to RELEASED or ABORTED.
    ///
    /// On success returns one `WorkerEnv` per rank, in rank order.
    pub async fn run(self) -> Result<Vec<WorkerEnv>, BootstrapError> {
        let Self {
            listener,
            tracker_addr,
            config,
            session,
            state_tx,
            abort_tx,
            mut abort_rx,
            ..
        } = self;
        // Held so that `abort_rx` stays open even without external handles.
        let _abort_tx = abort_tx;

        let world_size = config.world_size;
        let mut registry = ConnectionRegistry::new();
        registry.register_pending(world_size)?;

        let cancel = CancellationToken::new();
        let (handshake_tx, mut handshake_rx) = mpsc::channel(world_size.clamp(1, 1024));
        let acceptor = tokio::spawn(accept_loop(
            listener,
            handshake_tx,
            config.handshake_timeout,
            cancel.clone(),
        ));

        let mut event_loop = EventLoop {
            registry: &mut registry,
            config: &config,
            session,
            state_tx: &state_tx,
            policy: None,
            rejections: HashMap::new(),
            confirming: FuturesUnordered::new(),
        };
        let gathered = event_loop
            .gather(&mut handshake_rx, &mut abort_rx)
            .await;
        let confirming = std::mem::take(&mut event_loop.confirming);

        // No partial cancellation from here on: stop accepting, then settle
        // whatever is still queued.
        cancel.cancel();
        if let Err(e) = acceptor.await {
            tracing::error!(error = %e, "Accept loop panicked");
        }
        handshake_rx.close();
        let mut stragglers = Vec::new();
        while let Ok(handshake) = handshake_rx.try_recv() {
            tracing::debug!(peer = %handshake.peer, "Turning away late worker");
            stragglers.push(handshake.conn);
        }

        if let Err(error) = gathered {
            let mut held: Vec<Connection> =
                registry.take_handles().into_iter().map(|(_, c)| c).collect();
            held.extend(
                confirming
                    .collect::<Vec<Confirmation>>()
                    .await
                    .into_iter()
                    .map(|c| c.conn),
            );
            held.append(&mut stragglers);
            return Err(abort(&state_tx, held, error, config.handshake_timeout).await);
        }

        abort_all(
            stragglers,
            "worker group is already complete",
            config.handshake_timeout,
        )
        .await;

        let topology = match build_topology(world_size, config.topology) {
            Ok(topology) => topology,
            Err(e) => {
                let held = registry.take_handles().into_iter().map(|(_, c)| c).collect();
                return Err(abort(&state_tx, held, e.into(), config.handshake_timeout).await);
            }
        };
        publish(&state_tx, SessionState::TopologyReady);
        tracing::info!(
            %session,
            world_size,
            topology = %topology.kind(),
            edges = topology.edges().len(),
            "All workers connected, topology ready"
        );

        let envs = worker_envs(&registry, &topology, &tracker_addr);
        let handles = registry.take_handles();
        match dispatch(&mut registry, handles, &envs, config.handshake_timeout).await {
            Ok(()) => {
                publish(&state_tx, SessionState::Released);
                tracing::info!(%session, world_size, "Workers released");
                Ok(envs)
            }
            Err((held, error)) => Err(abort(&state_tx, held, error, config.handshake_timeout).await),
        }
    }
}

/// An `Assigned` reply that finished sending, successfully or not.
struct Confirmation {
    rank: Rank,
    peer: SocketAddr,
    conn: Connection,
    result: Result<(), StepError>,
}

/// Single writer of the registry and session state until the group is full.
struct EventLoop<'a> {
    registry: &'a mut ConnectionRegistry<Connection>,
    config: &'a BootstrapConfig,
    session: SessionId,
    state_tx: &'a watch::Sender<SessionState>,
    /// Claim policy fixed by the first admitted worker (true = auto-assign).
    policy: Option<bool>,
    rejections: HashMap<Rank, u32>,
    /// Replies to reserved ranks still being written.
    confirming: FuturesUnordered<BoxFuture<'static, Confirmation>>,
}

impl EventLoop<'_> {
    async fn gather(
        &mut self,
        handshake_rx: &mut mpsc::Receiver<Handshake>,
        abort_rx: &mut mpsc::Receiver<BootstrapError>,
    ) -> Result<(), BootstrapError> {
        let deadline = tokio::time::sleep(self.config.rendezvous_timeout);
        tokio::pin!(deadline);

        while !(self.registry.all_connected() && self.confirming.is_empty()) {
            tokio::select! {
                biased;

                Some(error) = abort_rx.recv() => {
                    return Err(error);
                }

                _ = &mut deadline => {
                    return Err(BootstrapError::timeout(format!(
                        "{} of {} workers connected within {:?}",
                        self.registry.connected_count(),
                        self.config.world_size,
                        self.config.rendezvous_timeout,
                    )));
                }

                (rank, reason) = poll_fn(|cx| poll_lost(&mut *self.registry, cx)) => {
                    self.release_lost(rank, &reason);
                }

                Some(confirmation) = self.confirming.next(), if !self.confirming.is_empty() => {
                    self.confirmed(confirmation);
                }

                handshake = handshake_rx.recv() => match handshake {
                    Some(handshake) => self.admit(handshake)?,
                    None => return Err(BootstrapError::io("accept loop stopped")),
                },
            }
        }

        Ok(())
    }

    /// Reserve a rank for one worker and start confirming it, or reject it.
    ///
    /// Errors only when rejections for a requested rank exceed the retry limit.
    fn admit(&mut self, handshake: Handshake) -> Result<(), BootstrapError> {
        let Handshake {
            peer,
            claim,
            addr,
            session,
            mut conn,
        } = handshake;

        // A restarted worker may arrive before its old connection was polled.
        self.reap_lost();

        let rank = match self.resolve(claim, &addr, session) {
            Ok(rank) => rank,
            Err(reason) => return self.reject(conn, peer, claim, reason),
        };
        if let Err(e) = self.registry.reserve(rank, addr.as_str()) {
            tracing::error!(%peer, %rank, error = %e, "Registry refused a checked rank");
            return Ok(());
        }
        if self.policy.is_none() {
            self.policy = Some(claim.is_auto());
        }
        if *self.state_tx.borrow() == SessionState::Listening {
            publish(self.state_tx, SessionState::Assigning);
        }

        let assigned = TrackerMessage::Assigned {
            rank,
            world_size: self.config.world_size as u32,
        };
        let timeout = self.config.handshake_timeout;
        self.confirming.push(
            async move {
                let result = send(&mut conn, assigned, timeout).await;
                Confirmation {
                    rank,
                    peer,
                    conn,
                    result,
                }
            }
            .boxed(),
        );
        tracing::debug!(%rank, %peer, addr = %addr, "Rank reserved");
        Ok(())
    }

    fn confirmed(&mut self, confirmation: Confirmation) {
        let Confirmation {
            rank,
            peer,
            conn,
            result,
        } = confirmation;

        if let Err(e) = result {
            // The worker is gone; its rank can be claimed again.
            tracing::warn!(%peer, %rank, error = %e, "HandshakeError: failed to confirm rank");
            if let Err(e) = self.registry.mark_lost(rank) {
                tracing::error!(%rank, error = %e, "Unconfirmed rank was not reserved");
            }
            return;
        }
        if let Err(e) = self.registry.attach(rank, conn) {
            tracing::error!(%peer, %rank, error = %e, "Confirmed rank was not reserved");
            return;
        }
        tracing::info!(
            session = %self.session,
            %rank,
            %peer,
            addr = self.registry.addr(rank).unwrap_or_default(),
            connected = self.registry.connected_count(),
            world_size = self.config.world_size,
            "Worker connected"
        );
    }

    fn reap_lost(&mut self) {
        loop {
            let lost = poll_fn(|cx| poll_lost(&mut *self.registry, cx)).now_or_never();
            let Some((rank, reason)) = lost else {
                break;
            };
            self.release_lost(rank, &reason);
        }
    }

    fn release_lost(&mut self, rank: Rank, reason: &str) {
        match self.registry.mark_lost(rank) {
            Ok(_) => tracing::warn!(
                session = %self.session,
                %rank,
                %reason,
                connected = self.registry.connected_count(),
                "Worker lost before release, rank is free again"
            ),
            Err(e) => tracing::error!(%rank, error = %e, "Lost rank was not connected"),
        }
    }

    fn resolve(
        &self,
        claim: RankClaim,
        addr: &str,
        session: Option<SessionId>,
    ) -> Result<Rank, String> {
        if let Some(session) = session
            && session != self.session
        {
            return Err(format!("worker belongs to session {session}"));
        }
        validate_addr(addr)?;
        if let Some(auto) = self.policy
            && auto != claim.is_auto()
        {
            let expected = if auto { "auto-assigned" } else { "requested" };
            return Err(format!("this session uses {expected} ranks"));
        }

        let rank = match claim {
            RankClaim::AutoAssign => self
                .registry
                .next_free_rank()
                .ok_or_else(|| "no free rank left".to_string())?,
            RankClaim::RequestRank { rank } => rank,
        };
        self.registry
            .check_pending(rank)
            .map_err(|e| e.to_string())?;
        Ok(rank)
    }

    fn reject(
        &mut self,
        mut conn: Connection,
        peer: SocketAddr,
        claim: RankClaim,
        reason: String,
    ) -> Result<(), BootstrapError> {
        tracing::warn!(%peer, ?claim, %reason, "HandshakeError: rejecting worker");
        let rejected = TrackerMessage::Rejected {
            reason: reason.clone(),
        };
        let timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            if let Err(e) = send(&mut conn, rejected, timeout).await {
                tracing::debug!(%peer, error = %e, "Failed to deliver rejection");
            }
        });

        let Some(rank) = claim.requested_rank() else {
            return Ok(());
        };
        let count = self.rejections.entry(rank).or_insert(0);
        *count += 1;
        if *count > self.config.max_retries {
            return Err(BootstrapError::handshake(format!(
                "rank {rank} rejected {count} times, last: {reason}"
            )));
        }
        Ok(())
    }
}

/// First held connection that closed, errored or spoke out of turn.
///
/// Nothing is expected from a worker between its `Assigned` and its release.
fn poll_lost(
    registry: &mut ConnectionRegistry<Connection>,
    cx: &mut Context<'_>,
) -> Poll<(Rank, String)> {
    for (rank, conn) in registry.connected_handles_mut() {
        if let Some(reason) = lost_reason(conn.poll_next_unpin(cx)) {
            return Poll::Ready((rank, reason));
        }
    }
    Poll::Pending
}

fn lost_reason(polled: Poll<Option<Result<WorkerMessage, io::Error>>>) -> Option<String> {
    match polled {
        Poll::Pending => None,
        Poll::Ready(None) => Some("connection closed".to_string()),
        Poll::Ready(Some(Err(e))) => Some(e.to_string()),
        Poll::Ready(Some(Ok(message))) => Some(format!("unexpected {message:?}")),
    }
}

fn publish(state_tx: &watch::Sender<SessionState>, state: SessionState) {
    let previous = state_tx.send_replace(state);
    tracing::debug!(?previous, ?state, "Session state changed");
}

async fn abort(
    state_tx: &watch::Sender<SessionState>,
    held: Vec<Connection>,
    error: BootstrapError,
    timeout: Duration,
) -> BootstrapError {
    publish(state_tx, SessionState::Aborted);
    tracing::error!(kind = %error.kind, detail = %error.detail, workers = held.len(), "Session aborted");
    abort_all(held, &error.to_string(), timeout).await;
    error
}

/// Tell every connection the session is over, then close them.
async fn abort_all(held: Vec<Connection>, reason: &str, timeout: Duration) {
    join_all(held.into_iter().map(|mut conn| async move {
        let message = TrackerMessage::Abort {
            reason: reason.to_string(),
        };
        if let Err(e) = send(&mut conn, message, timeout).await {
            tracing::debug!(error = %e, "Failed to deliver abort");
        }
    }))
    .await;
}

async fn send(conn: &mut Connection, message: TrackerMessage, timeout: Duration) -> Result<(), StepError> {
    tokio::time::timeout(timeout, conn.send(message))
        .await
        .map_err(|_| StepError::Timeout)??;
    Ok(())
}

async fn release_and_ack(
    conn: &mut Connection,
    release: TrackerMessage,
    timeout: Duration,
) -> Result<(), StepError> {
    send(conn, release, timeout).await?;
    match tokio::time::timeout(timeout, conn.next()).await {
        Err(_) => Err(StepError::Timeout),
        Ok(None) => Err(StepError::Closed),
        Ok(Some(Err(e))) => Err(StepError::Io(e)),
        Ok(Some(Ok(WorkerMessage::Ack))) => Ok(()),
        Ok(Some(Ok(_))) => Err(StepError::Unexpected("ack")),
    }
}

fn worker_envs(
    registry: &ConnectionRegistry<Connection>,
    topology: &Topology,
    tracker_addr: &str,
) -> Vec<WorkerEnv> {
    let world_size = topology.world_size() as u32;
    (0..topology.world_size())
        .map(|index| {
            let rank = Rank::from_index(index);
            let neighbors = topology
                .neighbors(rank)
                .iter()
                .map(|&n| Peer {
                    rank: n,
                    addr: registry.addr(n).unwrap_or_default().to_string(),
                })
                .collect();
            WorkerEnv {
                rank,
                world_size,
                tracker: tracker_addr.to_string(),
                neighbors,
            }
        })
        .collect()
}

/// Deliver every release, then start everyone.
///
/// Workers only begin on Start, so a failure before that point aborts the
/// whole group and nobody runs with a partial topology. A worker that left
/// after its ack, or a Start that cannot be written, fails the session too.
/// On failure the connections are handed back for the abort notice.
async fn dispatch(
    registry: &mut ConnectionRegistry<Connection>,
    handles: Vec<(Rank, Connection)>,
    envs: &[WorkerEnv],
    timeout: Duration,
) -> Result<(), (Vec<Connection>, BootstrapError)> {
    let results = join_all(handles.into_iter().map(|(rank, mut conn)| {
        let release = envs[rank.index()].release_message();
        async move {
            let result = release_and_ack(&mut conn, release, timeout).await;
            (rank, conn, result)
        }
    }))
    .await;

    let mut conns = Vec::with_capacity(results.len());
    let mut failure = None;
    for (rank, conn, result) in results {
        match result {
            Ok(()) => {
                if let Err(e) = registry.mark_ready(rank) {
                    tracing::error!(%rank, error = %e, "Acknowledged rank was not connected");
                }
                tracing::debug!(%rank, "Release acknowledged");
            }
            Err(e) => {
                tracing::error!(%rank, error = %e, "Failed to release worker");
                failure.get_or_insert_with(|| format!("rank {rank}: {e}"));
            }
        }
        conns.push((rank, conn));
    }

    if failure.is_none() && !registry.all_ready() {
        failure = Some("not every rank acknowledged".to_string());
    }
    if failure.is_none() {
        for (rank, conn) in conns.iter_mut() {
            let polled = conn.next().now_or_never().map_or(Poll::Pending, Poll::Ready);
            if let Some(reason) = lost_reason(polled) {
                tracing::error!(%rank, %reason, "Worker left between ack and start");
                failure.get_or_insert_with(|| format!("rank {rank}: {reason} before start"));
            }
        }
    }
    if failure.is_none() {
        let started = join_all(conns.iter_mut().map(|(rank, conn)| async move {
            (*rank, send(conn, TrackerMessage::Start, timeout).await)
        }))
        .await;
        for (rank, result) in started {
            if let Err(e) = result {
                tracing::error!(%rank, error = %e, "Failed to deliver start");
                failure.get_or_insert_with(|| format!("rank {rank}: start not delivered: {e}"));
            }
        }
    }

    match failure {
        None => Ok(()),
        Some(detail) => Err((
            conns.into_iter().map(|(_, conn)| conn).collect(),
            BootstrapError::dispatch(detail),
        )),
    }
}

async fn accept_loop(
    listener: TcpListener,
    handshake_tx: mpsc::Sender<Handshake>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::trace!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(read_hello(
                        stream,
                        peer,
                        handshake_tx.clone(),
                        timeout,
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("Listener closed");
}

/// Per-connection task: read the hello and forward it to the event loop.
async fn read_hello(
    stream: TcpStream,
    peer: SocketAddr,
    handshake_tx: mpsc::Sender<Handshake>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut conn = Framed::new(stream, TrackerCodec::new());

    let first = tokio::select! {
        _ = cancel.cancelled() => None,
        first = tokio::time::timeout(timeout, conn.next()) => Some(first),
    };
    let Some(first) = first else {
        abort_all(vec![conn], "tracker is no longer accepting workers", timeout).await;
        return;
    };

    let reason = match first {
        Ok(Some(Ok(WorkerMessage::Hello {
            claim,
            addr,
            session,
        }))) => {
            let handshake = Handshake {
                peer,
                claim,
                addr,
                session,
                conn,
            };
            if let Err(mpsc::error::SendError(handshake)) = handshake_tx.send(handshake).await {
                abort_all(
                    vec![handshake.conn],
                    "tracker is no longer accepting workers",
                    timeout,
                )
                .await;
            }
            return;
        }
        Ok(Some(Ok(other))) => format!("expected hello, got {other:?}"),
        Ok(Some(Err(e))) => format!("malformed handshake: {e}"),
        Ok(None) => {
            tracing::debug!(%peer, "Connection closed before hello");
            return;
        }
        Err(_) => format!("no hello within {timeout:?}"),
    };

    tracing::warn!(%peer, %reason, "HandshakeError");
    let rejected = TrackerMessage::Rejected { reason };
    if let Err(e) = send(&mut conn, rejected, timeout).await {
        tracing::debug!(%peer, error = %e, "Failed to deliver rejection");
    }
}

/// `host:port` with a non-empty host and a numeric port.
fn validate_addr(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("address '{addr}' is not host:port"))?;
    if host.trim_matches(['[', ']']).is_empty() {
        return Err(format!("address '{addr}' has no host"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("address '{addr}' has an invalid port"))?;
    Ok(())
}

async fn bind_with_search(config: &BootstrapConfig) -> Result<TcpListener, BootstrapError> {
    let attempts = if config.port == 0 {
        1
    } else {
        config.port_search.max(1)
    };

    let mut last_error = None;
    for offset in 0..attempts {
        let Some(port) = config.port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::trace!(port, "Port in use, trying next");
                last_error = Some(e);
            }
            Err(e) => {
                return Err(BootstrapError::io(format!(
                    "failed to bind {}:{}: {e}",
                    config.host, port
                )));
            }
        }
    }

    Err(BootstrapError::io(format!(
        "no free port in {}..{} on {}: {}",
        config.port,
        config.port.saturating_add(attempts),
        config.host,
        last_error.map_or_else(|| "port range exhausted".to_string(), |e| e.to_string()),
    )))
}

fn advertised_addr(config: &BootstrapConfig, local_addr: SocketAddr) -> String {
    match &config.advertise_host {
        Some(host) => format!("{host}:{}", local_addr.port()),
        None if local_addr.ip().is_unspecified() => {
            SocketAddr::new(outbound_ip(), local_addr.port()).to_string()
        }
        None => local_addr.to_string(),
    }
}

/// Address of the interface used for outbound traffic; loopback when offline.
///
/// Connecting a UDP socket sends nothing, it only selects a route.
fn outbound_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::WorkerCodec;
    use crate::error::ErrorKind;

    type WorkerSide = Framed<TcpStream, WorkerCodec>;

    fn local_config(n: usize) -> BootstrapConfig {
        BootstrapConfig::new(n)
            .with_host("127.0.0.1")
            .with_port(0)
            .with_handshake_timeout(Duration::from_secs(5))
            .with_rendezvous_timeout(Duration::from_secs(10))
    }

    async fn connect(server: SocketAddr) -> WorkerSide {
        let stream = TcpStream::connect(server).await.unwrap();
        Framed::new(stream, WorkerCodec::new())
    }

    async fn hello(conn: &mut WorkerSide, claim: RankClaim, addr: &str) -> TrackerMessage {
        conn.send(WorkerMessage::Hello {
            claim,
            addr: addr.to_string(),
            session: None,
        })
        .await
        .unwrap();
        conn.next().await.unwrap().unwrap()
    }

    async fn finish(conn: &mut WorkerSide) -> (TrackerMessage, TrackerMessage) {
        let release = conn.next().await.unwrap().unwrap();
        conn.send(WorkerMessage::Ack).await.unwrap();
        let start = conn.next().await.unwrap().unwrap();
        (release, start)
    }

    #[test]
    fn addresses_need_host_and_port() {
        assert!(validate_addr("node-1:7000").is_ok());
        assert!(validate_addr("[::1]:7000").is_ok());
        assert!(validate_addr("node-1").is_err());
        assert!(validate_addr(":7000").is_err());
        assert!(validate_addr("node-1:http").is_err());
    }

    #[test]
    fn advertise_host_overrides_bound_address() {
        let config = local_config(1).with_advertise_host("tracker.internal");
        let local: SocketAddr = "0.0.0.0:9091".parse().unwrap();
        assert_eq!(advertised_addr(&config, local), "tracker.internal:9091");

        let bound: SocketAddr = "127.0.0.1:9091".parse().unwrap();
        assert_eq!(advertised_addr(&local_config(1), bound), "127.0.0.1:9091");
    }

    #[tokio::test]
    async fn port_search_skips_busy_port() {
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();

        let config = local_config(1).with_port(port).with_port_search(20);
        let server = RendezvousServer::bind(config).await.unwrap();
        assert_ne!(server.local_addr().port(), port);
        assert!(server.local_addr().port() > port);
    }

    #[tokio::test]
    async fn releases_tree_in_requested_order() {
        let server = RendezvousServer::bind(local_config(3)).await.unwrap();
        let addr = server.local_addr();
        let status = server.status();
        let run = tokio::spawn(server.run());

        let mut workers = Vec::new();
        for rank in [2, 0, 1] {
            let mut conn = connect(addr).await;
            let reply = hello(
                &mut conn,
                RankClaim::RequestRank { rank: Rank::new(rank) },
                &format!("worker-{rank}:7000"),
            )
            .await;
            assert!(matches!(
                reply,
                TrackerMessage::Assigned { rank: r, world_size: 3 } if r == Rank::new(rank)
            ));
            workers.push((rank, conn));
        }

        let mut released = HashMap::new();
        let finished = join_all(workers.iter_mut().map(|(_, conn)| finish(conn))).await;
        for ((rank, _), (release, start)) in workers.iter().zip(finished) {
            assert!(matches!(start, TrackerMessage::Start));
            match release {
                TrackerMessage::Release { neighbors, .. } => {
                    released.insert(*rank, neighbors);
                }
                other => panic!("expected release, got {other:?}"),
            }
        }

        let ranks = |peers: &Vec<Peer>| peers.iter().map(|p| p.rank.get()).collect::<Vec<_>>();
        assert_eq!(ranks(&released[&0]), vec![1, 2]);
        assert_eq!(ranks(&released[&1]), vec![0]);
        assert_eq!(ranks(&released[&2]), vec![0]);
        assert_eq!(released[&1][0].addr, "worker-0:7000");

        let envs = run.await.unwrap().unwrap();
        assert_eq!(envs.len(), 3);
        assert_eq!(envs[0].neighbor_ranks(), vec![Rank::new(1), Rank::new(2)]);
        assert_eq!(status.current(), SessionState::Released);
    }

    #[tokio::test]
    async fn duplicate_claim_has_one_winner() {
        let server = RendezvousServer::bind(local_config(2)).await.unwrap();
        let addr = server.local_addr();
        let run = tokio::spawn(server.run());

        let claim = RankClaim::RequestRank { rank: Rank::new(0) };
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        let (reply_a, reply_b) =
            tokio::join!(hello(&mut a, claim, "a:1"), hello(&mut b, claim, "b:1"));

        let a_won = matches!(reply_a, TrackerMessage::Assigned { .. });
        let (mut winner, winner_reply, loser_reply) = if a_won {
            (a, reply_a, reply_b)
        } else {
            (b, reply_b, reply_a)
        };
        assert!(matches!(winner_reply, TrackerMessage::Assigned { .. }));
        assert!(
            matches!(loser_reply, TrackerMessage::Rejected { ref reason } if reason.contains("already taken"))
        );

        let mut second = connect(addr).await;
        let reply = hello(&mut second, RankClaim::RequestRank { rank: Rank::new(1) }, "c:1").await;
        assert!(matches!(reply, TrackerMessage::Assigned { .. }));

        let (first, other) = tokio::join!(finish(&mut winner), finish(&mut second));
        assert!(matches!(first.1, TrackerMessage::Start));
        assert!(matches!(other.1, TrackerMessage::Start));
        assert_eq!(run.await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn timeout_aborts_connected_workers() {
        let config = local_config(3).with_rendezvous_timeout(Duration::from_millis(300));
        let server = RendezvousServer::bind(config).await.unwrap();
        let addr = server.local_addr();
        let status = server.status();
        let run = tokio::spawn(server.run());

        let mut conn = connect(addr).await;
        let reply = hello(&mut conn, RankClaim::AutoAssign, "a:1").await;
        assert!(matches!(reply, TrackerMessage::Assigned { .. }));

        let next = conn.next().await.unwrap().unwrap();
        assert!(matches!(next, TrackerMessage::Abort { ref reason } if reason.contains("rendezvous_timeout")));

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::RendezvousTimeout);
        assert!(err.detail.starts_with("1 of 3"));
        assert_eq!(status.current(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn malformed_hello_is_rejected_without_aborting() {
        let server = RendezvousServer::bind(local_config(1)).await.unwrap();
        let addr = server.local_addr();
        let run = tokio::spawn(server.run());

        let mut bad = connect(addr).await;
        bad.send(WorkerMessage::Ack).await.unwrap();
        assert!(matches!(
            bad.next().await.unwrap().unwrap(),
            TrackerMessage::Rejected { .. }
        ));

        let mut bad_addr = connect(addr).await;
        let reply = hello(&mut bad_addr, RankClaim::AutoAssign, "no-port").await;
        assert!(matches!(reply, TrackerMessage::Rejected { .. }));

        let mut good = connect(addr).await;
        let reply = hello(&mut good, RankClaim::AutoAssign, "a:1").await;
        assert!(matches!(reply, TrackerMessage::Assigned { .. }));
        let (release, start) = finish(&mut good).await;
        assert!(matches!(release, TrackerMessage::Release { ref neighbors, .. } if neighbors.is_empty()));
        assert!(matches!(start, TrackerMessage::Start));
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn mixed_claim_policies_are_rejected() {
        let server = RendezvousServer::bind(local_config(2)).await.unwrap();
        let addr = server.local_addr();
        let handle = server.abort_handle();
        let run = tokio::spawn(server.run());

        let mut first = connect(addr).await;
        assert!(matches!(
            hello(&mut first, RankClaim::AutoAssign, "a:1").await,
            TrackerMessage::Assigned { .. }
        ));

        let mut mixed = connect(addr).await;
        let reply = hello(&mut mixed, RankClaim::RequestRank { rank: Rank::new(1) }, "b:1").await;
        assert!(matches!(reply, TrackerMessage::Rejected { ref reason } if reason.contains("auto-assigned")));

        // A rejected auto-assigned session still waits for its last worker.
        handle.abort(BootstrapError::spawn("test finished"));
        assert!(matches!(
            first.next().await.unwrap().unwrap(),
            TrackerMessage::Abort { .. }
        ));
        assert!(run.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn retries_exhausted_aborts_session() {
        let config = local_config(2).with_max_retries(1);
        let server = RendezvousServer::bind(config).await.unwrap();
        let addr = server.local_addr();
        let run = tokio::spawn(server.run());

        let mut holder = connect(addr).await;
        let claim = RankClaim::RequestRank { rank: Rank::new(0) };
        assert!(matches!(
            hello(&mut holder, claim, "a:1").await,
            TrackerMessage::Assigned { .. }
        ));

        for _ in 0..2 {
            let mut dup = connect(addr).await;
            assert!(matches!(
                hello(&mut dup, claim, "b:1").await,
                TrackerMessage::Rejected { .. }
            ));
        }

        assert!(matches!(
            holder.next().await.unwrap().unwrap(),
            TrackerMessage::Abort { .. }
        ));
        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Handshake);
    }

    #[tokio::test]
    async fn missing_ack_aborts_everyone() {
        let server = RendezvousServer::bind(
            local_config(2).with_handshake_timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        let run = tokio::spawn(server.run());

        let mut good = connect(addr).await;
        let mut silent = connect(addr).await;
        assert!(matches!(
            hello(&mut good, RankClaim::AutoAssign, "a:1").await,
            TrackerMessage::Assigned { .. }
        ));
        assert!(matches!(
            hello(&mut silent, RankClaim::AutoAssign, "b:1").await,
            TrackerMessage::Assigned { .. }
        ));

        // `good` acknowledges, `silent` never does.
        let release = good.next().await.unwrap().unwrap();
        assert!(matches!(release, TrackerMessage::Release { .. }));
        good.send(WorkerMessage::Ack).await.unwrap();
        assert!(matches!(
            silent.next().await.unwrap().unwrap(),
            TrackerMessage::Release { .. }
        ));

        assert!(matches!(
            good.next().await.unwrap().unwrap(),
            TrackerMessage::Abort { .. }
        ));
        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Dispatch);
    }

    #[tokio::test]
    async fn dropped_worker_frees_its_rank() {
        // Any "already taken" rejection would abort with zero retries.
        let config = local_config(2).with_max_retries(0);
        let server = RendezvousServer::bind(config).await.unwrap();
        let addr = server.local_addr();
        let run = tokio::spawn(server.run());

        let claim = RankClaim::RequestRank { rank: Rank::new(0) };
        let mut first = connect(addr).await;
        assert!(matches!(
            hello(&mut first, claim, "a:1").await,
            TrackerMessage::Assigned { .. }
        ));
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut again = connect(addr).await;
        assert!(matches!(
            hello(&mut again, claim, "a:2").await,
            TrackerMessage::Assigned { rank, .. } if rank == Rank::new(0)
        ));
        let mut other = connect(addr).await;
        assert!(matches!(
            hello(&mut other, RankClaim::RequestRank { rank: Rank::new(1) }, "b:1").await,
            TrackerMessage::Assigned { .. }
        ));

        let (_, (release, start)) = tokio::join!(finish(&mut again), finish(&mut other));
        assert!(matches!(start, TrackerMessage::Start));
        match release {
            TrackerMessage::Release { neighbors, .. } => assert_eq!(neighbors[0].addr, "a:2"),
            other => panic!("expected release, got {other:?}"),
        }
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_auto_worker_rank_is_reassigned() {
        let server = RendezvousServer::bind(local_config(2)).await.unwrap();
        let addr = server.local_addr();
        let status = server.status();
        let run = tokio::spawn(server.run());

        let mut first = connect(addr).await;
        assert!(matches!(
            hello(&mut first, RankClaim::AutoAssign, "a:1").await,
            TrackerMessage::Assigned { rank, .. } if rank == Rank::new(0)
        ));
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut workers = Vec::new();
        for (expected, worker_addr) in [(0, "b:1"), (1, "c:1")] {
            let mut conn = connect(addr).await;
            assert!(matches!(
                hello(&mut conn, RankClaim::AutoAssign, worker_addr).await,
                TrackerMessage::Assigned { rank, .. } if rank == Rank::new(expected)
            ));
            workers.push(conn);
        }

        let finished = join_all(workers.iter_mut().map(finish)).await;
        assert!(finished.iter().all(|(_, start)| matches!(start, TrackerMessage::Start)));
        let envs = run.await.unwrap().unwrap();
        assert_eq!(envs[1].neighbors[0].addr, "b:1");
        assert_eq!(status.current(), SessionState::Released);
    }

    #[tokio::test]
    async fn worker_gone_after_ack_aborts_everyone() {
        let server = RendezvousServer::bind(
            local_config(2).with_handshake_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        let status = server.status();
        let run = tokio::spawn(server.run());

        let mut stays = connect(addr).await;
        let mut leaves = connect(addr).await;
        assert!(matches!(
            hello(&mut stays, RankClaim::RequestRank { rank: Rank::new(0) }, "a:1").await,
            TrackerMessage::Assigned { .. }
        ));
        assert!(matches!(
            hello(&mut leaves, RankClaim::RequestRank { rank: Rank::new(1) }, "b:1").await,
            TrackerMessage::Assigned { .. }
        ));

        assert!(matches!(
            leaves.next().await.unwrap().unwrap(),
            TrackerMessage::Release { .. }
        ));
        leaves.send(WorkerMessage::Ack).await.unwrap();
        drop(leaves);

        assert!(matches!(
            stays.next().await.unwrap().unwrap(),
            TrackerMessage::Release { .. }
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stays.send(WorkerMessage::Ack).await.unwrap();

        assert!(matches!(
            stays.next().await.unwrap().unwrap(),
            TrackerMessage::Abort { ref reason } if reason.contains("rank 1")
        ));
        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Dispatch);
        assert_eq!(status.current(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn unread_rejection_does_not_block_admission() {
        let server = RendezvousServer::bind(local_config(1)).await.unwrap();
        let addr = server.local_addr();
        let run = tokio::spawn(server.run());

        // Never reads its rejection.
        let mut deaf = connect(addr).await;
        deaf.send(WorkerMessage::Hello {
            claim: RankClaim::AutoAssign,
            addr: "no-port".to_string(),
            session: None,
        })
        .await
        .unwrap();

        let mut good = connect(addr).await;
        let released = tokio::time::timeout(Duration::from_secs(2), async {
            let reply = hello(&mut good, RankClaim::AutoAssign, "a:1").await;
            assert!(matches!(reply, TrackerMessage::Assigned { .. }));
            finish(&mut good).await
        })
        .await
        .unwrap();
        assert!(matches!(released.1, TrackerMessage::Start));
        assert!(run.await.unwrap().is_ok());
        drop(deaf);
    }

    #[tokio::test]
    async fn abort_handle_stops_session() {
        let server = RendezvousServer::bind(local_config(2)).await.unwrap();
        let addr = server.local_addr();
        let handle = server.abort_handle();
        let run = tokio::spawn(server.run());

        let mut conn = connect(addr).await;
        assert!(matches!(
            hello(&mut conn, RankClaim::AutoAssign, "a:1").await,
            TrackerMessage::Assigned { .. }
        ));

        handle.abort(BootstrapError::spawn("mpirun exited with status 1"));
        assert!(matches!(
            conn.next().await.unwrap().unwrap(),
            TrackerMessage::Abort { ref reason } if reason.contains("mpirun")
        ));
        assert_eq!(run.await.unwrap().unwrap_err().kind, ErrorKind::Spawn);
    }
}
