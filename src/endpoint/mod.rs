//! The transport endpoint: public operations and the per-connection engine.
//!
//! An [`Endpoint`] owns every connection and listen socket of one peer. The
//! application calls its operations from any thread; inbound traffic is fed
//! in through [`handle_signal`] and [`handle_datagram`]; timers run whenever
//! [`poll_at`] is called (the bundled [`crate::driver`] does this from a
//! background task).
//!
//! Locking: the shared registry mutex covers only handle lookup and
//! connection setup/teardown; each connection record has its own mutex, so
//! data-plane operations on different connections never contend. The lock
//! order is registry, then connection, then the event queue; I/O and
//! observer callbacks run with no locks held, so collaborators may freely
//! call back into the endpoint.
//!
//! [`handle_signal`]: Endpoint::handle_signal
//! [`handle_datagram`]: Endpoint::handle_datagram
//! [`poll_at`]: Endpoint::poll_at

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::Config;
use crate::connection::{Connection, ConnectionInfo, ConnectionState, ListenSocket};
use crate::core::constants::{
    DATA_FRAME_HEADER_SIZE, REASON_CONNECT_TIMEOUT, REASON_NOT_AUTHORIZED, REASON_NO_LISTENER,
    REASON_QUEUE_OVERFLOW, REASON_RETRANSMIT_LIMIT, REASON_ROUTE_FAILED,
};
use crate::core::{
    ConnectionObserver, IdentityProvider, PacketTransport, PeerId, SendOutcome, SignalingChannel,
    TransportError,
};
use crate::events::{ConnectionEvent, EventDispatcher};
use crate::registry::{ConnectionHandle, ListenSocketHandle, Registry};
use crate::reliability::{AbsorbResult, SendFlags};
use crate::rendezvous::{
    symmetric_initiator, RendezvousCoordinator, RendezvousStatus, RoutePath,
};
use crate::wire::{pack_frames, unpack_frames, Frame, Signal};

type SharedConnection = Arc<Mutex<Connection>>;

/// Outbound I/O collected while locks are held and performed after release.
#[derive(Default)]
struct Effects {
    /// `(peer, relayed, payload)` datagrams for the packet transport.
    datagrams: Vec<(PeerId, bool, Vec<u8>)>,
    /// Signals for the signaling channel.
    signals: Vec<(PeerId, Signal)>,
}

/// Registry-level state: handle allocation, lookup indexes, listen sockets.
struct Shared {
    conns: Registry<ConnectionHandle, SharedConnection>,
    listens: Registry<ListenSocketHandle, ListenSocket>,
    /// Demux index: connection token -> handle. Maintained for every live
    /// record, lingering ones included, since acks must still route to them.
    by_token: HashMap<u64, ConnectionHandle>,
    symmetric: bool,
    token_seed: u64,
}

impl Shared {
    /// Generate a fresh non-zero connection or probe token (splitmix64).
    fn next_token(&mut self) -> u64 {
        loop {
            self.token_seed = self.token_seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = self.token_seed;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            let token = z ^ (z >> 31);
            if token != 0 && !self.by_token.contains_key(&token) {
                return token;
            }
        }
    }
}

/// A peer-to-peer transport endpoint.
pub struct Endpoint {
    config: Config,
    transport: Arc<dyn PacketTransport>,
    signaling: Arc<dyn SignalingChannel>,
    identity: Arc<dyn IdentityProvider>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    shared: Mutex<Shared>,
    events: Mutex<EventDispatcher>,
    /// Serializes observer delivery so per-connection event order survives
    /// concurrent drains. Taken with `try_lock` only: a re-entrant call from
    /// inside the observer leaves its events for the active drainer.
    dispatch_gate: Mutex<()>,
}

impl Endpoint {
    /// Create an endpoint over the given collaborators.
    ///
    /// Without an observer (see [`with_observer`](Self::with_observer))
    /// state-change events are buffered and retrieved with
    /// [`poll_event`](Self::poll_event).
    pub fn new(
        config: Config,
        transport: Arc<dyn PacketTransport>,
        signaling: Arc<dyn SignalingChannel>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let token_seed = identity.local_identity().raw();
        let max_pending_events = config.max_pending_events;
        Self {
            config,
            transport,
            signaling,
            identity,
            observer: None,
            shared: Mutex::new(Shared {
                conns: Registry::new(),
                listens: Registry::new(),
                by_token: HashMap::new(),
                symmetric: false,
                token_seed,
            }),
            events: Mutex::new(EventDispatcher::new(max_pending_events)),
            dispatch_gate: Mutex::new(()),
        }
    }

    /// Register a state-change observer. Events go to the observer instead
    /// of the internal queue from then on.
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The local peer identity.
    pub fn local_identity(&self) -> PeerId {
        self.identity.local_identity()
    }

    /// Enable or disable symmetric connect mode.
    ///
    /// In symmetric mode two peers dialing each other on the same virtual
    /// port end up with exactly one connection on each side instead of two
    /// crossed ones. The peer with the lower identity keeps the initiator
    /// role and its token becomes canonical.
    pub fn set_symmetric_connect(&self, enabled: bool) {
        self.lock_shared().symmetric = enabled;
    }

    // ------------------------------------------------------------------
    // Locking and effect helpers
    // ------------------------------------------------------------------

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_conn(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
        conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry lookup only; the returned record is locked separately.
    fn find_conn(&self, handle: ConnectionHandle) -> Option<SharedConnection> {
        self.lock_shared().conns.get(handle).cloned()
    }

    fn find_conn_by_token(&self, token: u64) -> Option<(ConnectionHandle, SharedConnection)> {
        let shared = self.lock_shared();
        let handle = *shared.by_token.get(&token)?;
        let conn = shared.conns.get(handle)?.clone();
        Some((handle, conn))
    }

    /// Drop a record and its token index.
    fn remove_record(&self, handle: ConnectionHandle) {
        let mut shared = self.lock_shared();
        if let Some(conn) = shared.conns.remove(handle) {
            let token = Self::lock_conn(&conn).token;
            shared.by_token.remove(&token);
        }
    }

    /// Apply a state transition and queue its event. The caller holds the
    /// connection lock, which serializes the transition and the enqueue and
    /// so preserves per-connection event order.
    fn record_transition(&self, conn: &mut Connection, state: ConnectionState, reason: i32) {
        if let Some(event) = conn.transition_to(state, reason) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
    }

    /// Perform collected I/O and deliver pending events. Must be called with
    /// no locks held.
    fn finish(&self, fx: Effects) {
        for (peer, relayed, datagram) in &fx.datagrams {
            self.transport.send_datagram(*peer, *relayed, datagram);
        }
        for (peer, signal) in &fx.signals {
            self.signaling.send_signal(*peer, &signal.encode());
        }
        self.dispatch_events();
    }

    fn dispatch_events(&self) {
        let Some(observer) = &self.observer else {
            return;
        };
        let Ok(_gate) = self.dispatch_gate.try_lock() else {
            return;
        };
        loop {
            let event = self
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop();
            match event {
                Some(event) => observer.on_state_changed(&event),
                None => break,
            }
        }
    }

    /// Largest datagram produced when packing frames: one full data
    /// fragment with its header and length prefix.
    fn datagram_budget(&self) -> usize {
        self.config.mtu_payload + DATA_FRAME_HEADER_SIZE + 2
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Dial a peer on a virtual port.
    ///
    /// Returns immediately with the new handle; progress is reported through
    /// connection events. In symmetric mode a matching inbound or outbound
    /// attempt for the same peer and port is merged into one connection.
    pub fn connect(
        &self,
        peer: PeerId,
        virtual_port: u16,
    ) -> Result<ConnectionHandle, TransportError> {
        if peer == self.identity.local_identity() {
            return Err(TransportError::InvalidParam("cannot connect to self"));
        }
        let now = Instant::now();
        let mut fx = Effects::default();
        let mut shared = self.lock_shared();

        if shared.symmetric {
            let matching = shared.conns.iter().find_map(|(h, c)| {
                let c = Self::lock_conn(c);
                (!c.app_closed
                    && c.peer == peer
                    && c.virtual_port == virtual_port
                    && c.state == ConnectionState::Connecting)
                    .then_some((h, c.initiator))
            });
            match matching {
                Some((handle, true)) => {
                    // Already dialing; hand back the same attempt.
                    return Ok(handle);
                }
                Some((handle, false)) => {
                    // The peer dialed first; adopt its connection.
                    tracing::debug!(%peer, virtual_port, "symmetric connect merged with inbound attempt");
                    self.accept_locked(&mut shared, handle, now, &mut fx)?;
                    drop(shared);
                    self.finish(fx);
                    return Ok(handle);
                }
                None => {}
            }
        }

        let handle = shared.conns.allocate();
        let token = shared.next_token();
        let mut conn = Connection::new_at(
            now,
            &self.config,
            handle,
            peer,
            virtual_port,
            token,
            true,
            None,
        );
        self.record_transition(&mut conn, ConnectionState::Connecting, 0);
        shared.by_token.insert(token, handle);
        shared.conns.insert(handle, Arc::new(Mutex::new(conn)));
        drop(shared);

        fx.signals.push((
            peer,
            Signal::ConnectRequest {
                from: self.identity.local_identity(),
                virtual_port,
                token,
            },
        ));
        tracing::debug!(%peer, virtual_port, connection = %handle, "connecting");
        self.finish(fx);
        Ok(handle)
    }

    /// Bind a listen socket to a virtual port.
    pub fn create_listen_socket(
        &self,
        virtual_port: u16,
    ) -> Result<ListenSocketHandle, TransportError> {
        let mut shared = self.lock_shared();
        if shared
            .listens
            .iter()
            .any(|(_, l)| l.virtual_port == virtual_port)
        {
            return Err(TransportError::InvalidParam("virtual port already bound"));
        }
        let handle = shared.listens.allocate();
        shared.listens.insert(handle, ListenSocket::new(virtual_port));
        tracing::debug!(virtual_port, listen_socket = %handle, "listening");
        Ok(handle)
    }

    /// Accept an inbound connection that is waiting in `Connecting`.
    pub fn accept_connection(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let now = Instant::now();
        let mut fx = Effects::default();
        let mut shared = self.lock_shared();
        self.accept_locked(&mut shared, connection, now, &mut fx)?;
        drop(shared);
        self.finish(fx);
        Ok(())
    }

    fn accept_locked(
        &self,
        shared: &mut Shared,
        connection: ConnectionHandle,
        now: Instant,
        fx: &mut Effects,
    ) -> Result<(), TransportError> {
        let listen = {
            let Some(conn) = shared.conns.get(connection) else {
                return Err(TransportError::InvalidParam("unknown connection handle"));
            };
            let conn = Self::lock_conn(conn);
            if conn.app_closed {
                return Err(TransportError::InvalidParam("unknown connection handle"));
            }
            if conn.initiator || conn.state != ConnectionState::Connecting {
                return Err(TransportError::InvalidState);
            }
            conn.listen_socket
        };
        if let Some(lh) = listen {
            if let Some(socket) = shared.listens.get_mut(lh) {
                socket.pending.retain(|&h| h != connection);
            }
        }
        self.begin_finding_route(shared, connection, now, true, fx);
        Ok(())
    }

    /// Close a connection, invalidating its handle.
    ///
    /// With `linger` set, queued reliable data keeps draining in the
    /// background for a bounded window before the record is dropped; without
    /// it, undelivered data is discarded. Idempotent: closing an unknown or
    /// already-closed handle returns `false`.
    pub fn close_connection(
        &self,
        connection: ConnectionHandle,
        reason: i32,
        linger: bool,
    ) -> bool {
        let now = Instant::now();
        let mut fx = Effects::default();
        let mut shared = self.lock_shared();

        let Some(conn) = shared.conns.get(connection) else {
            return false;
        };
        let conn = conn.clone();
        let (remove, listen) = {
            let mut conn = Self::lock_conn(&conn);
            if conn.app_closed {
                return false;
            }
            let peer = conn.peer;
            let token = conn.token;
            let listen = conn.listen_socket;

            if linger
                && conn.state == ConnectionState::Connected
                && conn.outbound.has_pending_reliable()
            {
                // Keep draining in the background; the Close frame goes out
                // once the queue empties or the linger window expires.
                conn.app_closed = true;
                conn.end_reason = reason;
                conn.lingering_until = Some(now + self.config.linger_timeout);
                conn.rendezvous = None;
                conn.outbound.force_flush();
                let _ = self.pump_outbound(&mut conn, now, &mut fx);
                tracing::debug!(connection = %connection, "closing with linger");
                (false, listen)
            } else {
                match conn.state {
                    ConnectionState::Connecting => {
                        fx.signals.push((peer, Signal::ConnectReject { token, reason }));
                    }
                    ConnectionState::FindingRoute | ConnectionState::Connected => {
                        let relayed = matches!(conn.route, Some(RoutePath::Relayed));
                        fx.datagrams.push((
                            peer,
                            relayed,
                            single_datagram(&Frame::Close { token, reason }),
                        ));
                    }
                    _ => {}
                }
                conn.outbound.discard_all();
                (true, listen)
            }
        };
        if remove {
            if let Some(conn) = shared.conns.remove(connection) {
                let token = Self::lock_conn(&conn).token;
                shared.by_token.remove(&token);
            }
            if let Some(lh) = listen {
                if let Some(socket) = shared.listens.get_mut(lh) {
                    socket.pending.retain(|&h| h != connection);
                }
            }
            tracing::debug!(connection = %connection, reason, "connection closed");
        }
        drop(shared);
        self.finish(fx);
        true
    }

    /// Close a listen socket. Pending inbound connections that were never
    /// accepted are rejected. Returns `false` for an unknown handle.
    pub fn close_listen_socket(&self, listen: ListenSocketHandle) -> bool {
        let mut fx = Effects::default();
        let mut shared = self.lock_shared();
        let Some(socket) = shared.listens.remove(listen) else {
            return false;
        };
        for handle in socket.pending {
            if let Some(conn) = shared.conns.remove(handle) {
                let (peer, token) = {
                    let conn = Self::lock_conn(&conn);
                    (conn.peer, conn.token)
                };
                shared.by_token.remove(&token);
                fx.signals.push((
                    peer,
                    Signal::ConnectReject {
                        token,
                        reason: REASON_NO_LISTENER,
                    },
                ));
            }
        }
        drop(shared);
        tracing::debug!(listen_socket = %listen, "listen socket closed");
        self.finish(fx);
        true
    }

    /// Snapshot a connection's status. `None` for unknown handles.
    pub fn connection_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo> {
        let conn = self.find_conn(connection)?;
        let conn = Self::lock_conn(&conn);
        (!conn.app_closed).then(|| conn.info())
    }

    /// Take the oldest buffered state-change event.
    ///
    /// Only meaningful without an observer; with one registered, events are
    /// delivered through it instead.
    pub fn poll_event(&self) -> Option<ConnectionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Queue a message for delivery.
    ///
    /// Sends are accepted from `Connecting` onward and transmitted once the
    /// connection is fully established. `Ok(Ignored)` reports a NoDelay
    /// message dropped by policy rather than an error.
    pub fn send(
        &self,
        connection: ConnectionHandle,
        payload: &[u8],
        flags: SendFlags,
    ) -> Result<SendOutcome, TransportError> {
        flags.validate()?;
        if payload.len() > self.config.max_message_size {
            return Err(TransportError::InvalidParam(
                "message exceeds the maximum message size",
            ));
        }
        if !flags.reliable && payload.len() > self.config.mtu_payload {
            return Err(TransportError::InvalidParam(
                "unreliable message exceeds the datagram payload budget",
            ));
        }
        let Some(conn) = self.find_conn(connection) else {
            return Err(TransportError::InvalidParam("unknown connection handle"));
        };

        let now = Instant::now();
        let mut fx = Effects::default();
        {
            let mut conn = Self::lock_conn(&conn);
            if conn.app_closed {
                return Err(TransportError::InvalidParam("unknown connection handle"));
            }
            if conn.state.is_quasi_terminal() {
                return Err(TransportError::NoConnection);
            }
            if !conn.state.can_send() {
                return Err(TransportError::InvalidState);
            }
            if flags.no_delay
                && conn
                    .outbound
                    .no_delay_would_drop(conn.state == ConnectionState::Connected)
            {
                return Ok(SendOutcome::Ignored);
            }

            if flags.reliable {
                conn.outbound.enqueue_reliable_at(now, payload)?;
            } else {
                conn.outbound.enqueue_unreliable_at(now, payload.to_vec())?;
            }
            if flags.no_nagle || flags.no_delay {
                conn.outbound.force_flush();
            }
            if flags.use_current_thread || flags.no_delay {
                self.pump_and_check(&mut conn, now, &mut fx);
            }
        }
        self.finish(fx);
        Ok(SendOutcome::Queued)
    }

    /// Put any Nagle-held data on the wire without waiting out the delay.
    ///
    /// `Ok(Ignored)` when nothing is eligible to flush: no data is being
    /// held, or the connection is not yet fully established (nothing can go
    /// on the wire before `Connected`).
    pub fn flush(&self, connection: ConnectionHandle) -> Result<SendOutcome, TransportError> {
        let Some(conn) = self.find_conn(connection) else {
            return Err(TransportError::InvalidParam("unknown connection handle"));
        };
        let now = Instant::now();
        let mut fx = Effects::default();
        {
            let mut conn = Self::lock_conn(&conn);
            if conn.app_closed {
                return Err(TransportError::InvalidParam("unknown connection handle"));
            }
            if conn.state.is_quasi_terminal() {
                return Err(TransportError::NoConnection);
            }
            if conn.state != ConnectionState::Connected || !conn.outbound.has_nagle_pending() {
                return Ok(SendOutcome::Ignored);
            }
            conn.outbound.force_flush();
            self.pump_and_check(&mut conn, now, &mut fx);
        }
        self.finish(fx);
        Ok(SendOutcome::Queued)
    }

    /// Retrieve the next queued inbound message into `buf`.
    ///
    /// `Ok(None)` when no message is waiting. A message larger than `buf`
    /// fails with `BufferTooSmall` and is dropped either way. Messages
    /// already queued remain retrievable after the connection ends.
    pub fn receive(
        &self,
        connection: ConnectionHandle,
        buf: &mut [u8],
    ) -> Result<Option<usize>, TransportError> {
        let Some(conn) = self.find_conn(connection) else {
            return Err(TransportError::InvalidParam("unknown connection handle"));
        };
        let mut conn = Self::lock_conn(&conn);
        if conn.app_closed {
            return Err(TransportError::InvalidParam("unknown connection handle"));
        }
        match conn.inbound.pop(buf.len())? {
            Some(message) => {
                buf[..message.len()].copy_from_slice(&message);
                Ok(Some(message.len()))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------

    /// Feed one signaling payload received from `from`.
    ///
    /// Malformed or stale signals are logged and dropped; remote input is
    /// never an application error.
    pub fn handle_signal(&self, from: PeerId, payload: &[u8]) {
        let signal = match Signal::decode(payload) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::debug!(%from, %err, "dropping malformed signal");
                return;
            }
        };
        let now = Instant::now();
        let mut fx = Effects::default();
        match signal {
            Signal::ConnectRequest {
                from: claimed,
                virtual_port,
                token,
            } => {
                if claimed != from {
                    tracing::warn!(%from, %claimed, "connect request identity mismatch");
                } else {
                    let mut shared = self.lock_shared();
                    self.on_connect_request(&mut shared, from, virtual_port, token, now, &mut fx);
                }
            }
            Signal::ConnectAccept { token } => {
                let mut shared = self.lock_shared();
                let accepted = shared.by_token.get(&token).copied().filter(|&h| {
                    shared.conns.get(h).is_some_and(|c| {
                        let c = Self::lock_conn(c);
                        !c.app_closed
                            && c.peer == from
                            && c.initiator
                            && c.state == ConnectionState::Connecting
                    })
                });
                match accepted {
                    Some(handle) => {
                        self.begin_finding_route(&mut shared, handle, now, false, &mut fx);
                    }
                    None => tracing::debug!(%from, "ignoring stray connect accept"),
                }
            }
            Signal::ConnectReject { token, reason } => {
                let mut shared = self.lock_shared();
                self.on_connect_reject(&mut shared, from, token, reason);
            }
            Signal::Candidates {
                token,
                direct,
                relay_ticket,
            } => {
                if let Some((_, conn)) = self.find_conn_by_token(token) {
                    let mut conn = Self::lock_conn(&conn);
                    if conn.peer == from {
                        match conn.rendezvous.as_mut() {
                            Some(rendezvous) => rendezvous.on_candidates(direct, relay_ticket),
                            None => conn.pending_candidates = Some((direct, relay_ticket)),
                        }
                        self.pump_rendezvous(&mut conn, now, &mut fx);
                    }
                }
            }
        }
        self.finish(fx);
    }

    fn on_connect_request(
        &self,
        shared: &mut Shared,
        from: PeerId,
        virtual_port: u16,
        token: u64,
        now: Instant,
        fx: &mut Effects,
    ) {
        if shared.by_token.contains_key(&token) {
            return; // duplicate request for a known connection
        }

        if shared.symmetric {
            let outgoing = shared.conns.iter().find_map(|(h, c)| {
                let c = Self::lock_conn(c);
                (!c.app_closed
                    && c.initiator
                    && c.peer == from
                    && c.virtual_port == virtual_port
                    && c.state == ConnectionState::Connecting)
                    .then_some(h)
            });
            if let Some(handle) = outgoing {
                if symmetric_initiator(self.identity.local_identity(), from) {
                    // Our dial wins the race; the peer adopts our token when
                    // our request reaches it.
                    return;
                }
                // The peer's dial wins: rebind to its token and auto-accept.
                tracing::debug!(%from, virtual_port, "symmetric connect: adopting peer token");
                if let Some(conn) = shared.conns.get(handle) {
                    let mut conn = Self::lock_conn(conn);
                    let old = conn.token;
                    conn.token = token;
                    conn.initiator = false;
                    drop(conn);
                    shared.by_token.remove(&old);
                    shared.by_token.insert(token, handle);
                }
                self.begin_finding_route(shared, handle, now, true, fx);
                return;
            }
        }

        if !self.identity.authorize_peer(from) {
            tracing::debug!(%from, "rejecting unauthorized peer");
            fx.signals.push((
                from,
                Signal::ConnectReject {
                    token,
                    reason: REASON_NOT_AUTHORIZED,
                },
            ));
            return;
        }
        let listen = shared
            .listens
            .iter()
            .find_map(|(h, l)| (l.virtual_port == virtual_port).then_some(h));
        let Some(listen) = listen else {
            tracing::debug!(%from, virtual_port, "no listen socket for connect request");
            fx.signals.push((
                from,
                Signal::ConnectReject {
                    token,
                    reason: REASON_NO_LISTENER,
                },
            ));
            return;
        };

        let handle = shared.conns.allocate();
        let mut conn = Connection::new_at(
            now,
            &self.config,
            handle,
            from,
            virtual_port,
            token,
            false,
            Some(listen),
        );
        self.record_transition(&mut conn, ConnectionState::Connecting, 0);
        shared.by_token.insert(token, handle);
        shared.conns.insert(handle, Arc::new(Mutex::new(conn)));
        if let Some(socket) = shared.listens.get_mut(listen) {
            socket.pending.push(handle);
        }
        tracing::debug!(%from, virtual_port, connection = %handle, "inbound connection pending");
    }

    fn on_connect_reject(&self, shared: &mut Shared, from: PeerId, token: u64, reason: i32) {
        let Some(&handle) = shared.by_token.get(&token) else {
            return;
        };
        let listen = {
            let Some(conn) = shared.conns.get(handle) else {
                return;
            };
            let mut conn = Self::lock_conn(conn);
            if conn.peer != from || conn.state != ConnectionState::Connecting {
                return;
            }
            self.record_transition(&mut conn, ConnectionState::ClosedByPeer, reason);
            conn.outbound.discard_all();
            conn.listen_socket
        };
        if let Some(lh) = listen {
            if let Some(socket) = shared.listens.get_mut(lh) {
                socket.pending.retain(|&h| h != handle);
            }
        }
    }

    /// Feed one datagram received from `from` over the direct or relay path.
    pub fn handle_datagram(&self, from: PeerId, relayed: bool, payload: &[u8]) {
        let frames = match unpack_frames(payload) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::debug!(%from, %err, "dropping malformed datagram");
                return;
            }
        };
        let now = Instant::now();
        let mut fx = Effects::default();
        for frame in frames {
            self.handle_frame(from, relayed, frame, now, &mut fx);
        }
        self.finish(fx);
    }

    fn handle_frame(
        &self,
        from: PeerId,
        arrived_relayed: bool,
        frame: Frame,
        now: Instant,
        fx: &mut Effects,
    ) {
        let Some((handle, conn)) = self.find_conn_by_token(frame.token()) else {
            tracing::trace!(%from, token = frame.token(), "frame for unknown connection");
            return;
        };
        let mut remove = false;
        {
            let mut conn = Self::lock_conn(&conn);
            if conn.peer != from {
                tracing::warn!(%from, expected = %conn.peer, "frame peer does not match its token");
                return;
            }
            match frame {
                Frame::Data {
                    reliable,
                    seq,
                    frag_index,
                    frag_count,
                    payload,
                    ..
                } => {
                    if conn.app_closed
                        || conn.state == ConnectionState::Connecting
                        || conn.state.is_quasi_terminal()
                    {
                        return;
                    }
                    if conn.state == ConnectionState::FindingRoute {
                        // Application data on a path proves the path; no
                        // need to wait for our own probe to come back.
                        self.establish_route(&mut conn, arrived_relayed, now, fx);
                    }
                    if reliable {
                        if conn.inbound.absorb_reliable(seq, frag_index, frag_count, payload)
                            == AbsorbResult::Overflow
                        {
                            conn.outbound.discard_all();
                            self.record_transition(
                                &mut conn,
                                ConnectionState::ProblemDetectedLocally,
                                REASON_QUEUE_OVERFLOW,
                            );
                            return;
                        }
                        if let Some((next_expected, bitmap)) = conn.inbound.take_ack() {
                            let relayed = matches!(conn.route, Some(RoutePath::Relayed));
                            fx.datagrams.push((
                                conn.peer,
                                relayed,
                                single_datagram(&Frame::Ack {
                                    token: conn.token,
                                    next_expected,
                                    bitmap,
                                }),
                            ));
                        }
                    } else {
                        let _ = conn.inbound.absorb_unreliable(payload);
                    }
                }
                Frame::Ack {
                    next_expected,
                    bitmap,
                    ..
                } => {
                    conn.outbound.handle_ack(next_expected, bitmap);
                }
                Frame::RouteProbe { probe, relayed, .. } => {
                    if conn.app_closed
                        || !matches!(
                            conn.state,
                            ConnectionState::FindingRoute | ConnectionState::Connected
                        )
                    {
                        return;
                    }
                    fx.datagrams.push((
                        conn.peer,
                        relayed,
                        single_datagram(&Frame::RouteReply {
                            token: conn.token,
                            probe,
                            relayed,
                        }),
                    ));
                }
                Frame::RouteReply { probe, relayed, .. } => {
                    let confirmed = conn
                        .rendezvous
                        .as_mut()
                        .and_then(|r| r.on_probe_reply(probe, relayed));
                    if confirmed.is_some() {
                        self.establish_route(&mut conn, relayed, now, fx);
                    }
                }
                Frame::Close { reason, .. } => {
                    conn.rendezvous = None;
                    conn.outbound.discard_all();
                    if conn.app_closed {
                        remove = true;
                    } else {
                        let target = match conn.state {
                            ConnectionState::Connecting | ConnectionState::Connected => {
                                Some(ConnectionState::ClosedByPeer)
                            }
                            ConnectionState::FindingRoute => {
                                Some(ConnectionState::ProblemDetectedLocally)
                            }
                            _ => None,
                        };
                        if let Some(target) = target {
                            self.record_transition(&mut conn, target, reason);
                        }
                    }
                }
            }
        }
        if remove {
            self.remove_record(handle);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run every due timer: connect deadlines, route probes, Nagle expiry,
    /// retransmissions, and linger cleanup.
    pub fn poll(&self) {
        self.poll_at(Instant::now());
    }

    /// [`poll`](Self::poll) with an explicit clock, for deterministic tests.
    pub fn poll_at(&self, now: Instant) {
        let handles = self.lock_shared().conns.handles();
        let mut fx = Effects::default();
        let mut dead = Vec::new();

        for handle in handles {
            let Some(conn) = self.find_conn(handle) else {
                continue;
            };
            let mut conn = Self::lock_conn(&conn);

            if conn.app_closed {
                let failed = self.pump_outbound(&mut conn, now, &mut fx);
                let expired = conn.lingering_until.map_or(true, |until| now >= until);
                if failed || expired || !conn.outbound.has_pending_reliable() {
                    // Tell the peer we are done, then drop the record.
                    let relayed = matches!(conn.route, Some(RoutePath::Relayed));
                    fx.datagrams.push((
                        conn.peer,
                        relayed,
                        single_datagram(&Frame::Close {
                            token: conn.token,
                            reason: conn.end_reason,
                        }),
                    ));
                    dead.push(handle);
                }
                continue;
            }

            match conn.state {
                ConnectionState::Connecting | ConnectionState::FindingRoute
                    if now >= conn.connect_deadline =>
                {
                    conn.rendezvous = None;
                    self.record_transition(
                        &mut conn,
                        ConnectionState::ProblemDetectedLocally,
                        REASON_CONNECT_TIMEOUT,
                    );
                }
                ConnectionState::FindingRoute => {
                    self.pump_rendezvous(&mut conn, now, &mut fx);
                }
                ConnectionState::Connected => {
                    self.pump_and_check(&mut conn, now, &mut fx);
                }
                _ => {}
            }
        }

        for handle in dead {
            self.remove_record(handle);
            tracing::debug!(connection = %handle, "lingering connection dropped");
        }
        self.finish(fx);
    }

    /// The next instant at which [`poll_at`](Self::poll_at) has work, for
    /// drivers that sleep between polls.
    pub fn next_deadline(&self) -> Option<Instant> {
        let shared = self.lock_shared();
        let mut deadline: Option<Instant> = None;
        for (_, conn) in shared.conns.iter() {
            let conn = Self::lock_conn(conn);
            if conn.app_closed {
                deadline = min_opt(deadline, conn.lingering_until);
                deadline = min_opt(deadline, conn.outbound.next_deadline());
                continue;
            }
            match conn.state {
                ConnectionState::Connecting => {
                    deadline = min_opt(deadline, Some(conn.connect_deadline));
                }
                ConnectionState::FindingRoute => {
                    deadline = min_opt(deadline, Some(conn.connect_deadline));
                    deadline = min_opt(
                        deadline,
                        conn.rendezvous
                            .as_ref()
                            .and_then(RendezvousCoordinator::next_deadline),
                    );
                }
                ConnectionState::Connected => {
                    deadline = min_opt(deadline, conn.outbound.next_deadline());
                }
                _ => {}
            }
        }
        deadline
    }

    // ------------------------------------------------------------------
    // Engine helpers
    // ------------------------------------------------------------------

    fn begin_finding_route(
        &self,
        shared: &mut Shared,
        handle: ConnectionHandle,
        now: Instant,
        send_accept: bool,
        fx: &mut Effects,
    ) {
        let probe_token = shared.next_token();
        let Some(conn) = shared.conns.get(handle) else {
            return;
        };
        let mut conn = Self::lock_conn(conn);
        let peer = conn.peer;
        let token = conn.token;
        self.record_transition(&mut conn, ConnectionState::FindingRoute, 0);
        let mut rendezvous = RendezvousCoordinator::new_at(now, &self.config, probe_token);
        if let Some((direct, ticket)) = conn.pending_candidates.take() {
            rendezvous.on_candidates(direct, ticket);
        }
        conn.rendezvous = Some(rendezvous);
        if send_accept {
            fx.signals.push((peer, Signal::ConnectAccept { token }));
        }
        fx.signals.push((
            peer,
            Signal::Candidates {
                token,
                direct: self.transport.direct_reachable(peer),
                relay_ticket: self.transport.relay_ticket(peer),
            },
        ));
        self.pump_rendezvous(&mut conn, now, fx);
    }

    /// Mark the route confirmed, move to `Connected`, and flush anything
    /// queued during the handshake.
    fn establish_route(&self, conn: &mut Connection, relayed: bool, now: Instant, fx: &mut Effects) {
        conn.rendezvous = None;
        conn.route = Some(if relayed {
            RoutePath::Relayed
        } else {
            RoutePath::Direct
        });
        self.record_transition(conn, ConnectionState::Connected, 0);
        self.pump_and_check(conn, now, fx);
    }

    /// Drive route probing; a failed negotiation becomes a local problem.
    fn pump_rendezvous(&self, conn: &mut Connection, now: Instant, fx: &mut Effects) {
        let Some(rendezvous) = conn.rendezvous.as_mut() else {
            return;
        };
        if let Some(probe) = rendezvous.poll_at(now) {
            fx.datagrams.push((
                conn.peer,
                probe.relayed,
                single_datagram(&Frame::RouteProbe {
                    token: conn.token,
                    probe: probe.probe,
                    relayed: probe.relayed,
                }),
            ));
        }
        if rendezvous.status() == RendezvousStatus::Failed {
            conn.rendezvous = None;
            self.record_transition(
                conn,
                ConnectionState::ProblemDetectedLocally,
                REASON_ROUTE_FAILED,
            );
        }
    }

    /// Emit everything the outbound queue has ready. Returns `true` when the
    /// retransmission budget has been exhausted.
    fn pump_outbound(&self, conn: &mut Connection, now: Instant, fx: &mut Effects) -> bool {
        let connected = conn.state == ConnectionState::Connected;
        let frames = conn.outbound.poll_transmit_at(now, connected, conn.token);
        if conn.outbound.is_failed() {
            return true;
        }
        if !frames.is_empty() {
            let relayed = matches!(conn.route, Some(RoutePath::Relayed));
            for datagram in pack_frames(&frames, self.datagram_budget()) {
                fx.datagrams.push((conn.peer, relayed, datagram));
            }
        }
        false
    }

    /// Pump the outbound queue and surface retransmission failure as a
    /// state transition.
    fn pump_and_check(&self, conn: &mut Connection, now: Instant, fx: &mut Effects) {
        if self.pump_outbound(conn, now, fx) && !conn.app_closed {
            conn.outbound.discard_all();
            conn.rendezvous = None;
            self.record_transition(
                conn,
                ConnectionState::ProblemDetectedLocally,
                REASON_RETRANSMIT_LIMIT,
            );
        }
    }
}

fn single_datagram(frame: &Frame) -> Vec<u8> {
    let mut datagram = pack_frames(std::slice::from_ref(frame), usize::MAX);
    datagram.pop().unwrap_or_default()
}

fn min_opt(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
