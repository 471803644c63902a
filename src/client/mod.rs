//! The MQTT session engine.
//!
//! [`MqttClient`] owns one long-lived session: the CONNECT handshake
//! (including enhanced authentication), the read loop, keep-alive,
//! publish/subscribe/unsubscribe issuance, QoS 1/2 acknowledgement
//! flows, topic-alias bookkeeping, session resumption with DUP-flagged
//! retransmission, auto-reconnect and the offline publish queue.
//!
//! Every acknowledgement wait is a one-shot rendezvous: the read loop is
//! the only producer, the issuing call the only consumer.

pub mod alias;
pub mod offline;
pub mod packet_id;
pub mod reconnect;
pub mod state;

use crate::codec::packet::{
    Ack, Auth, ConnAck, Connect, Disconnect, Packet, Publish, Qos, SubAck, Subscribe,
    Subscription, UnsubAck, Unsubscribe, Will,
};
use crate::codec::properties::Properties;
use crate::codec::reason;
use crate::config::ClientConfig;
use crate::error::MqttError;
use crate::net::Transport;
use alias::{InboundAliasTable, OutboundAliasTable};
use bytes::Bytes;
use offline::{OfflineQueue, QueuedPublish};
use packet_id::PacketIdAllocator;
use parking_lot::Mutex;
use state::{
    InflightPublish, PendingPublish, PendingQos2, PendingSubscribe, PendingUnsubscribe,
    ServerCapabilities, SessionState,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection lifecycle of a session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

/// An inbound delivery. The topic is always fully resolved; alias
/// resolution happens before a message becomes visible.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub properties: Properties,
}

type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn(&MqttError) + Send + Sync>;
type ReconnectingHandler = Arc<dyn Fn(u32) + Send + Sync>;
type ReconnectedHandler = Arc<dyn Fn() + Send + Sync>;
/// Enhanced-auth challenge handler: given the server's AUTH, produce the
/// next AUTH to send, or nothing to abort the exchange.
type AuthHandler = Arc<dyn Fn(&Auth) -> Option<Auth> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_message: Option<MessageHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_reconnecting: Option<ReconnectingHandler>,
    on_reconnected: Option<ReconnectedHandler>,
    on_auth: Option<AuthHandler>,
}

/// Outcome of dispatching one inbound packet.
enum Flow {
    Continue,
    /// The server closed the session with a DISCONNECT; the read loop
    /// must exit without entering the connection-loss path.
    ServerClosed,
}

/// Which pending table a cancellation guard owns an entry in.
#[derive(Clone, Copy)]
enum PendingKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Cleans up after an issuing call that goes away before the dispatcher
/// settles its acknowledgement.
///
/// Held across every `waiter.await`: if the future is dropped (caller
/// timeout, task abort), the guard removes the pending entry it
/// registered, returns the packet id to the allocator and restores the
/// send quota. A genuine ack arriving later then finds no entry and is
/// discarded silently. The registration token keeps a late-firing guard
/// from touching a newer flow that reused the same id; once the
/// dispatcher or the connection-loss path has taken the entry, the
/// guard is a no-op.
struct PendingGuard {
    shared: Arc<ClientShared>,
    packet_id: u16,
    token: u64,
    kind: PendingKind,
    /// True once the send quota was decremented for this flow.
    quota_charged: bool,
}

impl PendingGuard {
    fn new(shared: Arc<ClientShared>, packet_id: u16, token: u64, kind: PendingKind) -> Self {
        Self {
            shared,
            packet_id,
            token,
            kind,
            quota_charged: false,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let removed = {
            let mut st = self.shared.state.lock();
            let removed = match self.kind {
                PendingKind::Publish => {
                    st.remove_puback_matching(self.packet_id, self.token).is_some()
                        || st.remove_qos2_matching(self.packet_id, self.token).is_some()
                }
                PendingKind::Subscribe => st
                    .remove_suback_matching(self.packet_id, self.token)
                    .is_some(),
                PendingKind::Unsubscribe => st
                    .remove_unsuback_matching(self.packet_id, self.token)
                    .is_some(),
            };
            if removed && self.quota_charged {
                st.increment_send_quota();
            }
            removed
        };
        if removed {
            self.shared.alloc.release(self.packet_id);
            debug!(id = self.packet_id, "released abandoned pending request");
        }
    }
}

/// An in-flight QoS > 0 publish: the ack receiver plus the guard that
/// keeps its bookkeeping cancellation-safe.
struct AckWaiter {
    waiter: oneshot::Receiver<Result<(), MqttError>>,
    _guard: PendingGuard,
}

/// Asynchronous MQTT 5.0 client.
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct MqttClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    config: ClientConfig,
    state: Mutex<SessionState>,
    conn_state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<Transport>>>,
    alloc: PacketIdAllocator,
    inbound_aliases: Mutex<InboundAliasTable>,
    outbound_aliases: Mutex<OutboundAliasTable>,
    offline: OfflineQueue,
    callbacks: Mutex<Callbacks>,
    messages_tx: mpsc::UnboundedSender<Message>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    user_disconnect: AtomicBool,
    /// PINGREQs sent since the last PINGRESP.
    pending_pings: AtomicU32,
    /// Source of registration tokens for pending entries.
    pending_token: AtomicU64,
    /// Non-reentrant guard: only one reconnect loop runs at a time.
    reconnect_gate: tokio::sync::Mutex<()>,
}

impl MqttClient {
    pub fn new(config: ClientConfig) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let offline_capacity = config.offline_queue_capacity;
        Self {
            shared: Arc::new(ClientShared {
                config,
                state: Mutex::new(SessionState::new()),
                conn_state: Mutex::new(ConnectionState::Disconnected),
                transport: Mutex::new(None),
                alloc: PacketIdAllocator::new(),
                inbound_aliases: Mutex::new(InboundAliasTable::new(0)),
                outbound_aliases: Mutex::new(OutboundAliasTable::new(0)),
                offline: OfflineQueue::new(offline_capacity),
                callbacks: Mutex::new(Callbacks::default()),
                messages_tx,
                messages_rx: Mutex::new(Some(messages_rx)),
                read_task: Mutex::new(None),
                keepalive_task: Mutex::new(None),
                user_disconnect: AtomicBool::new(false),
                pending_pings: AtomicU32::new(0),
                pending_token: AtomicU64::new(1),
                reconnect_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Open the transport, run the CONNECT handshake and start the
    /// session. Returns once the offline queue has been flushed.
    pub async fn connect(&self) -> Result<(), MqttError> {
        self.shared.user_disconnect.store(false, Ordering::SeqCst);
        self.shared
            .connect_internal(self.shared.config.clean_start, false)
            .await
    }

    /// Gracefully disconnect with Normal disconnection.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.disconnect_with(reason::NORMAL_DISCONNECTION, None).await
    }

    /// Gracefully disconnect with an explicit reason code and optional
    /// session-expiry override.
    pub async fn disconnect_with(
        &self,
        reason_code: u8,
        session_expiry: Option<u32>,
    ) -> Result<(), MqttError> {
        let shared = &self.shared;
        shared.user_disconnect.store(true, Ordering::SeqCst);
        {
            let mut cs = shared.conn_state.lock();
            if *cs == ConnectionState::Disconnected {
                return Ok(());
            }
            *cs = ConnectionState::Disconnecting;
        }
        shared.abort_tasks();
        let error = MqttError::Connection("client disconnected".into());
        let ids = shared.state.lock().fail_and_clear_pending(&error);
        for id in ids {
            shared.alloc.release(id);
        }
        let transport = shared.transport.lock().take();
        if let Some(transport) = transport {
            let mut disconnect = Disconnect {
                reason_code,
                ..Default::default()
            };
            disconnect.properties.session_expiry_interval = session_expiry;
            // best effort: the socket may already be gone
            let _ = transport.send_packet(&Packet::Disconnect(disconnect)).await;
            transport.close().await;
        }
        *shared.conn_state.lock() = ConnectionState::Disconnected;
        info!("disconnected");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Publish / subscribe / unsubscribe
    // -----------------------------------------------------------------

    /// Publish without properties.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.publish_with_properties(topic, payload, qos, retain, &Properties::default())
            .await
    }

    /// Publish a message.
    ///
    /// QoS 0 resolves as soon as the bytes are written; QoS 1 resolves
    /// on PUBACK, QoS 2 on PUBCOMP. When the client is offline with
    /// auto-reconnect enabled the publish is queued and the call
    /// succeeds immediately.
    pub async fn publish_with_properties(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
        properties: &Properties,
    ) -> Result<(), MqttError> {
        let shared = &self.shared;
        let payload = payload.into();
        if shared.connection_state() != ConnectionState::Connected {
            if shared.config.auto_reconnect && !shared.user_disconnect.load(Ordering::SeqCst) {
                shared.offline.push(QueuedPublish {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain,
                    properties: properties.clone(),
                });
                debug!(topic, "queued publish while offline");
                return Ok(());
            }
            return Err(MqttError::IllegalState("not connected".into()));
        }
        let transport = shared.current_transport()?;
        let ack = shared
            .issue_publish(&transport, topic, payload, qos, retain, properties.clone())
            .await?;
        match ack {
            None => Ok(()),
            Some(ack) => {
                // the guard stays alive across the await so a dropped
                // call cleans up its pending entry, id and quota
                let AckWaiter { waiter, _guard } = ack;
                match waiter.await {
                    Ok(result) => result,
                    Err(_) => Err(MqttError::Connection(
                        "connection closed before acknowledgement".into(),
                    )),
                }
            }
        }
    }

    /// Subscribe to a single topic filter.
    ///
    /// The SUBACK is returned as-is: per-filter reason codes are not
    /// turned into errors, the caller inspects them.
    pub async fn subscribe(&self, topic_filter: &str, qos: Qos) -> Result<SubAck, MqttError> {
        self.subscribe_many(vec![Subscription::new(topic_filter, qos)])
            .await
    }

    /// Subscribe to several filters with one SUBSCRIBE packet.
    pub async fn subscribe_many(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<SubAck, MqttError> {
        self.shared.subscribe_many(subscriptions).await
    }

    /// Remove subscriptions. The UNSUBACK is returned as-is.
    pub async fn unsubscribe(&self, topic_filters: Vec<String>) -> Result<UnsubAck, MqttError> {
        self.shared.unsubscribe(topic_filters).await
    }

    // -----------------------------------------------------------------
    // Observable surface
    // -----------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    /// Stream of delivered messages. Can be taken exactly once.
    pub fn messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.shared.messages_rx.lock().take()
    }

    /// Informational snapshot of the offline queue size.
    pub fn offline_queue_size(&self) -> usize {
        self.shared.offline.len()
    }

    /// Informational snapshot of the packet identifiers currently
    /// reserved by in-flight QoS > 0 publishes and SUB/UNSUB requests.
    pub fn packet_ids_in_flight(&self) -> usize {
        self.shared.alloc.in_flight()
    }

    /// The server-assigned client identifier when one was issued,
    /// otherwise the configured one.
    pub fn client_id(&self) -> String {
        self.shared
            .state
            .lock()
            .server()
            .assigned_client_identifier
            .clone()
            .unwrap_or_else(|| self.shared.config.client_id.clone())
    }

    /// Limits and capabilities the server announced in its CONNACK.
    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.shared.state.lock().server().clone()
    }

    pub fn on_message(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.shared.callbacks.lock().on_message = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn(&MqttError) + Send + Sync + 'static) {
        self.shared.callbacks.lock().on_disconnect = Some(Arc::new(handler));
    }

    pub fn on_reconnecting(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        self.shared.callbacks.lock().on_reconnecting = Some(Arc::new(handler));
    }

    pub fn on_reconnected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared.callbacks.lock().on_reconnected = Some(Arc::new(handler));
    }

    /// Install the enhanced-authentication challenge handler.
    pub fn on_auth(&self, handler: impl Fn(&Auth) -> Option<Auth> + Send + Sync + 'static) {
        self.shared.callbacks.lock().on_auth = Some(Arc::new(handler));
    }
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

impl ClientShared {
    fn connection_state(&self) -> ConnectionState {
        *self.conn_state.lock()
    }

    fn current_transport(&self) -> Result<Arc<Transport>, MqttError> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| MqttError::IllegalState("not connected".into()))
    }

    fn abort_tasks(&self) {
        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.keepalive_task.lock().take() {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------

    /// Shared connect path. Reconnection always passes
    /// `clean_start = false` to request session resumption; the
    /// configured clean-start only governs user-initiated connects.
    async fn connect_internal(
        self: &Arc<Self>,
        clean_start: bool,
        reconnecting: bool,
    ) -> Result<(), MqttError> {
        self.config.validate()?;
        {
            let mut cs = self.conn_state.lock();
            match *cs {
                ConnectionState::Connected
                | ConnectionState::Connecting
                | ConnectionState::Disconnecting => {
                    return Err(MqttError::IllegalState(format!(
                        "connect while {:?}",
                        *cs
                    )));
                }
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            *cs = if reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
        }
        let result = self.connect_attempt(clean_start).await;
        if result.is_err() {
            let mut cs = self.conn_state.lock();
            *cs = if reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
        }
        result
    }

    async fn connect_attempt(self: &Arc<Self>, clean_start: bool) -> Result<(), MqttError> {
        self.state.lock().clear_for_reconnect(clean_start);
        self.pending_pings.store(0, Ordering::SeqCst);

        let tls_config = if self.config.use_tls {
            Some(self.config.tls.clone().unwrap_or_default())
        } else {
            None
        };
        let transport = tokio::time::timeout(
            self.config.connect_timeout(),
            Transport::connect(&self.config.host, self.config.port, tls_config.as_ref()),
        )
        .await
        .map_err(|_| {
            MqttError::Connection(format!(
                "connect timed out after {}s",
                self.config.connect_timeout_secs
            ))
        })??;
        let transport = Arc::new(transport);

        let connect = self.build_connect_packet(clean_start);
        transport.send_packet(&Packet::Connect(connect)).await?;

        let connack = match tokio::time::timeout(
            self.config.connect_timeout(),
            self.await_connack(&transport),
        )
        .await
        {
            Ok(Ok(connack)) => connack,
            Ok(Err(err)) => {
                transport.close().await;
                return Err(err);
            }
            Err(_) => {
                transport.close().await;
                return Err(MqttError::Connection(format!(
                    "CONNACK not received within {}s",
                    self.config.connect_timeout_secs
                )));
            }
        };
        if reason::is_error(connack.reason_code) {
            transport.close().await;
            return Err(MqttError::ConnectRejected(connack.reason_code));
        }

        {
            let mut st = self.state.lock();
            st.apply_connack(&connack);
            if let Some(limit) = st.server().maximum_packet_size {
                transport.set_max_outbound(limit);
            }
        }
        // fresh alias tables per network connection
        *self.inbound_aliases.lock() = InboundAliasTable::new(self.config.topic_alias_maximum);
        *self.outbound_aliases.lock() =
            OutboundAliasTable::new(connack.properties.topic_alias_maximum.unwrap_or(0));
        *self.transport.lock() = Some(Arc::clone(&transport));
        *self.conn_state.lock() = ConnectionState::Connected;
        info!(
            host = %self.config.host,
            port = self.config.port,
            session_present = connack.session_present,
            "connected"
        );

        self.spawn_read_task(Arc::clone(&transport));
        self.spawn_keepalive_task(Arc::clone(&transport));

        if connack.session_present {
            self.retransmit_inflight(&transport).await;
        } else {
            let abandoned = {
                let mut st = self.state.lock();
                st.fail_inflight_for_retry(&MqttError::Connection(
                    "session not resumed by server".into(),
                ))
            };
            if !abandoned.is_empty() {
                warn!(
                    count = abandoned.len(),
                    "server reported no session, dropping in-flight retry snapshot"
                );
            }
        }
        self.flush_offline_queue(&transport).await;
        Ok(())
    }

    fn build_connect_packet(&self, clean_start: bool) -> Connect {
        let cfg = &self.config;
        let mut properties = Properties::default();
        if cfg.session_expiry_interval != 0 {
            properties.session_expiry_interval = Some(cfg.session_expiry_interval);
        }
        if cfg.receive_maximum != state::DEFAULT_RECEIVE_MAXIMUM {
            properties.receive_maximum = Some(cfg.receive_maximum);
        }
        if cfg.maximum_packet_size != 0 {
            properties.maximum_packet_size = Some(cfg.maximum_packet_size);
        }
        if cfg.topic_alias_maximum != 0 {
            properties.topic_alias_maximum = Some(cfg.topic_alias_maximum);
        }
        if cfg.request_response_information {
            properties.request_response_information = Some(1);
        }
        if !cfg.request_problem_information {
            properties.request_problem_information = Some(0);
        }
        properties.user_properties = cfg.user_properties.clone();
        properties.authentication_method = cfg.authentication_method.clone();
        properties.authentication_data = cfg.authentication_data.clone().map(Bytes::from);

        Connect {
            client_id: cfg.client_id.clone(),
            clean_start,
            keep_alive: cfg.keep_alive_secs,
            properties,
            will: cfg.will.as_ref().map(|will| Will {
                topic: will.topic.clone(),
                payload: Bytes::from(will.payload.clone()),
                qos: will.qos,
                retain: will.retain,
                properties: will.properties.clone(),
            }),
            username: cfg.username.clone(),
            password: cfg.password.clone().map(Bytes::from),
        }
    }

    /// Read until the CONNACK arrives, driving the enhanced
    /// authentication exchange when the server interleaves AUTH packets.
    async fn await_connack(&self, transport: &Transport) -> Result<ConnAck, MqttError> {
        loop {
            let packet = transport.read_packet().await?.ok_or_else(|| {
                MqttError::Connection("connection closed during connect handshake".into())
            })?;
            match packet {
                Packet::ConnAck(connack) => return Ok(connack),
                Packet::Auth(auth) if auth.reason_code == reason::CONTINUE_AUTHENTICATION => {
                    let handler = self.callbacks.lock().on_auth.clone();
                    let Some(handler) = handler else {
                        return Err(MqttError::Auth(
                            "server requested enhanced authentication but no handler is installed"
                                .into(),
                        ));
                    };
                    match handler(&auth) {
                        Some(response) => {
                            transport.send_packet(&Packet::Auth(response)).await?;
                        }
                        None => {
                            return Err(MqttError::Auth(
                                "authentication handler produced no response to server challenge"
                                    .into(),
                            ));
                        }
                    }
                }
                // MQTT v5 requires the connect phase to end with CONNACK
                Packet::Auth(auth) => {
                    return Err(MqttError::Auth(format!(
                        "server ended AUTH exchange without CONNACK: {}",
                        reason::name(auth.reason_code)
                    )));
                }
                other => {
                    return Err(MqttError::protocol(format!(
                        "unexpected {} during connect handshake",
                        other.packet_type()
                    )));
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------

    fn spawn_read_task(self: &Arc<Self>, transport: Arc<Transport>) {
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match transport.read_packet().await {
                    Ok(Some(packet)) => match shared.dispatch(&transport, packet).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::ServerClosed) => break,
                        Err(err) => {
                            shared.spawn_connection_loss(err);
                            break;
                        }
                    },
                    Ok(None) => {
                        shared.spawn_connection_loss(MqttError::Connection(
                            "connection closed by server".into(),
                        ));
                        break;
                    }
                    Err(err) => {
                        shared.spawn_connection_loss(err);
                        break;
                    }
                }
            }
        });
        if let Some(old) = self.read_task.lock().replace(handle) {
            old.abort();
        }
    }

    fn spawn_keepalive_task(self: &Arc<Self>, transport: Arc<Transport>) {
        let effective = {
            let st = self.state.lock();
            st.server()
                .server_keep_alive
                .unwrap_or(self.config.keep_alive_secs)
        };
        if effective == 0 {
            if let Some(old) = self.keepalive_task.lock().take() {
                old.abort();
            }
            return;
        }
        let interval = std::time::Duration::from_secs(u64::from(effective));
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if shared.pending_pings.load(Ordering::SeqCst) >= 2 {
                    shared.spawn_connection_loss(MqttError::Connection(
                        "keep-alive timed out waiting for PINGRESP".into(),
                    ));
                    break;
                }
                shared.pending_pings.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = transport.send_packet(&Packet::PingReq).await {
                    shared.spawn_connection_loss(err);
                    break;
                }
            }
        });
        if let Some(old) = self.keepalive_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Run the connection-loss path on its own task so the detecting
    /// read or keep-alive task can exit immediately.
    fn spawn_connection_loss(self: &Arc<Self>, cause: MqttError) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.handle_connection_loss(cause).await;
        });
    }

    // -----------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------

    async fn dispatch(
        self: &Arc<Self>,
        transport: &Arc<Transport>,
        packet: Packet,
    ) -> Result<Flow, MqttError> {
        match packet {
            Packet::Publish(publish) => {
                self.handle_inbound_publish(transport, publish).await?;
            }
            Packet::PubAck(ack) => {
                let pending = {
                    let mut st = self.state.lock();
                    let pending = st.remove_puback(ack.packet_id);
                    if pending.is_some() {
                        st.increment_send_quota();
                    }
                    pending
                };
                match pending {
                    Some(pending) => {
                        self.alloc.release(ack.packet_id);
                        let result = if reason::is_error(ack.reason_code) {
                            Err(MqttError::PublishRejected(ack.reason_code))
                        } else {
                            Ok(())
                        };
                        let _ = pending.done.send(result);
                    }
                    // e.g. the issuing call was cancelled mid-flight
                    None => debug!(id = ack.packet_id, "PUBACK without pending publish"),
                }
            }
            Packet::PubRec(ack) => {
                if reason::is_error(ack.reason_code) {
                    let pending = {
                        let mut st = self.state.lock();
                        let pending = st.remove_qos2(ack.packet_id);
                        if pending.is_some() {
                            st.increment_send_quota();
                        }
                        pending
                    };
                    if let Some(pending) = pending {
                        self.alloc.release(ack.packet_id);
                        let _ = pending
                            .done
                            .send(Err(MqttError::PublishRejected(ack.reason_code)));
                    }
                } else if self.state.lock().mark_pubrec(ack.packet_id) {
                    transport
                        .send_packet(&Packet::PubRel(Ack::new(ack.packet_id)))
                        .await?;
                } else {
                    debug!(id = ack.packet_id, "PUBREC without pending publish");
                }
            }
            Packet::PubRel(ack) => {
                self.state.lock().finish_qos2_in(ack.packet_id);
                transport
                    .send_packet(&Packet::PubComp(Ack::new(ack.packet_id)))
                    .await?;
            }
            Packet::PubComp(ack) => {
                let pending = {
                    let mut st = self.state.lock();
                    let pending = st.remove_qos2(ack.packet_id);
                    if pending.is_some() {
                        st.increment_send_quota();
                    }
                    pending
                };
                match pending {
                    Some(pending) => {
                        self.alloc.release(ack.packet_id);
                        let result = if reason::is_error(ack.reason_code) {
                            Err(MqttError::PublishRejected(ack.reason_code))
                        } else {
                            Ok(())
                        };
                        let _ = pending.done.send(result);
                    }
                    None => debug!(id = ack.packet_id, "PUBCOMP without pending publish"),
                }
            }
            Packet::SubAck(suback) => {
                let pending = self.state.lock().remove_suback(suback.packet_id);
                match pending {
                    Some(pending) => {
                        self.alloc.release(suback.packet_id);
                        self.state
                            .lock()
                            .mirror_suback(&pending.subscriptions, &suback.reason_codes);
                        let _ = pending.done.send(Ok(suback));
                    }
                    None => debug!(id = suback.packet_id, "SUBACK without pending subscribe"),
                }
            }
            Packet::UnsubAck(unsuback) => {
                let pending = self.state.lock().remove_unsuback(unsuback.packet_id);
                match pending {
                    Some(pending) => {
                        self.alloc.release(unsuback.packet_id);
                        self.state
                            .lock()
                            .mirror_unsuback(&pending.topic_filters, &unsuback.reason_codes);
                        let _ = pending.done.send(Ok(unsuback));
                    }
                    None => {
                        debug!(id = unsuback.packet_id, "UNSUBACK without pending unsubscribe");
                    }
                }
            }
            Packet::PingResp => {
                self.pending_pings.store(0, Ordering::SeqCst);
            }
            Packet::Disconnect(disconnect) => {
                return self.handle_server_disconnect(transport, disconnect).await;
            }
            Packet::Auth(auth) => {
                let handler = self.callbacks.lock().on_auth.clone();
                match handler {
                    Some(handler) => {
                        if let Some(reply) = handler(&auth) {
                            transport.send_packet(&Packet::Auth(reply)).await?;
                        }
                    }
                    None => warn!("AUTH received but no handler is installed"),
                }
            }
            other @ (Packet::Connect(_)
            | Packet::ConnAck(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq) => {
                return Err(MqttError::protocol(format!(
                    "unexpected {} from server",
                    other.packet_type()
                )));
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_inbound_publish(
        self: &Arc<Self>,
        transport: &Arc<Transport>,
        publish: Publish,
    ) -> Result<(), MqttError> {
        let topic = self
            .inbound_aliases
            .lock()
            .resolve(&publish.topic, publish.properties.topic_alias)?;
        match publish.qos {
            Qos::AtMostOnce => {
                self.deliver(topic, publish);
            }
            Qos::AtLeastOnce => {
                let id = publish
                    .packet_id
                    .ok_or_else(|| MqttError::malformed("QoS 1 publish without packet id"))?;
                self.deliver(topic, publish);
                transport.send_packet(&Packet::PubAck(Ack::new(id))).await?;
            }
            Qos::ExactlyOnce => {
                let id = publish
                    .packet_id
                    .ok_or_else(|| MqttError::malformed("QoS 2 publish without packet id"))?;
                if self.state.lock().begin_qos2_in(id) {
                    self.deliver(topic, publish);
                } else {
                    debug!(id, "suppressed duplicate QoS 2 publish");
                }
                transport.send_packet(&Packet::PubRec(Ack::new(id))).await?;
            }
        }
        Ok(())
    }

    fn deliver(&self, topic: String, publish: Publish) {
        let message = Message {
            topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            properties: publish.properties,
        };
        let handler = self.callbacks.lock().on_message.clone();
        if let Some(handler) = handler {
            handler(&message);
        }
        let _ = self.messages_tx.send(message);
    }

    async fn handle_server_disconnect(
        self: &Arc<Self>,
        transport: &Arc<Transport>,
        disconnect: Disconnect,
    ) -> Result<Flow, MqttError> {
        warn!(
            reason = reason::name(disconnect.reason_code),
            code = disconnect.reason_code,
            "server closed the session"
        );
        let cause = MqttError::Connection(format!(
            "disconnected by server: {} (0x{:02x})",
            reason::name(disconnect.reason_code),
            disconnect.reason_code
        ));
        let ids = self.state.lock().fail_and_clear_pending(&cause);
        for id in ids {
            self.alloc.release(id);
        }
        transport.close().await;
        if let Some(handle) = self.keepalive_task.lock().take() {
            handle.abort();
        }
        *self.transport.lock() = None;
        let callback = self.callbacks.lock().on_disconnect.clone();
        if let Some(callback) = callback {
            callback(&cause);
        }
        // a server-issued DISCONNECT is terminal; auto-reconnect stays out
        *self.conn_state.lock() = ConnectionState::Disconnected;
        Ok(Flow::ServerClosed)
    }

    // -----------------------------------------------------------------
    // Outbound publish issuance
    // -----------------------------------------------------------------

    fn next_pending_token(&self) -> u64 {
        self.pending_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one publish on the wire. For QoS > 0 the returned waiter
    /// resolves at the terminal acknowledgement; quota and packet-id
    /// bookkeeping is completed by the dispatcher on a genuine ack, and
    /// by the waiter's guard on every other exit path (send failure,
    /// caller cancellation).
    async fn issue_publish(
        self: &Arc<Self>,
        transport: &Arc<Transport>,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
        properties: Properties,
    ) -> Result<Option<AckWaiter>, MqttError> {
        let (wire_topic, alias) = self.outbound_aliases.lock().apply(topic);
        let mut wire_properties = properties.clone();
        wire_properties.topic_alias = alias;

        if qos == Qos::AtMostOnce {
            let packet = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: wire_topic,
                packet_id: None,
                properties: wire_properties,
                payload,
            });
            transport.send_packet(&packet).await?;
            return Ok(None);
        }

        let packet_id = self.alloc.allocate()?;
        let token = self.next_pending_token();
        let mut guard =
            PendingGuard::new(Arc::clone(self), packet_id, token, PendingKind::Publish);
        // the retry snapshot must stand alone on a fresh connection:
        // full topic, no alias
        let mut snapshot_properties = properties;
        snapshot_properties.topic_alias = None;
        let snapshot = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id: Some(packet_id),
            properties: snapshot_properties,
            payload: payload.clone(),
        };
        let (done, waiter) = oneshot::channel();
        {
            let mut st = self.state.lock();
            if qos == Qos::AtLeastOnce {
                st.register_puback(
                    packet_id,
                    PendingPublish {
                        publish: snapshot,
                        done,
                        token,
                    },
                );
            } else {
                st.register_qos2(
                    packet_id,
                    PendingQos2 {
                        publish: snapshot,
                        pubrec_received: false,
                        done,
                        token,
                    },
                );
            }
        }

        let wire = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: wire_topic,
            packet_id: Some(packet_id),
            properties: wire_properties,
            payload,
        });
        // a failed send drops the guard, which unregisters the pending
        // entry and releases the id
        transport.send_packet(&wire).await?;
        self.state.lock().decrement_send_quota();
        guard.quota_charged = true;
        Ok(Some(AckWaiter {
            waiter,
            _guard: guard,
        }))
    }

    // -----------------------------------------------------------------
    // Subscribe / unsubscribe
    // -----------------------------------------------------------------

    async fn subscribe_many(
        self: &Arc<Self>,
        subscriptions: Vec<Subscription>,
    ) -> Result<SubAck, MqttError> {
        if subscriptions.is_empty() {
            return Err(MqttError::IllegalState(
                "subscribe requires at least one topic filter".into(),
            ));
        }
        if self.connection_state() != ConnectionState::Connected {
            return Err(MqttError::IllegalState("not connected".into()));
        }
        let transport = self.current_transport()?;
        let packet_id = self.alloc.allocate()?;
        let token = self.next_pending_token();
        // held across the await: a dropped call or a failed send
        // unregisters the completion and releases the id
        let _guard = PendingGuard::new(Arc::clone(self), packet_id, token, PendingKind::Subscribe);
        let (done, waiter) = oneshot::channel();
        self.state.lock().register_suback(
            packet_id,
            PendingSubscribe {
                subscriptions: subscriptions.clone(),
                done,
                token,
            },
        );
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            properties: Properties::default(),
            subscriptions,
        });
        transport.send_packet(&packet).await?;
        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(MqttError::Connection(
                "connection closed before SUBACK".into(),
            )),
        }
    }

    async fn unsubscribe(
        self: &Arc<Self>,
        topic_filters: Vec<String>,
    ) -> Result<UnsubAck, MqttError> {
        if topic_filters.is_empty() {
            return Err(MqttError::IllegalState(
                "unsubscribe requires at least one topic filter".into(),
            ));
        }
        if self.connection_state() != ConnectionState::Connected {
            return Err(MqttError::IllegalState("not connected".into()));
        }
        let transport = self.current_transport()?;
        let packet_id = self.alloc.allocate()?;
        let token = self.next_pending_token();
        // held across the await: a dropped call or a failed send
        // unregisters the completion and releases the id
        let _guard =
            PendingGuard::new(Arc::clone(self), packet_id, token, PendingKind::Unsubscribe);
        let (done, waiter) = oneshot::channel();
        self.state.lock().register_unsuback(
            packet_id,
            PendingUnsubscribe {
                topic_filters: topic_filters.clone(),
                done,
                token,
            },
        );
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            properties: Properties::default(),
            topic_filters,
        });
        transport.send_packet(&packet).await?;
        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(MqttError::Connection(
                "connection closed before UNSUBACK".into(),
            )),
        }
    }

    // -----------------------------------------------------------------
    // Connection loss and reconnect
    // -----------------------------------------------------------------

    async fn handle_connection_loss(self: &Arc<Self>, cause: MqttError) {
        {
            let mut cs = self.conn_state.lock();
            if *cs != ConnectionState::Connected {
                return;
            }
            *cs = ConnectionState::Disconnected;
        }
        warn!(error = %cause, "connection lost");
        let callback = self.callbacks.lock().on_disconnect.clone();
        if let Some(callback) = callback {
            callback(&cause);
        }

        let retry = self.config.auto_reconnect && !self.user_disconnect.load(Ordering::SeqCst);
        if retry {
            // snapshot before failing so unacked QoS 1/2 flows survive
            let ids = self.state.lock().save_inflight_for_retry();
            for id in ids {
                self.alloc.release(id);
            }
        }
        let error = MqttError::Connection("Connection lost".into());
        let ids = self.state.lock().fail_and_clear_pending(&error);
        for id in ids {
            self.alloc.release(id);
        }

        self.abort_tasks();
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
        }

        if retry {
            *self.conn_state.lock() = ConnectionState::Reconnecting;
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                shared.attempt_reconnect(cause).await;
            });
        }
    }

    async fn attempt_reconnect(self: &Arc<Self>, mut cause: MqttError) {
        // non-reentrant: a second concurrent entry returns immediately
        let Ok(_gate) = self.reconnect_gate.try_lock() else {
            return;
        };
        let strategy = self.config.effective_reconnect_strategy();
        let mut attempt: u32 = 1;
        loop {
            if self.user_disconnect.load(Ordering::SeqCst) {
                *self.conn_state.lock() = ConnectionState::Disconnected;
                return;
            }
            let Some(delay) = strategy.next_delay(attempt, &cause) else {
                warn!(attempt, error = %cause, "reconnect strategy gave up");
                let error = MqttError::Connection(format!("reconnect abandoned: {cause}"));
                let ids = {
                    let mut st = self.state.lock();
                    let mut ids = st.fail_inflight_for_retry(&error);
                    ids.extend(st.fail_and_clear_pending(&error));
                    ids
                };
                for id in ids {
                    self.alloc.release(id);
                }
                *self.conn_state.lock() = ConnectionState::Disconnected;
                return;
            };
            let callback = self.callbacks.lock().on_reconnecting.clone();
            if let Some(callback) = callback {
                callback(attempt);
            }
            info!(attempt, "reconnecting");

            self.abort_tasks();
            let stale = self.transport.lock().take();
            if let Some(stale) = stale {
                stale.close().await;
            }

            match self.connect_internal(false, true).await {
                Ok(()) => {
                    self.resubscribe().await;
                    let callback = self.callbacks.lock().on_reconnected.clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                    info!(attempt, "reconnected");
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "reconnect attempt failed");
                    cause = err;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Restore the saved subscription map with one batched SUBSCRIBE.
    async fn resubscribe(self: &Arc<Self>) {
        let subscriptions: Vec<Subscription> = self
            .state
            .lock()
            .subscriptions()
            .iter()
            .map(|(filter, &qos)| Subscription::new(filter.clone(), qos))
            .collect();
        if subscriptions.is_empty() {
            return;
        }
        let count = subscriptions.len();
        match self.subscribe_many(subscriptions).await {
            Ok(_) => info!(count, "restored subscriptions"),
            Err(err) => warn!(error = %err, "failed to restore subscriptions"),
        }
    }

    // -----------------------------------------------------------------
    // Retransmission and offline flush
    // -----------------------------------------------------------------

    /// Resend the snapshot of unacknowledged QoS 1/2 flows on a resumed
    /// session. QoS 2 flows that already saw a PUBREC continue with
    /// PUBREL; everything else is retransmitted with DUP set.
    async fn retransmit_inflight(self: &Arc<Self>, transport: &Arc<Transport>) {
        let mut entries: std::collections::VecDeque<InflightPublish> =
            self.state.lock().take_inflight_for_retry().into();
        while let Some(entry) = entries.pop_front() {
            let InflightPublish {
                packet_id,
                publish,
                pubrec_received,
                done,
            } = entry;
            if !self.alloc.reserve(packet_id) {
                warn!(packet_id, "packet id already in use, skipping retransmission");
                continue;
            }
            let token = self.next_pending_token();
            let resend = if publish.qos == Qos::ExactlyOnce && pubrec_received {
                self.state.lock().register_qos2(
                    packet_id,
                    PendingQos2 {
                        publish,
                        pubrec_received: true,
                        done,
                        token,
                    },
                );
                Packet::PubRel(Ack::new(packet_id))
            } else if publish.qos == Qos::ExactlyOnce {
                let mut dup = publish.clone();
                dup.dup = true;
                self.state.lock().register_qos2(
                    packet_id,
                    PendingQos2 {
                        publish,
                        pubrec_received: false,
                        done,
                        token,
                    },
                );
                Packet::Publish(dup)
            } else {
                let mut dup = publish.clone();
                dup.dup = true;
                self.state.lock().register_puback(
                    packet_id,
                    PendingPublish {
                        publish,
                        done,
                        token,
                    },
                );
                Packet::Publish(dup)
            };
            if let Err(err) = transport.send_packet(&resend).await {
                warn!(packet_id, error = %err, "retransmission send failed");
                // the entry is registered again; the connection-loss
                // path will re-snapshot it along with the rest
                let mut st = self.state.lock();
                for rest in entries {
                    st.push_inflight_for_retry(rest);
                }
                return;
            }
            self.state.lock().decrement_send_quota();
            debug!(packet_id, "retransmitted in-flight publish");
        }
    }

    /// Drain the offline queue in FIFO order. QoS > 0 completions are
    /// observed by detached waiters; a failed send puts the entry back
    /// at the head and stops the flush.
    async fn flush_offline_queue(self: &Arc<Self>, transport: &Arc<Transport>) {
        while let Some(entry) = self.offline.pop_front() {
            let result = self
                .issue_publish(
                    transport,
                    &entry.topic,
                    entry.payload.clone(),
                    entry.qos,
                    entry.retain,
                    entry.properties.clone(),
                )
                .await;
            match result {
                Ok(None) => {}
                Ok(Some(ack)) => {
                    let topic = entry.topic.clone();
                    tokio::spawn(async move {
                        let AckWaiter { waiter, _guard } = ack;
                        match waiter.await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                warn!(topic = %topic, error = %err, "queued publish failed")
                            }
                            Err(_) => {
                                warn!(topic = %topic, "queued publish lost its connection")
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(topic = %entry.topic, error = %err, "offline flush interrupted, re-queueing");
                    self.offline.push_front(entry);
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
