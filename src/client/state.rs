//! Per-session protocol state.
//!
//! One instance lives inside the session engine behind a single mutex;
//! there is no mutation path that bypasses it. The pending tables hold
//! the one-shot rendezvous for every in-flight request, and
//! `inflight_for_retry` snapshots unacknowledged QoS 1/2 flows across a
//! connection loss so they can be retransmitted on session resumption.

use crate::codec::packet::{ConnAck, Publish, Qos, SubAck, Subscription, UnsubAck};
use crate::codec::reason;
use crate::error::MqttError;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;

/// Default send quota when the server does not announce a Receive
/// Maximum.
pub const DEFAULT_RECEIVE_MAXIMUM: u16 = 65_535;

/// Negotiated server limits and capabilities from the CONNACK.
#[derive(Debug, Clone)]
pub struct ServerCapabilities {
    pub session_present: bool,
    pub maximum_qos: Qos,
    pub retain_available: bool,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: u16,
    pub receive_maximum: u16,
    pub wildcard_subscription_available: bool,
    pub shared_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub server_keep_alive: Option<u16>,
    pub assigned_client_identifier: Option<String>,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            session_present: false,
            maximum_qos: Qos::ExactlyOnce,
            retain_available: true,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            receive_maximum: DEFAULT_RECEIVE_MAXIMUM,
            wildcard_subscription_available: true,
            shared_subscription_available: true,
            subscription_identifiers_available: true,
            server_keep_alive: None,
            assigned_client_identifier: None,
        }
    }
}

impl ServerCapabilities {
    pub fn from_connack(connack: &ConnAck) -> Self {
        let props = &connack.properties;
        Self {
            session_present: connack.session_present,
            maximum_qos: props
                .maximum_qos
                .and_then(|v| Qos::from_u8(v).ok())
                .unwrap_or(Qos::ExactlyOnce),
            retain_available: props.retain_available != Some(0),
            maximum_packet_size: props.maximum_packet_size,
            topic_alias_maximum: props.topic_alias_maximum.unwrap_or(0),
            receive_maximum: match props.receive_maximum {
                Some(0) | None => DEFAULT_RECEIVE_MAXIMUM,
                Some(v) => v,
            },
            wildcard_subscription_available: props.wildcard_subscription_available != Some(0),
            shared_subscription_available: props.shared_subscription_available != Some(0),
            subscription_identifiers_available: props.subscription_identifier_available != Some(0),
            server_keep_alive: props.server_keep_alive,
            assigned_client_identifier: props.assigned_client_identifier.clone(),
        }
    }
}

/// One-shot rendezvous for a QoS 1 publish.
///
/// `token` identifies this registration: a cancellation guard only
/// removes the entry it registered, never a later flow that reused the
/// packet id.
#[derive(Debug)]
pub struct PendingPublish {
    pub publish: Publish,
    pub done: oneshot::Sender<Result<(), MqttError>>,
    pub token: u64,
}

/// One-shot rendezvous for a QoS 2 publish, with the PUBREC milestone.
#[derive(Debug)]
pub struct PendingQos2 {
    pub publish: Publish,
    pub pubrec_received: bool,
    pub done: oneshot::Sender<Result<(), MqttError>>,
    pub token: u64,
}

#[derive(Debug)]
pub struct PendingSubscribe {
    pub subscriptions: Vec<Subscription>,
    pub done: oneshot::Sender<Result<SubAck, MqttError>>,
    pub token: u64,
}

#[derive(Debug)]
pub struct PendingUnsubscribe {
    pub topic_filters: Vec<String>,
    pub done: oneshot::Sender<Result<UnsubAck, MqttError>>,
    pub token: u64,
}

/// Snapshot of one unacknowledged QoS 1/2 flow taken at connection loss.
///
/// Carries the original completion so the issuing call observes the
/// outcome of the retransmitted flow rather than the outage.
#[derive(Debug)]
pub struct InflightPublish {
    pub packet_id: u16,
    pub publish: Publish,
    pub pubrec_received: bool,
    pub done: oneshot::Sender<Result<(), MqttError>>,
}

/// Session state owned by one engine, mutated only under its lock.
#[derive(Debug, Default)]
pub struct SessionState {
    pending_puback: HashMap<u16, PendingPublish>,
    pending_qos2_out: HashMap<u16, PendingQos2>,
    pending_qos2_in: HashSet<u16>,
    pending_suback: HashMap<u16, PendingSubscribe>,
    pending_unsuback: HashMap<u16, PendingUnsubscribe>,
    subscriptions: HashMap<String, Qos>,
    server: ServerCapabilities,
    send_quota: u16,
    inflight_for_retry: Vec<InflightPublish>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            send_quota: DEFAULT_RECEIVE_MAXIMUM,
            ..Default::default()
        }
    }

    // -----------------------------------------------------------------
    // CONNACK
    // -----------------------------------------------------------------

    /// Absorb the negotiated limits of a fresh connection and reset the
    /// send quota to the server's receive maximum.
    pub fn apply_connack(&mut self, connack: &ConnAck) {
        self.server = ServerCapabilities::from_connack(connack);
        self.send_quota = self.server.receive_maximum;
    }

    pub fn server(&self) -> &ServerCapabilities {
        &self.server
    }

    // -----------------------------------------------------------------
    // Send quota
    // -----------------------------------------------------------------

    pub fn send_quota(&self) -> u16 {
        self.send_quota
    }

    pub fn decrement_send_quota(&mut self) {
        self.send_quota = self.send_quota.saturating_sub(1);
    }

    pub fn increment_send_quota(&mut self) {
        self.send_quota = self
            .send_quota
            .saturating_add(1)
            .min(self.server.receive_maximum);
    }

    // -----------------------------------------------------------------
    // Pending registration
    // -----------------------------------------------------------------

    pub fn register_puback(&mut self, packet_id: u16, pending: PendingPublish) {
        self.pending_puback.insert(packet_id, pending);
    }

    pub fn register_qos2(&mut self, packet_id: u16, pending: PendingQos2) {
        self.pending_qos2_out.insert(packet_id, pending);
    }

    pub fn register_suback(&mut self, packet_id: u16, pending: PendingSubscribe) {
        self.pending_suback.insert(packet_id, pending);
    }

    pub fn register_unsuback(&mut self, packet_id: u16, pending: PendingUnsubscribe) {
        self.pending_unsuback.insert(packet_id, pending);
    }

    pub fn remove_puback(&mut self, packet_id: u16) -> Option<PendingPublish> {
        self.pending_puback.remove(&packet_id)
    }

    pub fn remove_qos2(&mut self, packet_id: u16) -> Option<PendingQos2> {
        self.pending_qos2_out.remove(&packet_id)
    }

    pub fn remove_suback(&mut self, packet_id: u16) -> Option<PendingSubscribe> {
        self.pending_suback.remove(&packet_id)
    }

    pub fn remove_unsuback(&mut self, packet_id: u16) -> Option<PendingUnsubscribe> {
        self.pending_unsuback.remove(&packet_id)
    }

    // Token-matched removal, used by cancellation guards: the entry is
    // taken only while it still belongs to the registration that owns
    // the token. An id that was acked and reused stays untouched.

    pub fn remove_puback_matching(&mut self, packet_id: u16, token: u64) -> Option<PendingPublish> {
        if self
            .pending_puback
            .get(&packet_id)
            .is_some_and(|p| p.token == token)
        {
            self.pending_puback.remove(&packet_id)
        } else {
            None
        }
    }

    pub fn remove_qos2_matching(&mut self, packet_id: u16, token: u64) -> Option<PendingQos2> {
        if self
            .pending_qos2_out
            .get(&packet_id)
            .is_some_and(|p| p.token == token)
        {
            self.pending_qos2_out.remove(&packet_id)
        } else {
            None
        }
    }

    pub fn remove_suback_matching(
        &mut self,
        packet_id: u16,
        token: u64,
    ) -> Option<PendingSubscribe> {
        if self
            .pending_suback
            .get(&packet_id)
            .is_some_and(|p| p.token == token)
        {
            self.pending_suback.remove(&packet_id)
        } else {
            None
        }
    }

    pub fn remove_unsuback_matching(
        &mut self,
        packet_id: u16,
        token: u64,
    ) -> Option<PendingUnsubscribe> {
        if self
            .pending_unsuback
            .get(&packet_id)
            .is_some_and(|p| p.token == token)
        {
            self.pending_unsuback.remove(&packet_id)
        } else {
            None
        }
    }

    /// Record a PUBREC for an outbound QoS 2 flow; false when the id is
    /// unknown.
    pub fn mark_pubrec(&mut self, packet_id: u16) -> bool {
        match self.pending_qos2_out.get_mut(&packet_id) {
            Some(pending) => {
                pending.pubrec_received = true;
                true
            }
            None => false,
        }
    }

    pub fn pending_qos1_count(&self) -> usize {
        self.pending_puback.len()
    }

    pub fn pending_qos2_count(&self) -> usize {
        self.pending_qos2_out.len()
    }

    // -----------------------------------------------------------------
    // Inbound QoS 2 duplicate suppression
    // -----------------------------------------------------------------

    /// Track an inbound QoS 2 publish; false when the id is already
    /// pending, i.e. the publish is a duplicate.
    pub fn begin_qos2_in(&mut self, packet_id: u16) -> bool {
        self.pending_qos2_in.insert(packet_id)
    }

    /// Release an inbound QoS 2 id on PUBREL.
    pub fn finish_qos2_in(&mut self, packet_id: u16) -> bool {
        self.pending_qos2_in.remove(&packet_id)
    }

    // -----------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------

    pub fn subscriptions(&self) -> &HashMap<String, Qos> {
        &self.subscriptions
    }

    /// Mirror granted filters of a SUBACK into the local subscription
    /// map; error codes leave the map untouched.
    pub fn mirror_suback(&mut self, subscriptions: &[Subscription], reason_codes: &[u8]) {
        for (sub, &code) in subscriptions.iter().zip(reason_codes) {
            if let Ok(granted) = Qos::from_u8(code) {
                self.subscriptions
                    .insert(sub.topic_filter.clone(), granted);
            }
        }
    }

    /// Mirror successfully removed filters of an UNSUBACK.
    pub fn mirror_unsuback(&mut self, topic_filters: &[String], reason_codes: &[u8]) {
        for (filter, &code) in topic_filters.iter().zip(reason_codes) {
            if !reason::is_error(code) {
                self.subscriptions.remove(filter);
            }
        }
    }

    // -----------------------------------------------------------------
    // Connection loss and resumption
    // -----------------------------------------------------------------

    /// Move every unacknowledged QoS 1/2 flow into the retry snapshot.
    ///
    /// Returns the packet ids that were snapshotted; the engine releases
    /// them so the resumption pass can re-claim them with `reserve`.
    pub fn save_inflight_for_retry(&mut self) -> Vec<u16> {
        let mut ids = Vec::with_capacity(self.pending_puback.len() + self.pending_qos2_out.len());
        for (id, pending) in self.pending_puback.drain() {
            ids.push(id);
            self.inflight_for_retry.push(InflightPublish {
                packet_id: id,
                publish: pending.publish,
                pubrec_received: false,
                done: pending.done,
            });
        }
        for (id, pending) in self.pending_qos2_out.drain() {
            ids.push(id);
            self.inflight_for_retry.push(InflightPublish {
                packet_id: id,
                publish: pending.publish,
                pubrec_received: pending.pubrec_received,
                done: pending.done,
            });
        }
        ids
    }

    pub fn inflight_for_retry_len(&self) -> usize {
        self.inflight_for_retry.len()
    }

    /// Drain the retry snapshot for retransmission (or to drop it when
    /// the server reports no session).
    pub fn take_inflight_for_retry(&mut self) -> Vec<InflightPublish> {
        std::mem::take(&mut self.inflight_for_retry)
    }

    /// Return an undelivered entry to the snapshot after an interrupted
    /// retransmission pass.
    pub fn push_inflight_for_retry(&mut self, entry: InflightPublish) {
        self.inflight_for_retry.push(entry);
    }

    /// Fail every remaining pending completion with `error` and empty
    /// the tables. The retry snapshot is left untouched.
    ///
    /// Returns the packet ids that were still held by pending entries so
    /// the engine can release them.
    pub fn fail_and_clear_pending(&mut self, error: &MqttError) -> Vec<u16> {
        let mut ids = Vec::new();
        for (id, pending) in self.pending_puback.drain() {
            ids.push(id);
            let _ = pending.done.send(Err(error.clone()));
        }
        for (id, pending) in self.pending_qos2_out.drain() {
            ids.push(id);
            let _ = pending.done.send(Err(error.clone()));
        }
        for (id, pending) in self.pending_suback.drain() {
            ids.push(id);
            let _ = pending.done.send(Err(error.clone()));
        }
        for (id, pending) in self.pending_unsuback.drain() {
            ids.push(id);
            let _ = pending.done.send(Err(error.clone()));
        }
        self.pending_qos2_in.clear();
        ids
    }

    /// Reset per-connection state ahead of a new CONNECT. Clears the
    /// subscription map only for a clean start; the retry snapshot is
    /// preserved either way.
    pub fn clear_for_reconnect(&mut self, clean_start: bool) {
        self.pending_puback.clear();
        self.pending_qos2_out.clear();
        self.pending_qos2_in.clear();
        self.pending_suback.clear();
        self.pending_unsuback.clear();
        self.send_quota = DEFAULT_RECEIVE_MAXIMUM;
        if clean_start {
            self.subscriptions.clear();
        }
    }

    /// Fail and drop the retry snapshot, e.g. when reconnecting gave up.
    pub fn fail_inflight_for_retry(&mut self, error: &MqttError) -> Vec<u16> {
        let mut ids = Vec::new();
        for entry in self.inflight_for_retry.drain(..) {
            ids.push(entry.packet_id);
            let _ = entry.done.send(Err(error.clone()));
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::properties::Properties;
    use bytes::Bytes;

    fn publish(id: u16, qos: Qos) -> Publish {
        Publish {
            qos,
            topic: "t".into(),
            packet_id: Some(id),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        }
    }

    fn pending_qos1(id: u16) -> (PendingPublish, oneshot::Receiver<Result<(), MqttError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingPublish {
                publish: publish(id, Qos::AtLeastOnce),
                done: tx,
                token: u64::from(id),
            },
            rx,
        )
    }

    #[test]
    fn test_apply_connack_updates_capabilities_and_quota() {
        let mut state = SessionState::new();
        let connack = ConnAck {
            session_present: true,
            reason_code: reason::SUCCESS,
            properties: Properties {
                receive_maximum: Some(5),
                maximum_qos: Some(1),
                retain_available: Some(0),
                topic_alias_maximum: Some(7),
                assigned_client_identifier: Some("srv-1".into()),
                server_keep_alive: Some(15),
                ..Default::default()
            },
        };
        state.apply_connack(&connack);
        assert_eq!(state.send_quota(), 5);
        let server = state.server();
        assert!(server.session_present);
        assert_eq!(server.maximum_qos, Qos::AtLeastOnce);
        assert!(!server.retain_available);
        assert_eq!(server.topic_alias_maximum, 7);
        assert_eq!(server.server_keep_alive, Some(15));
        assert_eq!(server.assigned_client_identifier.as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_send_quota_bounds() {
        let mut state = SessionState::new();
        state.apply_connack(&ConnAck {
            session_present: false,
            reason_code: reason::SUCCESS,
            properties: Properties {
                receive_maximum: Some(2),
                ..Default::default()
            },
        });
        state.decrement_send_quota();
        state.decrement_send_quota();
        assert_eq!(state.send_quota(), 0);
        // never goes negative
        state.decrement_send_quota();
        assert_eq!(state.send_quota(), 0);
        state.increment_send_quota();
        state.increment_send_quota();
        state.increment_send_quota();
        // capped at the server receive maximum
        assert_eq!(state.send_quota(), 2);
    }

    #[test]
    fn test_save_then_fail_keeps_snapshot() {
        let mut state = SessionState::new();
        let (p1, mut rx1) = pending_qos1(1);
        state.register_puback(1, p1);
        let (tx, mut rx2) = oneshot::channel();
        state.register_qos2(
            2,
            PendingQos2 {
                publish: publish(2, Qos::ExactlyOnce),
                pubrec_received: true,
                done: tx,
                token: 2,
            },
        );

        let snapshot_count = state.pending_qos1_count() + state.pending_qos2_count();
        let ids = state.save_inflight_for_retry();
        let error = MqttError::Connection("Connection lost".into());
        state.fail_and_clear_pending(&error);

        assert_eq!(state.inflight_for_retry_len(), snapshot_count);
        assert_eq!(ids.len(), 2);
        // snapshotted completions were not failed
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_fail_and_clear_without_snapshot_fails_callers() {
        let mut state = SessionState::new();
        let (p1, mut rx1) = pending_qos1(1);
        state.register_puback(1, p1);

        let error = MqttError::Connection("Connection lost".into());
        let ids = state.fail_and_clear_pending(&error);
        assert_eq!(ids, vec![1]);
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(MqttError::Connection(_))
        ));
        assert_eq!(state.inflight_for_retry_len(), 0);
    }

    #[test]
    fn test_clear_for_reconnect_subscription_handling() {
        let mut state = SessionState::new();
        state.mirror_suback(
            &[Subscription::new("a/b", Qos::AtLeastOnce)],
            &[reason::GRANTED_QOS_1],
        );
        state.clear_for_reconnect(false);
        assert_eq!(state.subscriptions().len(), 1);
        state.clear_for_reconnect(true);
        assert!(state.subscriptions().is_empty());
    }

    #[test]
    fn test_mirror_suback_skips_errors() {
        let mut state = SessionState::new();
        state.mirror_suback(
            &[
                Subscription::new("ok", Qos::AtLeastOnce),
                Subscription::new("denied", Qos::AtLeastOnce),
            ],
            &[reason::GRANTED_QOS_1, reason::NOT_AUTHORIZED],
        );
        assert_eq!(state.subscriptions().len(), 1);
        assert_eq!(state.subscriptions().get("ok"), Some(&Qos::AtLeastOnce));
    }

    #[test]
    fn test_mirror_unsuback() {
        let mut state = SessionState::new();
        state.mirror_suback(
            &[
                Subscription::new("a", Qos::AtMostOnce),
                Subscription::new("b", Qos::AtMostOnce),
            ],
            &[reason::GRANTED_QOS_0, reason::GRANTED_QOS_0],
        );
        state.mirror_unsuback(
            &["a".to_string(), "b".to_string()],
            &[reason::SUCCESS, reason::UNSPECIFIED_ERROR],
        );
        assert!(!state.subscriptions().contains_key("a"));
        assert!(state.subscriptions().contains_key("b"));
    }

    #[test]
    fn test_token_matched_removal() {
        let mut state = SessionState::new();
        let (p1, _rx1) = pending_qos1(1);
        state.register_puback(1, p1);

        // wrong token leaves the entry alone
        assert!(state.remove_puback_matching(1, 99).is_none());
        assert_eq!(state.pending_qos1_count(), 1);

        // matching token takes it
        assert!(state.remove_puback_matching(1, 1).is_some());
        assert_eq!(state.pending_qos1_count(), 0);

        // an id reused by a later registration is invisible to the
        // earlier token
        let (p2, _rx2) = pending_qos1(1);
        let replacement = PendingPublish { token: 7, ..p2 };
        state.register_puback(1, replacement);
        assert!(state.remove_puback_matching(1, 1).is_none());
        assert!(state.remove_puback_matching(1, 7).is_some());
    }

    #[test]
    fn test_qos2_inbound_duplicate_suppression() {
        let mut state = SessionState::new();
        assert!(state.begin_qos2_in(7));
        assert!(!state.begin_qos2_in(7));
        assert!(state.finish_qos2_in(7));
        assert!(!state.finish_qos2_in(7));
        assert!(state.begin_qos2_in(7));
    }
}
