use std::cmp;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::subscription::Subscription;
use crate::{
    metrics, proto, ClientEvent, ClientId, ClientInfo, ConnectionHandle, Error, Message,
    Publication, Publish,
};

const QOS1_LABEL: &str = "1";

#[derive(Debug)]
pub enum Session {
    Connected(ConnectedSession),
    Disconnecting(DisconnectingSession),
}

impl Session {
    pub fn new_connected(
        state: SessionState,
        will: Option<Publication>,
        handle: ConnectionHandle,
    ) -> Self {
        Self::Connected(ConnectedSession::new(state, will, handle))
    }

    pub fn new_disconnecting(
        client_info: ClientInfo,
        will: Option<Publication>,
        handle: ConnectionHandle,
    ) -> Self {
        Self::Disconnecting(DisconnectingSession {
            client_info,
            will,
            handle,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        match self {
            Self::Connected(connected) => connected.state.client_info().client_id(),
            Self::Disconnecting(disconnecting) => disconnecting.client_info.client_id(),
        }
    }

    pub fn into_will(self) -> Option<Publication> {
        match self {
            Self::Connected(connected) => connected.will,
            Self::Disconnecting(disconnecting) => disconnecting.will,
        }
    }

    pub fn subscribe_to(
        &mut self,
        request: proto::SubscribeRequest,
        granted_cap: proto::QoS,
    ) -> Result<(proto::SubscribeReturnCode, Option<Subscription>), Error> {
        match self {
            Self::Connected(connected) => connected.state.subscribe_to(request, granted_cap),
            Self::Disconnecting(_) => Err(Error::SessionClosed),
        }
    }

    pub fn unsubscribe(&mut self, unsubscribe: &proto::Unsubscribe) -> Result<(), Error> {
        match self {
            Self::Connected(connected) => {
                connected.state.unsubscribe(unsubscribe);
                Ok(())
            }
            Self::Disconnecting(_) => Err(Error::SessionClosed),
        }
    }

    pub fn publish_to(&mut self, publication: &Publication) -> Result<Option<ClientEvent>, Error> {
        match self {
            Self::Connected(connected) => connected.state.publish_to(publication),
            Self::Disconnecting(_) => Err(Error::SessionClosed),
        }
    }

    pub fn handle_puback(&mut self, packet_id: proto::PacketId) -> Result<bool, Error> {
        match self {
            Self::Connected(connected) => Ok(connected.state.handle_puback(packet_id)),
            Self::Disconnecting(_) => Err(Error::SessionClosed),
        }
    }

    pub fn retry_pending(
        &mut self,
        interval: Duration,
        max_retries: u32,
    ) -> (Vec<Publish>, Vec<proto::PacketId>) {
        match self {
            Self::Connected(connected) => connected.state.retry_pending(interval, max_retries),
            Self::Disconnecting(_) => (Vec::new(), Vec::new()),
        }
    }

    pub fn send(&self, event: ClientEvent) -> Result<(), Error> {
        let (client_id, handle) = match self {
            Self::Connected(connected) => (
                connected.state.client_info().client_id().clone(),
                &connected.handle,
            ),
            Self::Disconnecting(disconnecting) => (
                disconnecting.client_info.client_id().clone(),
                &disconnecting.handle,
            ),
        };

        let message = Message::Client(client_id, event);
        handle.send(message)
    }
}

#[derive(Debug)]
pub struct ConnectedSession {
    state: SessionState,
    will: Option<Publication>,
    handle: ConnectionHandle,
}

impl ConnectedSession {
    fn new(state: SessionState, will: Option<Publication>, handle: ConnectionHandle) -> Self {
        Self {
            state,
            will,
            handle,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn into_parts(self) -> (SessionState, Option<Publication>, ConnectionHandle) {
        (self.state, self.will, self.handle)
    }
}

#[derive(Debug)]
pub struct DisconnectingSession {
    client_info: ClientInfo,
    will: Option<Publication>,
    handle: ConnectionHandle,
}

/// An unacknowledged QoS 1 delivery.
#[derive(Debug)]
struct InflightPublish {
    publish: proto::Publish,
    sent: Instant,
    retries: u32,
}

/// Per-session broker state: granted subscriptions, the packet identifier
/// counter and the QoS 1 inflight window.
#[derive(Debug)]
pub struct SessionState {
    client_info: ClientInfo,
    clean_session: bool,
    subscriptions: HashMap<String, Subscription>,
    last_packet_id: u16,
    inflight: HashMap<proto::PacketId, InflightPublish>,
    max_inflight: Option<NonZeroUsize>,
}

impl SessionState {
    pub fn new(
        client_info: ClientInfo,
        clean_session: bool,
        max_inflight: Option<NonZeroUsize>,
    ) -> Self {
        Self {
            client_info,
            clean_session,
            subscriptions: HashMap::new(),
            last_packet_id: 0,
            inflight: HashMap::new(),
            max_inflight,
        }
    }

    pub fn client_info(&self) -> &ClientInfo {
        &self.client_info
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn subscriptions(&self) -> &HashMap<String, Subscription> {
        &self.subscriptions
    }

    pub fn subscribe_to(
        &mut self,
        request: proto::SubscribeRequest,
        granted_cap: proto::QoS,
    ) -> Result<(proto::SubscribeReturnCode, Option<Subscription>), Error> {
        match request.filter.parse() {
            Ok(filter) => {
                let granted = cmp::min(request.qos, granted_cap);
                let subscription = Subscription::new(filter, granted);
                let previous = self
                    .subscriptions
                    .insert(request.filter, subscription.clone());
                if previous.is_none() {
                    metrics::SUBSCRIPTIONS_ACTIVE.inc();
                }

                Ok((proto::SubscribeReturnCode::Success(granted), Some(subscription)))
            }
            Err(e) => {
                debug!("invalid topic filter {}: {}", request.filter, e);
                Ok((proto::SubscribeReturnCode::Failure, None))
            }
        }
    }

    pub fn unsubscribe(&mut self, unsubscribe: &proto::Unsubscribe) {
        for filter in &unsubscribe.filters {
            if self.subscriptions.remove(filter).is_some() {
                metrics::SUBSCRIPTIONS_ACTIVE.dec();
            }
        }
    }

    /// Prepares a publication for this subscriber, or `None` when no
    /// subscription matches or the delivery had to be dropped.
    ///
    /// Delivery QoS is min(publication QoS, granted QoS), taking the maximum
    /// granted QoS over all matching filters so overlapping subscriptions
    /// produce a single delivery.
    pub fn publish_to(&mut self, publication: &Publication) -> Result<Option<ClientEvent>, Error> {
        let qos = match self.matched_qos(publication) {
            Some(qos) => qos,
            None => return Ok(None),
        };

        let publish = match qos {
            proto::QoS::AtMostOnce => Publish::QoS0(proto::Publish {
                dup: false,
                qos: proto::QoS::AtMostOnce,
                retain: publication.retain,
                topic: publication.topic.clone(),
                packet_id: None,
                payload: publication.payload.clone(),
            }),
            _ => {
                if !self.allowed_to_send() {
                    warn!(
                        client_id = %self.client_info.client_id(),
                        topic = %publication.topic,
                        "inflight window full, dropping delivery"
                    );
                    metrics::MESSAGES_DROPPED.inc();
                    return Ok(None);
                }

                let packet_id = match self.next_packet_id() {
                    Some(packet_id) => packet_id,
                    None => {
                        warn!(
                            client_id = %self.client_info.client_id(),
                            topic = %publication.topic,
                            "no free packet identifiers, dropping delivery"
                        );
                        metrics::MESSAGES_DROPPED.inc();
                        return Ok(None);
                    }
                };

                let packet = proto::Publish {
                    dup: false,
                    qos: proto::QoS::AtLeastOnce,
                    retain: publication.retain,
                    topic: publication.topic.clone(),
                    packet_id: Some(packet_id),
                    payload: publication.payload.clone(),
                };

                self.inflight.insert(
                    packet_id,
                    InflightPublish {
                        publish: packet.clone(),
                        sent: Instant::now(),
                        retries: 0,
                    },
                );
                metrics::QOS_MESSAGES_INFLIGHT
                    .with_label_values(&[QOS1_LABEL])
                    .inc();

                Publish::QoS1(packet_id, packet)
            }
        };

        Ok(Some(ClientEvent::PublishTo(publish)))
    }

    /// Settles the inflight entry for an acknowledged delivery. Returns
    /// `false` for an unknown packet identifier.
    pub fn handle_puback(&mut self, packet_id: proto::PacketId) -> bool {
        match self.inflight.remove(&packet_id) {
            Some(_) => {
                debug!("settled packet identifier {}", packet_id);
                metrics::QOS_MESSAGES_INFLIGHT
                    .with_label_values(&[QOS1_LABEL])
                    .dec();
                true
            }
            None => false,
        }
    }

    /// Scans the inflight window. Entries older than `interval` are re-staged
    /// with the dup flag; entries that already used up `max_retries` attempts
    /// are dropped and their identifiers returned.
    pub fn retry_pending(
        &mut self,
        interval: Duration,
        max_retries: u32,
    ) -> (Vec<Publish>, Vec<proto::PacketId>) {
        let now = Instant::now();
        let mut resend = Vec::new();
        let mut expired = Vec::new();

        for (packet_id, entry) in &mut self.inflight {
            if now.duration_since(entry.sent) < interval {
                continue;
            }

            if entry.retries >= max_retries {
                expired.push(*packet_id);
                continue;
            }

            entry.retries += 1;
            entry.sent = now;
            entry.publish.dup = true;
            resend.push(Publish::QoS1(*packet_id, entry.publish.clone()));
        }

        for packet_id in &expired {
            self.inflight.remove(packet_id);
            metrics::QOS_MESSAGES_INFLIGHT
                .with_label_values(&[QOS1_LABEL])
                .dec();
            metrics::MESSAGES_DROPPED.inc();
        }

        (resend, expired)
    }

    /// Number of unacknowledged QoS 1 deliveries.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// A per-session counter over the u16 space. Zero is never issued and
    /// identifiers still awaiting an acknowledgement are skipped; the
    /// counter wraps at 65535 and gives up only once the whole space is in
    /// flight.
    fn next_packet_id(&mut self) -> Option<proto::PacketId> {
        for _ in 0..=u16::max_value() {
            self.last_packet_id = self.last_packet_id.wrapping_add(1);
            let packet_id = match proto::PacketId::new(self.last_packet_id) {
                Some(packet_id) => packet_id,
                None => continue,
            };
            if !self.inflight.contains_key(&packet_id) {
                return Some(packet_id);
            }
        }
        None
    }

    fn allowed_to_send(&self) -> bool {
        match self.max_inflight {
            Some(limit) => self.inflight.len() < limit.get(),
            None => true,
        }
    }

    fn matched_qos(&self, publication: &Publication) -> Option<proto::QoS> {
        self.subscriptions
            .values()
            .filter(|sub| sub.filter().matches(&publication.topic))
            .fold(None, |acc, sub| {
                acc.map(|qos| cmp::max(qos, cmp::min(*sub.max_qos(), publication.qos)))
                    .or_else(|| Some(cmp::min(*sub.max_qos(), publication.qos)))
            })
    }
}
