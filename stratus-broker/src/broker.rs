use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, span, warn, Level};

use crate::auth::{Authentication, AuthenticationContext, Authenticator, DefaultAuthenticator};
use crate::session::{Session, SessionState};
use crate::settings::BrokerConfig;
use crate::store::{MemoryStore, MessageRecord, SessionRecord, Store, SubscriptionRecord};
use crate::subscription::Subscription;
use crate::{
    metrics, proto, AuthId, ClientEvent, ClientId, ClientInfo, ConnReq, Error, Message,
    Publication, Publish, SystemEvent,
};

macro_rules! try_send {
    ($session:expr, $msg:expr) => {{
        if let Err(e) = $session.send($msg) {
            warn!(message = "error processing message", error = %e);
        }
    }};
}

pub struct Broker<N> {
    sender: UnboundedSender<Message>,
    messages: UnboundedReceiver<Message>,
    sessions: HashMap<ClientId, Session>,
    retained: HashMap<String, Publication>,
    authenticator: N,
    store: Arc<dyn Store>,
    config: BrokerConfig,
}

impl<N> Broker<N>
where
    N: Authenticator + Send + 'static,
{
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle(self.sender.clone())
    }

    /// Runs the broker message loop until a `Shutdown` event arrives.
    ///
    /// All session, subscription and retained state is owned by this loop;
    /// connections and the retry timer communicate with it exclusively
    /// through [`BrokerHandle`] messages, which also serializes fan-out.
    pub async fn run(mut self) -> Result<(), Error> {
        let sweep = tokio::spawn(retry_sweep(self.handle(), self.config.retry_interval()));

        while let Some(message) = self.messages.recv().await {
            match message {
                Message::Client(client_id, event) => {
                    let span = span!(Level::INFO, "broker", client_id = %client_id, event = "client");
                    let _enter = span.enter();
                    if let Err(e) = self.process_message(client_id, event) {
                        warn!(message = "an error occurred processing a message", error = %e);
                    }
                }
                Message::System(event) => {
                    let span = span!(Level::INFO, "broker", event = "system");
                    let _enter = span.enter();
                    match event {
                        SystemEvent::Shutdown => {
                            info!("broker shutting down, closing sessions...");
                            if let Err(e) = self.process_shutdown() {
                                warn!(message = "an error occurred shutting down the broker", error = %e);
                            }
                            break;
                        }
                        SystemEvent::RetrySweep => {
                            self.process_retry_sweep();
                        }
                    }
                }
            }
        }

        sweep.abort();

        if let Err(e) = self.store.close() {
            warn!(message = "an error occurred closing the store", error = %e);
        }

        info!("broker is shutdown.");
        Ok(())
    }

    fn process_message(&mut self, client_id: ClientId, event: ClientEvent) -> Result<(), Error> {
        debug!("incoming: {:?}", event);
        let result = match event {
            ClientEvent::ConnReq(connreq) => self.process_connect(client_id, connreq),
            ClientEvent::Disconnect => self.process_disconnect(&client_id),
            ClientEvent::DropConnection => self.process_drop_connection(&client_id),
            ClientEvent::CloseSession => self.process_close_session(&client_id),
            ClientEvent::PingReq => self.process_ping_req(&client_id),
            ClientEvent::Subscribe(subscribe) => self.process_subscribe(&client_id, subscribe),
            ClientEvent::Unsubscribe(unsubscribe) => {
                self.process_unsubscribe(&client_id, &unsubscribe)
            }
            ClientEvent::PublishFrom(publish) => self.process_publish(&client_id, publish),
            ClientEvent::PubAck(packet_id) => self.process_puback(&client_id, packet_id),
            ClientEvent::PubRec(_) | ClientEvent::PubRel(_) | ClientEvent::PubComp(_) => {
                info!("broker received a QoS 2 acknowledgement, ignoring");
                Ok(())
            }
            event @ ClientEvent::ConnAck(_)
            | event @ ClientEvent::SubAck(_)
            | event @ ClientEvent::UnsubAck(_)
            | event @ ClientEvent::PingResp
            | event @ ClientEvent::PublishTo(_) => {
                info!("broker received an outbound-only event {:?}, ignoring", event);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(message = "error processing message", %e);
        }

        Ok(())
    }

    fn process_shutdown(&mut self) -> Result<(), Error> {
        let mut sessions = vec![];
        let client_ids = self.sessions.keys().cloned().collect::<Vec<ClientId>>();

        for client_id in client_ids {
            if let Some(session) = self.close_session(&client_id) {
                sessions.push(session)
            }
        }

        for session in sessions {
            if let Err(e) = session.send(ClientEvent::DropConnection) {
                warn!(error = %e, message = "an error occurred closing the session", client_id = %session.client_id());
            }
        }
        Ok(())
    }

    fn process_connect(&mut self, client_id: ClientId, mut connreq: ConnReq) -> Result<(), Error> {
        debug!("handling connect...");

        macro_rules! refuse_connection {
            ($reason:expr) => {
                let ack = proto::ConnAck {
                    session_present: false,
                    return_code: $reason,
                };

                debug!("sending connack with: {:?}", ack.return_code);
                let event = ClientEvent::ConnAck(ack);
                let message = Message::Client(client_id.clone(), event);
                try_send!(connreq.handle_mut(), message);

                debug!("dropping connection");
                let message = Message::Client(client_id, ClientEvent::DropConnection);
                try_send!(connreq.handle_mut(), message);
            };
        }

        // [MQTT-3.1.2-2] - The Server MUST respond to the CONNECT Packet
        // with a CONNACK return code 0x01 (unacceptable protocol level)
        // and then disconnect the Client if the Protocol Level is not
        // supported by the Server.
        if connreq.connect().protocol_name != proto::PROTOCOL_NAME
            || connreq.connect().protocol_level != proto::PROTOCOL_LEVEL
        {
            warn!(
                "unsupported protocol {} level {} received from client",
                connreq.connect().protocol_name,
                connreq.connect().protocol_level,
            );
            refuse_connection!(proto::ConnectReturnCode::UnacceptableProtocolVersion);
            return Ok(());
        }

        // Admission control. A reconnect with an id already in the sessions
        // map replaces that session, so it never pushes the count over the
        // limit.
        if self.config.max_clients() > 0
            && self.sessions.len() >= self.config.max_clients()
            && !self.sessions.contains_key(&client_id)
        {
            warn!(
                "refusing client {}: maximum number of clients ({}) reached",
                client_id,
                self.config.max_clients(),
            );
            refuse_connection!(proto::ConnectReturnCode::ServerUnavailable);
            return Ok(());
        }

        // [MQTT-3.1.4-3] - The Server MAY check that the contents of the
        // CONNECT Packet meet any further restrictions and MAY perform
        // authentication and authorization checks. If any of these checks
        // fail, it SHOULD send an appropriate CONNACK response with a
        // non-zero return code as described in section 3.2 and it MUST close
        // the Network Connection.
        let mut context = AuthenticationContext::new(client_id.clone(), connreq.peer_addr());
        if let Some(username) = &connreq.connect().username {
            context = context.with_username(username.clone());
        }
        if let Some(password) = &connreq.connect().password {
            context = context.with_password(password.clone());
        }
        if let Some(certificate) = connreq.certificate() {
            context = context.with_certificate(certificate.clone());
        }

        let auth_id = match self.authenticator.authenticate(context) {
            Ok(Authentication::Accepted(auth_id)) => {
                debug!("client {} successfully authenticated: {}", client_id, auth_id);
                auth_id
            }
            Ok(Authentication::BadCredentials) => {
                warn!("unable to authenticate client: {}", client_id);
                refuse_connection!(proto::ConnectReturnCode::BadCredentials);
                return Ok(());
            }
            Ok(Authentication::NotAuthorized) => {
                warn!("client {} not allowed to connect", client_id);
                refuse_connection!(proto::ConnectReturnCode::NotAuthorized);
                return Ok(());
            }
            Err(e) => {
                warn!(message = "error authenticating client", error = %e);
                refuse_connection!(proto::ConnectReturnCode::ServerUnavailable);
                return Ok(());
            }
        };

        match self.open_session(auth_id, connreq) {
            Ok(ack) => {
                let session = self
                    .get_session_mut(&client_id)
                    .expect("session must exist");
                session.send(ClientEvent::ConnAck(ack))?;
                self.persist_session(&client_id);
            }
            Err(SessionError::DuplicateSession(old_session, ack)) => {
                // Drop the old connection, then acknowledge the new one
                old_session.send(ClientEvent::DropConnection)?;

                let session = self
                    .get_session_mut(&client_id)
                    .expect("session must exist");
                session.send(ClientEvent::ConnAck(ack))?;
                self.persist_session(&client_id);
            }
        }

        debug!("connect handled.");
        Ok(())
    }

    fn process_disconnect(&mut self, client_id: &ClientId) -> Result<(), Error> {
        debug!("handling disconnect...");
        if let Some(session) = self.close_session(client_id) {
            // [MQTT-3.14.4-3] - a graceful disconnect discards the will
            session.send(ClientEvent::Disconnect)?;
        } else {
            debug!("no session for {}", client_id);
        }
        debug!("disconnect handled.");
        Ok(())
    }

    fn process_drop_connection(&mut self, client_id: &ClientId) -> Result<(), Error> {
        self.drop_connection(client_id)
    }

    fn drop_connection(&mut self, client_id: &ClientId) -> Result<(), Error> {
        debug!("handling drop connection...");
        if let Some(session) = self.close_session(client_id) {
            session.send(ClientEvent::DropConnection)?;

            // Ungraceful disconnect - send the will
            if let Some(will) = session.into_will() {
                self.publish_all(will)?;
            }
        } else {
            debug!("no session for {}", client_id);
        }
        debug!("drop connection handled.");
        Ok(())
    }

    fn process_close_session(&mut self, client_id: &ClientId) -> Result<(), Error> {
        debug!("handling close session...");
        if let Some(session) = self.close_session(client_id) {
            debug!("session removed");

            // Ungraceful disconnect - send the will
            if let Some(will) = session.into_will() {
                self.publish_all(will)?;
            }
        } else {
            debug!("no session for {}", client_id);
        }
        debug!("close session handled.");
        Ok(())
    }

    fn process_ping_req(&mut self, client_id: &ClientId) -> Result<(), Error> {
        debug!("handling ping request...");
        match self.get_session_mut(client_id) {
            Some(session) => session.send(ClientEvent::PingResp),
            None => {
                debug!("no session for {}", client_id);
                Ok(())
            }
        }
    }

    fn process_subscribe(
        &mut self,
        client_id: &ClientId,
        sub: proto::Subscribe,
    ) -> Result<(), Error> {
        let subscriptions = if let Some(session) = self.sessions.get_mut(client_id) {
            let (suback, subscriptions) = subscribe(session, sub, self.config.granted_qos_cap())?;
            session.send(ClientEvent::SubAck(suback))?;
            subscriptions
        } else {
            debug!("no session for {}", client_id);
            return Ok(());
        };

        self.persist_session(client_id);

        // Handle retained messages. The SUBACK is already queued for the
        // session, so retained deliveries follow it on the wire.
        let publications = self
            .retained
            .values()
            .filter(|p| {
                subscriptions
                    .iter()
                    .any(|sub| sub.filter().matches(&p.topic))
            })
            .cloned()
            .collect::<Vec<Publication>>();

        if let Some(session) = self.sessions.get_mut(client_id) {
            for mut publication in publications {
                publication.retain = true;
                if let Err(e) = publish_to(self.store.as_ref(), session, &publication) {
                    warn!(message = "error delivering retained message", error = %e);
                }
            }
        } else {
            debug!("no session for {}", client_id);
        }

        Ok(())
    }

    fn process_unsubscribe(
        &mut self,
        client_id: &ClientId,
        unsubscribe: &proto::Unsubscribe,
    ) -> Result<(), Error> {
        match self.get_session_mut(client_id) {
            Some(session) => {
                session.unsubscribe(unsubscribe)?;
                session.send(ClientEvent::UnsubAck(unsubscribe.packet_id))?;
                self.persist_session(client_id);
                Ok(())
            }
            None => {
                debug!("no session for {}", client_id);
                Ok(())
            }
        }
    }

    fn process_publish(
        &mut self,
        client_id: &ClientId,
        publish: proto::Publish,
    ) -> Result<(), Error> {
        // [MQTT-3.3.2-2] - The Topic Name in the PUBLISH Packet MUST NOT
        // contain wildcard characters.
        if publish.topic.is_empty()
            || publish.topic.contains('+')
            || publish.topic.contains('#')
        {
            warn!(
                "client {} published to an invalid topic \"{}\", dropping connection",
                client_id, publish.topic
            );
            return self.drop_connection(client_id);
        }

        match publish.qos {
            proto::QoS::AtMostOnce => {
                self.publish_all(Publication {
                    topic: publish.topic,
                    qos: proto::QoS::AtMostOnce,
                    retain: publish.retain,
                    payload: publish.payload,
                })?;
            }
            proto::QoS::AtLeastOnce => {
                // The publisher is acknowledged as soon as the packet is
                // accepted; at-least-once delivery to subscribers is tracked
                // independently of the publisher ack.
                if let (Some(session), Some(packet_id)) =
                    (self.get_session_mut(client_id), publish.packet_id)
                {
                    session.send(ClientEvent::PubAck(packet_id))?;
                }

                self.publish_all(Publication {
                    topic: publish.topic,
                    qos: proto::QoS::AtLeastOnce,
                    retain: publish.retain,
                    payload: publish.payload,
                })?;
            }
            proto::QoS::ExactlyOnce => {
                warn!(
                    "client {} published with QoS 2, which is not supported; dropping connection",
                    client_id
                );
                return self.drop_connection(client_id);
            }
        }

        Ok(())
    }

    fn process_puback(
        &mut self,
        client_id: &ClientId,
        packet_id: proto::PacketId,
    ) -> Result<(), Error> {
        match self.get_session_mut(client_id) {
            Some(session) => {
                if session.handle_puback(packet_id)? {
                    if let Err(e) = self
                        .store
                        .clear_inflight(client_id.as_str(), packet_id.get())
                    {
                        warn!(message = "error clearing persisted inflight entry", error = %e);
                    }
                } else {
                    debug!("PUBACK for unknown packet identifier {}, ignoring", packet_id);
                }
                Ok(())
            }
            None => {
                debug!("no session for {}", client_id);
                Ok(())
            }
        }
    }

    fn process_retry_sweep(&mut self) {
        let interval = self.config.retry_interval();
        let max_retries = self.config.max_retries();

        for (client_id, session) in &mut self.sessions {
            let (resend, expired) = session.retry_pending(interval, max_retries);

            for publish in resend {
                debug!("re-sending unacknowledged delivery to {}", client_id);
                try_send!(session, ClientEvent::PublishTo(publish));
            }

            for packet_id in expired {
                warn!(
                    "dropping delivery to {} after too many retries (packet identifier {})",
                    client_id, packet_id
                );
                if let Err(e) = self.store.clear_inflight(client_id.as_str(), packet_id.get()) {
                    warn!(message = "error clearing persisted inflight entry", error = %e);
                }
            }
        }
    }

    fn get_session_mut(&mut self, client_id: &ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    fn open_session(
        &mut self,
        auth_id: AuthId,
        connreq: ConnReq,
    ) -> Result<proto::ConnAck, SessionError> {
        let client_id = connreq.client_id().clone();

        let ack = proto::ConnAck {
            // Sessions are never restored from durable storage.
            session_present: false,
            return_code: proto::ConnectReturnCode::Accepted,
        };

        match self.sessions.remove(&client_id) {
            Some(Session::Connected(current)) => {
                // [MQTT-3.1.4-2] If the ClientId represents a Client already
                // connected to the Server then the Server MUST disconnect the
                // existing Client.
                info!(
                    "client id {} reconnected, evicting its previous connection",
                    client_id
                );

                let (state, _will, handle) = current.into_parts();
                release_session_gauges(&state);
                let old_session =
                    Session::new_disconnecting(state.client_info().clone(), None, handle);

                let new_session = make_session(auth_id, connreq, &self.config);
                self.sessions.insert(client_id, new_session);

                Err(SessionError::DuplicateSession(old_session, ack))
            }
            _ => {
                info!("creating new session for {}", client_id);
                let new_session = make_session(auth_id, connreq, &self.config);
                self.sessions.insert(client_id, new_session);
                metrics::CLIENTS_CONNECTED.inc();

                Ok(ack)
            }
        }
    }

    fn close_session(&mut self, client_id: &ClientId) -> Option<Session> {
        match self.sessions.remove(client_id) {
            Some(Session::Connected(connected)) => {
                info!("closing session for {}", client_id);
                metrics::CLIENTS_CONNECTED.dec();

                let (state, will, handle) = connected.into_parts();
                release_session_gauges(&state);

                if state.clean_session() {
                    if let Err(e) = self.store.delete_session(client_id.as_str()) {
                        warn!(message = "error deleting persisted session", error = %e);
                    }
                }

                Some(Session::new_disconnecting(
                    state.client_info().clone(),
                    will,
                    handle,
                ))
            }
            Some(session @ Session::Disconnecting(_)) => {
                self.sessions.insert(client_id.clone(), session);
                None
            }
            None => None,
        }
    }

    /// Routes a publication to every session with a matching subscription,
    /// updating the retained store first when the retain flag is set.
    fn publish_all(&mut self, mut publication: Publication) -> Result<(), Error> {
        if publication.retain {
            self.retain(&publication);

            // On the wire the retain flag only marks a stored message being
            // replayed to a new subscriber; live fan-out always clears it
            // [MQTT-3.3.1-9].
            publication.retain = false;
        }

        for session in self.sessions.values_mut() {
            if let Err(e) = publish_to(self.store.as_ref(), session, &publication) {
                warn!(message = "error dispatching publication", error = %e);
            }
        }

        Ok(())
    }

    /// Applies retained-store semantics for one publication: an empty
    /// payload clears the topic's entry, anything else replaces it.
    ///
    /// Ref: 3.3.1.3 RETAIN
    fn retain(&mut self, publication: &Publication) {
        if !self.config.retained_messages() {
            return;
        }

        if publication.payload.is_empty() {
            if self.retained.remove(&publication.topic).is_some() {
                info!("cleared retained message for topic \"{}\"", publication.topic);
            }
        } else {
            let replaced = self
                .retained
                .insert(publication.topic.clone(), publication.clone());
            info!(
                "{} retained message for topic \"{}\"",
                if replaced.is_some() { "replaced" } else { "stored" },
                publication.topic
            );
        }
        metrics::RETAINED_MESSAGES.set(self.retained.len() as i64);

        if let Err(e) = self
            .store
            .store_retained(&publication.topic, &publication_record(publication))
        {
            warn!(message = "error persisting retained message", error = %e);
        }
    }

    fn persist_session(&self, client_id: &ClientId) {
        let connected = match self.sessions.get(client_id) {
            Some(Session::Connected(connected)) => connected,
            _ => return,
        };

        let record = SessionRecord {
            client_id: client_id.as_str().to_string(),
            clean_session: connected.state().clean_session(),
            subscriptions: connected
                .state()
                .subscriptions()
                .iter()
                .map(|(filter, subscription)| SubscriptionRecord {
                    topic: filter.clone(),
                    qos: (*subscription.max_qos()).into(),
                })
                .collect(),
        };

        if let Err(e) = self.store.save_session(&record) {
            warn!(message = "error persisting session", error = %e);
        }
    }
}

fn make_session(auth_id: AuthId, connreq: ConnReq, config: &BrokerConfig) -> Session {
    let client_id = connreq.client_id().clone();
    let (peer_addr, connect, handle) = connreq.into_parts();

    // With no durable session storage both clean and persistent sessions
    // start from a fresh state; the flag only controls store cleanup on
    // close.
    let clean_session = connect.clean_session;
    let will = connect.will.map(Publication::from);

    let client_info = ClientInfo::new(client_id, peer_addr, auth_id);
    let state = SessionState::new(client_info, clean_session, config.max_inflight_messages());
    Session::new_connected(state, will, handle)
}

fn release_session_gauges(state: &SessionState) {
    metrics::SUBSCRIPTIONS_ACTIVE.sub(state.subscriptions().len() as i64);
    metrics::QOS_MESSAGES_INFLIGHT
        .with_label_values(&["1"])
        .sub(state.inflight_len() as i64);
}

fn subscribe(
    session: &mut Session,
    subscribe: proto::Subscribe,
    granted_cap: proto::QoS,
) -> Result<(proto::SubAck, Vec<Subscription>), Error> {
    let mut subscriptions = Vec::with_capacity(subscribe.requests.len());
    let mut return_codes = Vec::with_capacity(subscribe.requests.len());

    for request in subscribe.requests {
        let code = match session.subscribe_to(request, granted_cap) {
            Ok((code, subscription)) => {
                if let Some(subscription) = subscription {
                    subscriptions.push(subscription);
                }
                code
            }
            Err(e) => {
                warn!(message = "error subscribing to a topic", error = %e);
                proto::SubscribeReturnCode::Failure
            }
        };
        return_codes.push(code);
    }

    let suback = proto::SubAck {
        packet_id: subscribe.packet_id,
        return_codes,
    };

    Ok((suback, subscriptions))
}

fn publish_to(
    store: &dyn Store,
    session: &mut Session,
    publication: &Publication,
) -> Result<(), Error> {
    if let Some(event) = session.publish_to(publication)? {
        if let ClientEvent::PublishTo(Publish::QoS1(packet_id, publish)) = &event {
            if let Err(e) = store.persist_inflight(
                session.client_id().as_str(),
                packet_id.get(),
                &publish_record(publish),
            ) {
                warn!(message = "error persisting inflight entry", error = %e);
            }
        }
        session.send(event)?;
    }
    Ok(())
}

fn publication_record(publication: &Publication) -> MessageRecord {
    MessageRecord {
        topic: publication.topic.clone(),
        payload: publication.payload.to_vec(),
        qos: publication.qos.into(),
        retain: publication.retain,
    }
}

fn publish_record(publish: &proto::Publish) -> MessageRecord {
    MessageRecord {
        topic: publish.topic.clone(),
        payload: publish.payload.to_vec(),
        qos: publish.qos.into(),
        retain: publish.retain,
    }
}

async fn retry_sweep(handle: BrokerHandle, interval: std::time::Duration) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if handle.send(Message::System(SystemEvent::RetrySweep)).is_err() {
            break;
        }
    }
}

pub struct BrokerBuilder<N> {
    authenticator: N,
    store: Arc<dyn Store>,
    config: BrokerConfig,
}

impl Default for BrokerBuilder<DefaultAuthenticator> {
    fn default() -> Self {
        Self {
            authenticator: DefaultAuthenticator,
            store: Arc::new(MemoryStore::new()),
            config: BrokerConfig::default(),
        }
    }
}

impl<N> BrokerBuilder<N>
where
    N: Authenticator,
{
    pub fn with_authenticator<N1>(self, authenticator: N1) -> BrokerBuilder<N1>
    where
        N1: Authenticator,
    {
        BrokerBuilder {
            authenticator,
            store: self.store,
            config: self.config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Broker<N> {
        let (sender, messages) = mpsc::unbounded_channel();

        Broker {
            sender,
            messages,
            sessions: HashMap::new(),
            retained: HashMap::new(),
            authenticator: self.authenticator,
            store: self.store,
            config: self.config,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BrokerHandle(UnboundedSender<Message>);

impl BrokerHandle {
    pub fn send(&self, message: Message) -> Result<(), Error> {
        self.0.send(message).map_err(Error::SendBrokerMessage)
    }
}

#[derive(Debug)]
enum SessionError {
    DuplicateSession(Session, proto::ConnAck),
}

#[cfg(test)]
pub(crate) mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use bytes::Bytes;
    use matches::assert_matches;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::auth::AuthenticationContext;
    use crate::tests::peer_addr;
    use crate::ConnectionHandle;

    fn connection_handle() -> (ConnectionHandle, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::from_sender(tx), rx)
    }

    fn transient_connect(id: impl Into<String>) -> proto::Connect {
        proto::Connect {
            protocol_name: proto::PROTOCOL_NAME.to_string(),
            protocol_level: proto::PROTOCOL_LEVEL,
            clean_session: true,
            keep_alive: Duration::default(),
            client_id: id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    fn connect_client(
        handle: &BrokerHandle,
        id: &str,
        connect: proto::Connect,
    ) -> UnboundedReceiver<Message> {
        let (conn, rx) = connection_handle();
        let client_id = ClientId::from(id);
        let req = ConnReq::new(client_id.clone(), peer_addr(), connect, None, conn);
        handle
            .send(Message::Client(client_id, ClientEvent::ConnReq(req)))
            .unwrap();
        rx
    }

    async fn expect_connack(rx: &mut UnboundedReceiver<Message>) {
        assert_matches!(
            rx.recv().await,
            Some(Message::Client(
                _,
                ClientEvent::ConnAck(proto::ConnAck {
                    return_code: proto::ConnectReturnCode::Accepted,
                    session_present: false,
                })
            ))
        );
    }

    async fn expect_refused(
        rx: &mut UnboundedReceiver<Message>,
        expected: proto::ConnectReturnCode,
    ) {
        match rx.recv().await {
            Some(Message::Client(_, ClientEvent::ConnAck(connack))) => {
                assert_eq!(connack.return_code, expected);
                assert!(!connack.session_present);
            }
            other => panic!("expected CONNACK, received {:?}", other),
        }
        assert_matches!(
            rx.recv().await,
            Some(Message::Client(_, ClientEvent::DropConnection))
        );
        assert_matches!(rx.recv().await, None);
    }

    fn subscribe_to(handle: &BrokerHandle, id: &str, filter: &str, qos: proto::QoS) {
        let subscribe = proto::Subscribe {
            packet_id: proto::PacketId::new(1).unwrap(),
            requests: vec![proto::SubscribeRequest {
                filter: filter.to_string(),
                qos,
            }],
        };
        handle
            .send(Message::Client(
                ClientId::from(id),
                ClientEvent::Subscribe(subscribe),
            ))
            .unwrap();
    }

    fn publish_from(
        handle: &BrokerHandle,
        id: &str,
        topic: &str,
        payload: &'static [u8],
        qos: proto::QoS,
        packet_id: Option<proto::PacketId>,
        retain: bool,
    ) {
        let publish = proto::Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::from_static(payload),
        };
        handle
            .send(Message::Client(
                ClientId::from(id),
                ClientEvent::PublishFrom(publish),
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_accepted() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "blah", transient_connect("blah"));
        expect_connack(&mut rx).await;
    }

    #[tokio::test]
    async fn test_invalid_protocol_level() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut connect = transient_connect("blah");
        connect.protocol_level = 0x3;
        let mut rx = connect_client(&handle, "blah", connect);

        expect_refused(
            &mut rx,
            proto::ConnectReturnCode::UnacceptableProtocolVersion,
        )
        .await;
    }

    #[tokio::test]
    async fn test_legacy_protocol_name_is_refused() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut connect = transient_connect("blah");
        connect.protocol_name = proto::PROTOCOL_NAME_LEGACY.to_string();
        connect.protocol_level = 0x3;
        let mut rx = connect_client(&handle, "blah", connect);

        expect_refused(
            &mut rx,
            proto::ConnectReturnCode::UnacceptableProtocolVersion,
        )
        .await;
    }

    #[tokio::test]
    async fn test_connect_bad_credentials() {
        let broker = BrokerBuilder::default()
            .with_authenticator(|_: AuthenticationContext| {
                Ok::<_, Infallible>(Authentication::BadCredentials)
            })
            .build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "blah", transient_connect("blah"));
        expect_refused(&mut rx, proto::ConnectReturnCode::BadCredentials).await;
    }

    #[tokio::test]
    async fn test_connect_not_authorized() {
        let broker = BrokerBuilder::default()
            .with_authenticator(|_: AuthenticationContext| {
                Ok::<_, Infallible>(Authentication::NotAuthorized)
            })
            .build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "blah", transient_connect("blah"));
        expect_refused(&mut rx, proto::ConnectReturnCode::NotAuthorized).await;
    }

    #[tokio::test]
    async fn test_connect_authentication_failed() {
        let broker = BrokerBuilder::default()
            .with_authenticator(|_: AuthenticationContext| {
                Err::<Authentication, _>(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "auth backend unavailable",
                ))
            })
            .build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "blah", transient_connect("blah"));
        expect_refused(&mut rx, proto::ConnectReturnCode::ServerUnavailable).await;
    }

    #[tokio::test]
    async fn test_double_connect_drop_first() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx1 = connect_client(&handle, "blah", transient_connect("blah"));
        expect_connack(&mut rx1).await;

        let mut rx2 = connect_client(&handle, "blah", transient_connect("blah"));

        // the first connection is dropped the moment the second is acknowledged
        assert_matches!(
            rx1.recv().await,
            Some(Message::Client(_, ClientEvent::DropConnection))
        );
        assert_matches!(rx1.recv().await, None);

        expect_connack(&mut rx2).await;
    }

    #[tokio::test]
    async fn test_max_clients_refused_with_server_unavailable() {
        let config = BrokerConfig::new(1, 100, true, 1, Duration::from_secs(10), 3);
        let broker = BrokerBuilder::default().with_config(config).build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx1 = connect_client(&handle, "one", transient_connect("one"));
        expect_connack(&mut rx1).await;

        let mut rx2 = connect_client(&handle, "two", transient_connect("two"));
        expect_refused(&mut rx2, proto::ConnectReturnCode::ServerUnavailable).await;
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "blah", transient_connect("blah"));
        expect_connack(&mut rx).await;

        handle
            .send(Message::Client(ClientId::from("blah"), ClientEvent::PingReq))
            .unwrap();

        assert_matches!(
            rx.recv().await,
            Some(Message::Client(_, ClientEvent::PingResp))
        );
    }

    #[tokio::test]
    async fn test_basic_publish_subscribe() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut sub_rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut sub_rx).await;

        subscribe_to(&handle, "sub", "test/topic", proto::QoS::AtMostOnce);
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::SubAck(suback)))
                if suback.return_codes
                    == vec![proto::SubscribeReturnCode::Success(proto::QoS::AtMostOnce)]
        );

        let mut pub_rx = connect_client(&handle, "pub", transient_connect("pub"));
        expect_connack(&mut pub_rx).await;

        publish_from(
            &handle,
            "pub",
            "test/topic",
            b"Hello MQTT Server!",
            proto::QoS::AtMostOnce,
            None,
            false,
        );

        match sub_rx.recv().await {
            Some(Message::Client(_, ClientEvent::PublishTo(Publish::QoS0(publish)))) => {
                assert_eq!(publish.topic, "test/topic");
                assert_eq!(publish.payload, Bytes::from_static(b"Hello MQTT Server!"));
                assert!(!publish.retain);
                assert!(!publish.dup);
                assert_eq!(publish.qos, proto::QoS::AtMostOnce);
                assert_eq!(publish.packet_id, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_qos1_publish_acks_publisher_and_tracks_subscriber() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut sub_rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut sub_rx).await;
        subscribe_to(&handle, "sub", "test/topic", proto::QoS::AtLeastOnce);
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::SubAck(_)))
        );

        let mut pub_rx = connect_client(&handle, "pub", transient_connect("pub"));
        expect_connack(&mut pub_rx).await;

        publish_from(
            &handle,
            "pub",
            "test/topic",
            b"payload",
            proto::QoS::AtLeastOnce,
            proto::PacketId::new(42),
            false,
        );

        // the publisher is acked with its own packet identifier
        assert_matches!(
            pub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::PubAck(packet_id)))
                if packet_id.get() == 42
        );

        // the subscriber receives the delivery with a broker-allocated id
        let packet_id = match sub_rx.recv().await {
            Some(Message::Client(_, ClientEvent::PublishTo(Publish::QoS1(packet_id, publish)))) => {
                assert!(!publish.dup);
                assert_eq!(publish.packet_id, Some(packet_id));
                packet_id
            }
            other => panic!("unexpected message: {:?}", other),
        };
        assert_ne!(packet_id.get(), 0);

        // the subscriber's ack settles the inflight entry
        handle
            .send(Message::Client(
                ClientId::from("sub"),
                ClientEvent::PubAck(packet_id),
            ))
            .unwrap();

        // an ack for an unknown identifier is ignored without disturbing the session
        handle
            .send(Message::Client(
                ClientId::from("sub"),
                ClientEvent::PubAck(proto::PacketId::new(999).unwrap()),
            ))
            .unwrap();

        handle
            .send(Message::Client(ClientId::from("sub"), ClientEvent::PingReq))
            .unwrap();
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::PingResp))
        );
    }

    #[tokio::test]
    async fn test_retained_message_delivered_to_new_subscriber() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut pub_rx = connect_client(&handle, "pub", transient_connect("pub"));
        expect_connack(&mut pub_rx).await;
        publish_from(
            &handle,
            "pub",
            "status/system",
            b"running",
            proto::QoS::AtMostOnce,
            None,
            true,
        );

        handle
            .send(Message::Client(
                ClientId::from("pub"),
                ClientEvent::Disconnect,
            ))
            .unwrap();

        let mut sub_rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut sub_rx).await;
        subscribe_to(&handle, "sub", "status/system", proto::QoS::AtMostOnce);

        // SUBACK first, then the retained message with the retain flag set
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::SubAck(_)))
        );
        match sub_rx.recv().await {
            Some(Message::Client(_, ClientEvent::PublishTo(Publish::QoS0(publish)))) => {
                assert_eq!(publish.topic, "status/system");
                assert_eq!(publish.payload, Bytes::from_static(b"running"));
                assert!(publish.retain);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retained_message_cleared_by_empty_payload() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut pub_rx = connect_client(&handle, "pub", transient_connect("pub"));
        expect_connack(&mut pub_rx).await;
        publish_from(
            &handle,
            "pub",
            "status/system",
            b"running",
            proto::QoS::AtMostOnce,
            None,
            true,
        );
        publish_from(
            &handle,
            "pub",
            "status/system",
            b"",
            proto::QoS::AtMostOnce,
            None,
            true,
        );

        let mut sub_rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut sub_rx).await;
        subscribe_to(&handle, "sub", "status/system", proto::QoS::AtMostOnce);

        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::SubAck(_)))
        );

        // no retained message follows; the next traffic is the ping response
        handle
            .send(Message::Client(ClientId::from("sub"), ClientEvent::PingReq))
            .unwrap();
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::PingResp))
        );
    }

    #[tokio::test]
    async fn test_wildcard_publish_topic_drops_connection() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "pub", transient_connect("pub"));
        expect_connack(&mut rx).await;

        publish_from(
            &handle,
            "pub",
            "test/+/topic",
            b"payload",
            proto::QoS::AtMostOnce,
            None,
            false,
        );

        assert_matches!(
            rx.recv().await,
            Some(Message::Client(_, ClientEvent::DropConnection))
        );
        assert_matches!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_qos2_publish_drops_connection() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "pub", transient_connect("pub"));
        expect_connack(&mut rx).await;

        publish_from(
            &handle,
            "pub",
            "test/topic",
            b"payload",
            proto::QoS::ExactlyOnce,
            proto::PacketId::new(5),
            false,
        );

        assert_matches!(
            rx.recv().await,
            Some(Message::Client(_, ClientEvent::DropConnection))
        );
    }

    #[tokio::test]
    async fn test_subscribe_with_invalid_filter_gets_failure_code() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut rx).await;

        let subscribe = proto::Subscribe {
            packet_id: proto::PacketId::new(1).unwrap(),
            requests: vec![
                proto::SubscribeRequest {
                    filter: "valid/topic".to_string(),
                    qos: proto::QoS::AtMostOnce,
                },
                proto::SubscribeRequest {
                    filter: "invalid/#/filter".to_string(),
                    qos: proto::QoS::AtMostOnce,
                },
            ],
        };
        handle
            .send(Message::Client(
                ClientId::from("sub"),
                ClientEvent::Subscribe(subscribe),
            ))
            .unwrap();

        match rx.recv().await {
            Some(Message::Client(_, ClientEvent::SubAck(suback))) => {
                assert_eq!(
                    suback.return_codes,
                    vec![
                        proto::SubscribeReturnCode::Success(proto::QoS::AtMostOnce),
                        proto::SubscribeReturnCode::Failure,
                    ]
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // the connection stays up
        handle
            .send(Message::Client(ClientId::from("sub"), ClientEvent::PingReq))
            .unwrap();
        assert_matches!(
            rx.recv().await,
            Some(Message::Client(_, ClientEvent::PingResp))
        );
    }

    #[tokio::test]
    async fn test_will_published_on_ungraceful_disconnect() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut sub_rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut sub_rx).await;
        subscribe_to(&handle, "sub", "clients/+/status", proto::QoS::AtMostOnce);
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::SubAck(_)))
        );

        let mut connect = transient_connect("doomed");
        connect.will = Some(proto::LastWill {
            topic: "clients/doomed/status".to_string(),
            payload: Bytes::from_static(b"offline"),
            qos: proto::QoS::AtMostOnce,
            retain: false,
        });
        let mut doomed_rx = connect_client(&handle, "doomed", connect);
        expect_connack(&mut doomed_rx).await;

        // connection failure
        handle
            .send(Message::Client(
                ClientId::from("doomed"),
                ClientEvent::DropConnection,
            ))
            .unwrap();

        match sub_rx.recv().await {
            Some(Message::Client(_, ClientEvent::PublishTo(Publish::QoS0(publish)))) => {
                assert_eq!(publish.topic, "clients/doomed/status");
                assert_eq!(publish.payload, Bytes::from_static(b"offline"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_will_not_published_on_graceful_disconnect() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut sub_rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut sub_rx).await;
        subscribe_to(&handle, "sub", "clients/+/status", proto::QoS::AtMostOnce);
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::SubAck(_)))
        );

        let mut connect = transient_connect("polite");
        connect.will = Some(proto::LastWill {
            topic: "clients/polite/status".to_string(),
            payload: Bytes::from_static(b"offline"),
            qos: proto::QoS::AtMostOnce,
            retain: false,
        });
        let mut polite_rx = connect_client(&handle, "polite", connect);
        expect_connack(&mut polite_rx).await;

        handle
            .send(Message::Client(
                ClientId::from("polite"),
                ClientEvent::Disconnect,
            ))
            .unwrap();

        // no will: next delivery for the subscriber is the ping response
        handle
            .send(Message::Client(ClientId::from("sub"), ClientEvent::PingReq))
            .unwrap();
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::PingResp))
        );
    }

    #[tokio::test]
    async fn test_single_level_wildcard_routing() {
        let broker = BrokerBuilder::default().build();
        let handle = broker.handle();
        tokio::spawn(broker.run());

        let mut sub_rx = connect_client(&handle, "sub", transient_connect("sub"));
        expect_connack(&mut sub_rx).await;
        subscribe_to(
            &handle,
            "sub",
            "sensors/+/temperature",
            proto::QoS::AtMostOnce,
        );
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::SubAck(_)))
        );

        let mut pub_rx = connect_client(&handle, "pub", transient_connect("pub"));
        expect_connack(&mut pub_rx).await;

        for topic in &[
            "sensors/room1/temperature",
            "sensors/outdoor/temperature",
            "sensors/room1/temp/current",
        ] {
            publish_from(
                &handle,
                "pub",
                topic,
                b"22",
                proto::QoS::AtMostOnce,
                None,
                false,
            );
        }

        // only the two matching topics arrive, in publish order
        match sub_rx.recv().await {
            Some(Message::Client(_, ClientEvent::PublishTo(Publish::QoS0(publish)))) => {
                assert_eq!(publish.topic, "sensors/room1/temperature");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match sub_rx.recv().await {
            Some(Message::Client(_, ClientEvent::PublishTo(Publish::QoS0(publish)))) => {
                assert_eq!(publish.topic, "sensors/outdoor/temperature");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        handle
            .send(Message::Client(ClientId::from("sub"), ClientEvent::PingReq))
            .unwrap();
        assert_matches!(
            sub_rx.recv().await,
            Some(Message::Client(_, ClientEvent::PingResp))
        );
    }
}
