pub mod auth;
mod broker;
mod connection;
mod error;
pub mod metrics;
mod server;
mod session;
pub mod settings;
pub mod store;
mod subscription;
mod transport;

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    net::SocketAddr,
    sync::Arc,
};

use bytes::Bytes;

use stratus_proto as proto;

pub use crate::auth::{AuthId, Authentication, Authenticator, Certificate, Identity};
pub use crate::broker::{Broker, BrokerBuilder, BrokerHandle};
pub use crate::connection::ConnectionHandle;
pub use crate::error::{Error, InitializeBrokerError};
pub use crate::server::Server;
pub use crate::session::SessionState;
pub use crate::settings::Settings;
pub use crate::subscription::{Subscription, TopicFilter};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ClientId(Arc<String>);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T: Into<String>> From<T> for ClientId {
    fn from(s: T) -> ClientId {
        ClientId(Arc::new(s.into()))
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a connected client: its id, where it connected from and what
/// it authenticated as.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    client_id: ClientId,
    peer_addr: SocketAddr,
    auth_id: AuthId,
}

impl ClientInfo {
    pub fn new(client_id: ClientId, peer_addr: SocketAddr, auth_id: impl Into<AuthId>) -> Self {
        Self {
            client_id,
            peer_addr,
            auth_id: auth_id.into(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn auth_id(&self) -> &AuthId {
        &self.auth_id
    }
}

/// Connect request carried from the connection to the broker.
#[derive(Debug)]
pub struct ConnReq {
    client_id: ClientId,
    peer_addr: SocketAddr,
    connect: proto::Connect,
    certificate: Option<Certificate>,
    handle: ConnectionHandle,
}

impl ConnReq {
    pub fn new(
        client_id: ClientId,
        peer_addr: SocketAddr,
        connect: proto::Connect,
        certificate: Option<Certificate>,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            client_id,
            peer_addr,
            connect,
            certificate,
            handle,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connect(&self) -> &proto::Connect {
        &self.connect
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ConnectionHandle {
        &mut self.handle
    }

    pub fn into_handle(self) -> ConnectionHandle {
        self.handle
    }

    pub fn into_parts(self) -> (SocketAddr, proto::Connect, ConnectionHandle) {
        (self.peer_addr, self.connect, self.handle)
    }
}

/// An application message on its way through the broker: what remains of a
/// PUBLISH once the per-hop wire details (dup flag, packet id) are stripped.
///
/// Wills and retained messages are stored in this form and re-encoded into
/// fresh packets at delivery time.
#[derive(Clone, Debug, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub qos: proto::QoS,
    pub retain: bool,
    pub payload: Bytes,
}

impl From<proto::LastWill> for Publication {
    fn from(will: proto::LastWill) -> Self {
        Self {
            topic: will.topic,
            qos: will.qos,
            retain: will.retain,
            payload: will.payload,
        }
    }
}

/// An outbound publish staged for a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum Publish {
    QoS0(proto::Publish),
    QoS1(proto::PacketId, proto::Publish),
}

#[derive(Debug)]
pub enum ClientEvent {
    /// Connect request
    ConnReq(ConnReq),

    /// Connect response
    ConnAck(proto::ConnAck),

    /// Graceful disconnect request
    Disconnect,

    /// Non-graceful disconnect request
    DropConnection,

    /// The socket is already gone; only the session state needs cleaning up
    CloseSession,

    /// Ping request
    PingReq,

    /// Ping response
    PingResp,

    /// Subscribe
    Subscribe(proto::Subscribe),

    /// SubAck
    SubAck(proto::SubAck),

    /// Unsubscribe
    Unsubscribe(proto::Unsubscribe),

    /// UnsubAck
    UnsubAck(proto::PacketId),

    /// Publish packet from a client
    PublishFrom(proto::Publish),

    /// Publish packet to a client
    PublishTo(Publish),

    /// Publish acknowledgement (QoS 1)
    PubAck(proto::PacketId),

    /// Publish receive (QoS 2 publish, part 1)
    PubRec(proto::PacketId),

    /// Publish release (QoS 2 publish, part 2)
    PubRel(proto::PacketId),

    /// Publish complete (QoS 2 publish, part 3)
    PubComp(proto::PacketId),
}

#[derive(Debug)]
pub enum SystemEvent {
    Shutdown,

    /// Periodic scan of unacknowledged QoS 1 deliveries.
    RetrySweep,
}

#[derive(Debug)]
pub enum Message {
    Client(ClientId, ClientEvent),
    System(SystemEvent),
}
