use std::path::PathBuf;

use thiserror::Error;

use crate::proto::Packet;
use crate::store::StoreError;
use crate::Message;

#[derive(Debug, Error)]
pub enum Error {
    #[error("An error occurred sending a message to the broker.")]
    SendBrokerMessage(#[source] tokio::sync::mpsc::error::SendError<Message>),

    #[error("An error occurred sending a message to a connection.")]
    SendConnectionMessage(#[source] tokio::sync::mpsc::error::SendError<Message>),

    #[error("An error occurred decoding a packet.")]
    DecodePacket(#[from] crate::proto::CodecError),

    #[error("An error occurred encoding a packet.")]
    EncodePacket(#[from] crate::proto::EncodeError),

    #[error("Expected CONNECT packet as first packet, received {0:?}")]
    NoConnect(Packet),

    #[error("Connection closed before any packets received.")]
    NoPackets,

    #[error("Session is closed.")]
    SessionClosed,

    #[error("MQTT protocol violation occurred.")]
    ProtocolViolation,

    #[error("Provided topic filter is invalid: {0}")]
    InvalidTopicFilter(String),

    #[error("An error occurred joining a task.")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("An error occurred accessing the store.")]
    Store(#[from] StoreError),

    #[error("Unable to obtain peer address.")]
    PeerAddr(#[source] std::io::Error),

    #[error("Unable to start broker.")]
    InitializeBroker(#[from] InitializeBrokerError),
}

/// Represents errors occurred while bootstrapping broker.
#[derive(Debug, Error)]
pub enum InitializeBrokerError {
    #[error("An error occurred binding the server's listening socket on {0}.")]
    BindServer(String, #[source] std::io::Error),

    #[error("An error occurred getting a connection's peer address.")]
    ConnectionPeerAddress(#[source] std::io::Error),

    #[error("An error occurred getting local address.")]
    ConnectionLocalAddress(#[source] std::io::Error),

    #[error("An error occurred loading configuration.")]
    LoadConfiguration(#[from] crate::settings::SettingsError),

    #[error("An error occurred reading {0}.")]
    ReadFile(PathBuf, #[source] std::io::Error),

    #[error("No certificates found in {0}.")]
    NoCertificate(PathBuf),

    #[error("No private key found in {0}.")]
    NoPrivateKey(PathBuf),

    #[error("An error occurred bootstrapping TLS.")]
    Tls(#[source] tokio_rustls::rustls::Error),

    #[error("An error occurred loading the password file {0}.")]
    LoadPasswordFile(PathBuf, #[source] std::io::Error),

    #[error("An error occurred initializing the store.")]
    InitializeStore(#[source] StoreError),
}
