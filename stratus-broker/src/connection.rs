use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::pin_mut;
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_io_timeout::TimeoutStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, span, warn, Instrument, Level};
use uuid::Uuid;

use crate::auth::Certificate;
use crate::broker::BrokerHandle;
use crate::proto::{self, CodecError, EncodeError, Packet, PacketCodec};
use crate::{metrics, ClientEvent, ClientId, ConnReq, Error, Message, Publish};

/// [MQTT-3.1.2-24] - the server must disconnect a client that stays silent
/// for one and a half times its keep-alive period.
const KEEPALIVE_MULT: f32 = 1.5;

/// Socket-level limits for a single connection, derived from the `server`
/// and `limits` config sections.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionSettings {
    read_timeout: Duration,
    write_timeout: Duration,
    max_message_size: usize,
}

impl ConnectionSettings {
    pub(crate) fn new(
        read_timeout: Duration,
        write_timeout: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            read_timeout,
            write_timeout,
            max_message_size,
        }
    }
}

/// Allows sending events to a connection.
///
/// Deliberately not `Clone`: connection teardown relies on this being the
/// only sender, so dropping it closes the session's event channel.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: Uuid, sender: UnboundedSender<Message>) -> Self {
        Self { id, sender }
    }

    pub fn from_sender(sender: UnboundedSender<Message>) -> Self {
        Self::new(Uuid::new_v4(), sender)
    }

    pub fn send(&self, message: Message) -> Result<(), Error> {
        self.sender
            .send(message)
            .map_err(Error::SendConnectionMessage)
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Drives one client connection from accept to teardown.
///
/// The socket starts in a CONNECT-or-nothing state, then splits into a read
/// half feeding the broker and a write half draining the session's event
/// channel. Because every outbound frame goes through that single write
/// half, frames from different sources can never interleave mid-packet.
pub(crate) async fn process<I>(
    io: I,
    remote_addr: SocketAddr,
    certificate: Option<Certificate>,
    broker_handle: BrokerHandle,
    settings: &ConnectionSettings,
) -> Result<(), Error>
where
    I: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut timeout = TimeoutStream::new(io);
    timeout.set_read_timeout(Some(settings.read_timeout));
    timeout.set_write_timeout(Some(settings.write_timeout));

    let io = Box::pin(timeout);
    let mut codec = Framed::new(
        io,
        PacketCodec::with_max_packet_size(settings.max_message_size),
    );

    // [MQTT-3.1.0-1] - a new socket gets to say CONNECT and nothing else.
    // The handshake is parsed right here, before the broker hears about the
    // connection at all: the client id it yields is stamped onto every
    // later packet, and a socket that opens with anything other than
    // CONNECT is closed without a response.
    let connect = match codec.next().await {
        Some(Ok(packet)) => {
            metrics::MESSAGES_RECEIVED
                .with_label_values(&[packet.name()])
                .inc();
            metrics::BYTES_RECEIVED.inc_by(proto::encoded_size(&packet) as u64);

            match packet {
                Packet::Connect(connect) => connect,
                packet => return Err(Error::NoConnect(packet)),
            }
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(Error::NoPackets),
    };

    let client_id = client_id(&connect);
    let (sender, events) = mpsc::unbounded_channel();
    let connection_handle = ConnectionHandle::from_sender(sender);
    let span = span!(Level::INFO, "connection", client_id = %client_id, remote_addr = %remote_addr, connection = %connection_handle);

    // everything past the handshake runs inside the connection span
    async {
        info!("new client connection");
        debug!("received CONNECT: {:?}", connect);

        // From here on the read timeout tracks the keep-alive contract
        // instead of the socket default: 1.5x the client's interval, or no
        // timeout at all for a keep-alive of zero [MQTT-3.1.2-24]. Every
        // inbound packet restarts the clock.
        let keep_alive = connect.keep_alive.mul_f32(KEEPALIVE_MULT);
        if keep_alive == Duration::from_secs(0) {
            debug!("client disabled keep-alive, lifting the read timeout");
            codec.get_mut().as_mut().set_read_timeout_pinned(None);
        } else {
            debug!("enforcing a read timeout of {:?}", keep_alive);
            codec
                .get_mut()
                .as_mut()
                .set_read_timeout_pinned(Some(keep_alive));
        }

        let (sink, stream) = codec.split();

        let req = ConnReq::new(
            client_id.clone(),
            remote_addr,
            connect,
            certificate,
            connection_handle,
        );
        broker_handle.send(Message::Client(
            client_id.clone(),
            ClientEvent::ConnReq(req),
        ))?;

        let reader = read_loop(client_id.clone(), stream, broker_handle.clone());
        let writer = write_loop(events, sink);
        pin_mut!(reader);
        pin_mut!(writer);

        // Supervise both halves. Whichever finishes first decides how the
        // other is wound down.
        tokio::select! {
            read_end = &mut reader => {
                if let Err(e) = read_end {
                    debug!(message = "read loop ended with an error, asking the broker to drop the connection", error = %e);
                    broker_handle.send(Message::Client(
                        client_id.clone(),
                        ClientEvent::DropConnection,
                    ))?;
                }

                // The read loop's final message makes the broker close the
                // session, which tells the writer to stop; wait for it to
                // flush and finish.
                if let Err(e) = writer.await {
                    debug!(message = "write loop ended with an error", error = %e);
                }
            }
            write_end = &mut writer => {
                if let Err(e) = write_end {
                    debug!(message = "write loop ended with an error, asking the broker to clean up", error = %e);
                    broker_handle.send(Message::Client(
                        client_id.clone(),
                        ClientEvent::CloseSession,
                    ))?;
                }

                // The writer only stops on a broker-initiated close or a
                // dead socket; dropping the read half tears the socket down
                // either way.
            }
        }

        info!("closing connection");
        Ok(())
    }
    .instrument(span)
    .await
}

/// Forwards decoded packets to the broker until the client disconnects, the
/// socket dies, or the client breaks protocol.
async fn read_loop<S>(
    client_id: ClientId,
    mut stream: S,
    broker: BrokerHandle,
) -> Result<(), Error>
where
    S: Stream<Item = Result<Packet, CodecError>> + Unpin,
{
    debug!("read loop started");
    while let Some(next) = stream.next().await {
        let packet = match next {
            Ok(packet) => packet,
            Err(e) => {
                warn!(message = "error reading from connection", error = %e);
                return Err(e.into());
            }
        };

        metrics::MESSAGES_RECEIVED
            .with_label_values(&[packet.name()])
            .inc();
        metrics::BYTES_RECEIVED.inc_by(proto::encoded_size(&packet) as u64);

        let event = match packet {
            // [MQTT-3.1.0-2] - a second CONNECT is a protocol violation
            Packet::Connect(_) => {
                warn!("repeated CONNECT on an established connection");
                return Err(Error::ProtocolViolation);
            }
            Packet::Disconnect => {
                debug!("client disconnected gracefully");
                broker.send(Message::Client(client_id, ClientEvent::Disconnect))?;
                return Ok(());
            }
            Packet::Publish(publish) => ClientEvent::PublishFrom(publish),
            Packet::PubAck(packet_id) => ClientEvent::PubAck(packet_id),
            Packet::PubRec(packet_id) => ClientEvent::PubRec(packet_id),
            Packet::PubRel(packet_id) => ClientEvent::PubRel(packet_id),
            Packet::PubComp(packet_id) => ClientEvent::PubComp(packet_id),
            Packet::Subscribe(subscribe) => ClientEvent::Subscribe(subscribe),
            Packet::Unsubscribe(unsubscribe) => ClientEvent::Unsubscribe(unsubscribe),
            Packet::PingReq => ClientEvent::PingReq,
            // server-to-client packets have no business arriving here
            packet @ Packet::ConnAck(_)
            | packet @ Packet::SubAck(_)
            | packet @ Packet::UnsubAck(_)
            | packet @ Packet::PingResp => {
                debug!("ignoring unexpected {} from client", packet.name());
                continue;
            }
        };

        broker.send(Message::Client(client_id.clone(), event))?;
    }

    // EOF without DISCONNECT: the peer vanished
    debug!("connection closed by peer");
    broker.send(Message::Client(client_id, ClientEvent::DropConnection))?;
    Ok(())
}

/// Writes session events to the socket until the broker signals a close or
/// the event channel runs dry.
async fn write_loop<S>(mut events: UnboundedReceiver<Message>, mut sink: S) -> Result<(), Error>
where
    S: Sink<Packet, Error = EncodeError> + Unpin,
{
    debug!("write loop started");
    while let Some(message) = events.recv().await {
        let event = match message {
            Message::Client(_, event) => event,
            Message::System(_) => continue,
        };

        let packet = match outbound(event) {
            Outbound::Packet(packet) => packet,
            Outbound::Skip => continue,
            Outbound::Stop => break,
        };

        let name = packet.name();
        let size = proto::encoded_size(&packet) as u64;

        sink.send(packet).await?;
        metrics::MESSAGES_SENT.with_label_values(&[name]).inc();
        metrics::BYTES_SENT.inc_by(size);
    }

    debug!("write loop finished");
    Ok(())
}

enum Outbound {
    Packet(Packet),
    Stop,
    Skip,
}

/// Maps a session event to the packet it puts on the wire, if any.
fn outbound(event: ClientEvent) -> Outbound {
    match event {
        ClientEvent::ConnAck(connack) => Outbound::Packet(Packet::ConnAck(connack)),
        ClientEvent::PingResp => Outbound::Packet(Packet::PingResp),
        ClientEvent::SubAck(suback) => Outbound::Packet(Packet::SubAck(suback)),
        ClientEvent::UnsubAck(packet_id) => Outbound::Packet(Packet::UnsubAck(packet_id)),
        ClientEvent::PubAck(packet_id) => Outbound::Packet(Packet::PubAck(packet_id)),
        ClientEvent::PublishTo(Publish::QoS0(publish))
        | ClientEvent::PublishTo(Publish::QoS1(_, publish)) => {
            Outbound::Packet(Packet::Publish(publish))
        }
        ClientEvent::Disconnect | ClientEvent::DropConnection => Outbound::Stop,
        event => {
            warn!("not an outbound event: {:?}", event);
            Outbound::Skip
        }
    }
}

/// The id the broker will know this connection by: the client's own, or a
/// generated one when the client left it empty.
fn client_id(connect: &proto::Connect) -> ClientId {
    if connect.client_id.is_empty() {
        ClientId::from(Uuid::new_v4().to_string())
    } else {
        ClientId::from(connect.client_id.as_str())
    }
}
