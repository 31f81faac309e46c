use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::FutureExt;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

use stratus_broker::auth::PasswordFileAuthenticator;
use stratus_broker::settings::BrokerConfig;
use stratus_broker::{BrokerBuilder, Server, Settings};
use stratus_proto as proto;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A broker running on an ephemeral loopback port.
pub struct TestServer {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), stratus_broker::Error>>>,
    _config: tempfile::NamedTempFile,
}

impl TestServer {
    /// Starts a broker configured with the given YAML fragment (appended to
    /// a `server` section binding an ephemeral loopback port).
    pub async fn start(extra_config: &str) -> Self {
        let port = pick_port();

        let mut config = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        write!(
            config,
            "server:\n  host: 127.0.0.1\n  port: {}\n{}",
            port, extra_config
        )
        .expect("write config");

        let settings = Settings::from_file(config.path()).expect("valid settings");

        let authenticator =
            PasswordFileAuthenticator::from_settings(settings.auth()).expect("authenticator");
        let broker = BrokerBuilder::default()
            .with_authenticator(authenticator)
            .with_config(BrokerConfig::from(&settings))
            .build();

        let server = Server::from_settings(broker, &settings).expect("server");

        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(rx.map(drop)));

        wait_for_listener(port).await;

        Self {
            port,
            shutdown: Some(shutdown),
            task: Some(task),
            _config: config,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = timeout(RECV_TIMEOUT, task).await;
        }
    }
}

fn pick_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

async fn wait_for_listener(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("broker did not start listening on port {}", port);
}

/// A raw MQTT client speaking the wire protocol over a framed TCP stream.
pub struct TestClient {
    framed: Framed<TcpStream, proto::PacketCodec>,
}

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to broker");
        stream.set_nodelay(true).expect("nodelay");

        Self {
            framed: Framed::new(stream, proto::PacketCodec::default()),
        }
    }

    pub async fn send(&mut self, packet: proto::Packet) {
        self.framed.send(packet).await.expect("send packet");
    }

    pub async fn send_connect(&mut self, connect: proto::Connect) {
        self.send(proto::Packet::Connect(connect)).await;
    }

    /// Receives the next packet, panicking on timeout, close or decode error.
    pub async fn recv(&mut self) -> proto::Packet {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(packet))) => packet,
            Ok(Some(Err(e))) => panic!("decode error: {}", e),
            Ok(None) => panic!("connection closed while waiting for a packet"),
            Err(_) => panic!("timed out waiting for a packet"),
        }
    }

    /// Waits for the broker to close the socket, panicking if a packet
    /// arrives instead.
    pub async fn expect_closed(&mut self) {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => (),
            Ok(Some(Ok(packet))) => panic!("expected close, received {:?}", packet),
            Err(_) => panic!("timed out waiting for the connection to close"),
        }
    }

    /// Asserts no packet arrives within the given window.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(Ok(packet))) = timeout(window, self.framed.next()).await {
            panic!("expected silence, received {:?}", packet);
        }
    }

    pub async fn expect_connack(&mut self) {
        match self.recv().await {
            proto::Packet::ConnAck(proto::ConnAck {
                session_present: false,
                return_code: proto::ConnectReturnCode::Accepted,
            }) => (),
            other => panic!("expected CONNACK accepted, received {:?}", other),
        }
    }

    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: proto::QoS) {
        self.send(proto::Packet::Subscribe(proto::Subscribe {
            packet_id: proto::PacketId::new(packet_id).expect("nonzero id"),
            requests: vec![proto::SubscribeRequest {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;
    }

    pub async fn expect_suback(&mut self, packet_id: u16, codes: Vec<proto::SubscribeReturnCode>) {
        match self.recv().await {
            proto::Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id.get(), packet_id);
                assert_eq!(suback.return_codes, codes);
            }
            other => panic!("expected SUBACK, received {:?}", other),
        }
    }

    pub async fn publish_qos0(&mut self, topic: &str, payload: &'static [u8], retain: bool) {
        self.send(proto::Packet::Publish(proto::Publish {
            dup: false,
            qos: proto::QoS::AtMostOnce,
            retain,
            topic: topic.to_string(),
            packet_id: None,
            payload: Bytes::from_static(payload),
        }))
        .await;
    }

    pub async fn expect_publish(&mut self) -> proto::Publish {
        match self.recv().await {
            proto::Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, received {:?}", other),
        }
    }

    pub async fn disconnect(mut self) {
        self.send(proto::Packet::Disconnect).await;
    }
}

pub fn connect_packet(client_id: &str, keep_alive: Duration) -> proto::Connect {
    proto::Connect {
        protocol_name: proto::PROTOCOL_NAME.to_string(),
        protocol_level: proto::PROTOCOL_LEVEL,
        clean_session: true,
        keep_alive,
        client_id: client_id.to_string(),
        will: None,
        username: None,
        password: None,
    }
}
