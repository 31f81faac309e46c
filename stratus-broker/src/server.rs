use std::future::Future;

use futures_util::future::{self, Either, FutureExt};
use futures_util::stream::StreamExt;
use tokio::sync::oneshot;
use tracing::{error, info, info_span, warn, Instrument};

use crate::auth::Authenticator;
use crate::broker::{Broker, BrokerHandle};
use crate::connection::{self, ConnectionSettings};
use crate::settings::{Settings, TlsSettings};
use crate::transport::TransportBuilder;
use crate::{metrics, Error, Message, SystemEvent};

pub struct Server<N> {
    broker: Broker<N>,
    transports: Vec<TransportBuilder>,
    connection_settings: ConnectionSettings,
}

impl<N> Server<N>
where
    N: Authenticator + Send + 'static,
{
    pub fn from_broker(broker: Broker<N>) -> Self {
        let defaults = Settings::default();
        Self {
            broker,
            transports: Vec::new(),
            connection_settings: ConnectionSettings::new(
                defaults.server().read_timeout(),
                defaults.server().write_timeout(),
                defaults.limits().max_message_size(),
            ),
        }
    }

    /// Wires up the single listener (TCP, or TLS when enabled) and the
    /// per-connection socket limits from the settings.
    pub fn from_settings(broker: Broker<N>, settings: &Settings) -> Result<Self, Error> {
        let mut server = Self::from_broker(broker);
        server.connection_settings = ConnectionSettings::new(
            settings.server().read_timeout(),
            settings.server().write_timeout(),
            settings.limits().max_message_size(),
        );

        let addr = settings.server().addr();
        if settings.tls().enabled() {
            server.tls(&addr, settings.tls())?;
        } else {
            server.tcp(&addr);
        }

        Ok(server)
    }

    pub fn tcp(&mut self, addr: &str) -> &mut Self {
        self.transports.push(TransportBuilder::tcp(addr));
        self
    }

    pub fn tls(&mut self, addr: &str, settings: &TlsSettings) -> Result<&mut Self, Error> {
        let transport = TransportBuilder::tls(addr, settings)?;
        self.transports.push(transport);
        Ok(self)
    }

    pub async fn serve<F>(self, shutdown_signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Unpin,
    {
        let Server {
            broker,
            transports,
            connection_settings,
        } = self;
        let handle = broker.handle();
        let broker_task = tokio::spawn(broker.run());

        let mut incoming_tasks = Vec::new();
        let mut shutdown_handles = Vec::new();
        for transport in transports {
            let (itx, irx) = oneshot::channel::<()>();
            shutdown_handles.push(itx);

            let incoming_task = Box::pin(incoming_task(
                transport,
                handle.clone(),
                irx.map(drop),
                connection_settings.clone(),
            ));
            incoming_tasks.push(incoming_task);
        }

        let incoming_tasks = future::select_all(incoming_tasks);

        // Wait for a shutdown signal or for any accept loop to exit, then
        // stop the remaining accept loops and ask the broker to drain.
        match future::select(shutdown_signal, incoming_tasks).await {
            Either::Left((_, tasks)) => {
                info!("server received shutdown signal");

                info!("shutting down accept loops...");
                send_shutdown(shutdown_handles);

                let (result, _index, unfinished_incoming_tasks) = tasks.await;
                let mut results = vec![result];
                results.extend(future::join_all(unfinished_incoming_tasks).await);

                for e in results.into_iter().filter_map(Result::err) {
                    warn!(message = "failed to shutdown accept loop", error = %e);
                }
            }
            Either::Right(((result, index, unfinished_incoming_tasks), _)) => {
                if let Err(e) = &result {
                    error!(message = "an error occurred in the accept loop", error = %e);
                }

                shutdown_handles.remove(index);
                send_shutdown(shutdown_handles);

                let results = future::join_all(unfinished_incoming_tasks).await;
                for e in results.into_iter().filter_map(Result::err) {
                    warn!(message = "failed to shutdown accept loop", error = %e);
                }
            }
        }

        info!("sending Shutdown message to broker");
        handle.send(Message::System(SystemEvent::Shutdown))?;
        broker_task.await??;

        Ok(())
    }
}

fn send_shutdown<I>(handles: I)
where
    I: IntoIterator<Item = oneshot::Sender<()>>,
{
    for itx in handles {
        if let Err(()) = itx.send(()) {
            warn!(message = "failed to signal an accept loop to stop");
        }
    }
}

async fn incoming_task<F>(
    transport: TransportBuilder,
    handle: BrokerHandle,
    mut shutdown_signal: F,
    connection_settings: ConnectionSettings,
) -> Result<(), Error>
where
    F: Future<Output = ()> + Unpin,
{
    let io = transport.build().await?;
    let addr = io.local_addr()?;

    let span = info_span!("server", listener = %addr);
    let inner_span = span.clone();

    async move {
        let mut incoming = io.incoming();

        info!("Listening on address {}", addr);

        loop {
            match future::select(&mut shutdown_signal, incoming.next()).await {
                Either::Right((Some(Ok(stream)), _)) => {
                    metrics::CONNECTIONS_TOTAL.inc();

                    let peer = match stream.peer_addr() {
                        Ok(peer) => peer,
                        Err(e) => {
                            warn!(message = "dropping connection without peer address", error = %e);
                            continue;
                        }
                    };
                    let certificate = stream.peer_certificate();

                    let broker_handle = handle.clone();
                    let span = inner_span.clone();
                    let settings = connection_settings.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connection::process(
                            stream,
                            peer,
                            certificate,
                            broker_handle,
                            &settings,
                        )
                        .instrument(span)
                        .await
                        {
                            warn!(message = "failed to process connection", error = %e);
                        }
                    });
                }
                Either::Left(_) => {
                    info!("stop signal received, closing listener on {}", addr);
                    break;
                }
                Either::Right((Some(Err(e)), _)) => {
                    warn!(
                        message = "accept loop exiting due to an error",
                        error = %e
                    );
                    break;
                }
                Either::Right((None, _)) => {
                    warn!("accept loop exiting due to no more incoming connections");
                    break;
                }
            }
        }
        Ok(())
    }
    .instrument(span)
    .await
}
