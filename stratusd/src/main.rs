use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{crate_description, crate_name, crate_version, App, Arg};
use tracing::{error, info};

use stratus_broker::auth::PasswordFileAuthenticator;
use stratus_broker::settings::BrokerConfig;
use stratus_broker::{store, BrokerBuilder, Server, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = create_app().get_matches();
    let config_path = PathBuf::from(
        matches
            .value_of("config")
            .expect("config flag has a default"),
    );

    let settings = Settings::from_file(&config_path).with_context(|| {
        format!(
            "unable to load configuration from {}",
            config_path.display()
        )
    })?;

    stratusd::tracing::init(settings.logging());

    info!("starting {} {}...", crate_name!(), crate_version!());

    let store = store::open(settings.storage()).context("unable to initialize the store")?;
    let authenticator = PasswordFileAuthenticator::from_settings(settings.auth())
        .context("unable to initialize authentication")?;

    let broker = BrokerBuilder::default()
        .with_authenticator(authenticator)
        .with_store(store)
        .with_config(BrokerConfig::from(&settings))
        .build();

    if settings.metrics().enabled() {
        stratus_broker::metrics::init();

        let metrics = settings.metrics().clone();
        info!(
            "metrics endpoint listening on port {} at {}",
            metrics.port(),
            metrics.path()
        );
        tokio::spawn(async move {
            if let Err(e) = stratusd::metrics::serve(metrics).await {
                error!(message = "metrics endpoint failed", error = %e);
            }
        });
    }

    let server =
        Server::from_settings(broker, &settings).context("unable to initialize server")?;

    let shutdown = Box::pin(stratusd::shutdown::shutdown());
    server.serve(shutdown).await.context("server failed")?;

    info!("exiting... goodbye");
    Ok(())
}

fn create_app() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Sets a custom config file")
                .takes_value(true)
                .default_value("config/config.yaml"),
        )
}
