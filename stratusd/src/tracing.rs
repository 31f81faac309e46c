use std::fs::OpenOptions;
use std::sync::Arc;
use std::{env, io};

use tracing_log::LogTracer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use stratus_broker::settings::LoggingSettings;

/// Installs the global tracing subscriber according to the `logging` config
/// section. `RUST_LOG` overrides the configured level when set.
pub fn init(settings: &LoggingSettings) {
    let directives = env::var(EnvFilter::DEFAULT_ENV)
        .unwrap_or_else(|_| settings.level().to_string());

    let writer = match settings.output() {
        "stdout" => BoxMakeWriter::new(io::stdout),
        "stderr" => BoxMakeWriter::new(io::stderr),
        path => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => BoxMakeWriter::new(Arc::new(file)),
            Err(e) => {
                eprintln!("unable to open log file {}: {}; logging to stdout", path, e);
                BoxMakeWriter::new(io::stdout)
            }
        },
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(directives))
        .with_writer(writer);

    if settings.format() == "json" {
        let _ = tracing::subscriber::set_global_default(builder.json().finish());
    } else {
        let _ = tracing::subscriber::set_global_default(builder.finish());
    }

    let _ = LogTracer::init();
}
