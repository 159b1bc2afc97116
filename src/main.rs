use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use config::Config;
use log::info;

use selfcast::egress::hls::HlsPublisher;
use selfcast::encode::EncoderBackend;
use selfcast::http::{generate_random_path, HttpServer, ServerState};
use selfcast::ingress::{FrameSource, SourceEndpoint};
use selfcast::logsink::LogSink;
use selfcast::pipeline::StreamController;
use selfcast::player::PlayerAssets;
use selfcast::settings::Settings;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;
    let settings: Settings = builder.try_deserialize()?;

    let addr: SocketAddr = settings.listen.parse()?;
    let random_path = generate_random_path();
    let publisher = Arc::new(HlsPublisher::new(
        settings.segmenter.window_size,
        settings.segmenter.target_seconds,
    ));
    let log_sink = match &settings.log_forward {
        Some(target) => Some(Arc::new(LogSink::new(target)?)),
        None => None,
    };

    let controller = StreamController::start(
        settings.pipeline_config(),
        create_source(&settings)?,
        backend_factory(&settings),
        publisher.clone(),
        log_sink.clone(),
    )?;

    let state = Arc::new(ServerState {
        random_path: random_path.clone(),
        publisher,
        player: PlayerAssets::load(Path::new(&settings.player_dir))?,
        log_sink,
        port: addr.port(),
        app_title: settings.app_title.clone(),
        end_grace: Duration::from_secs(settings.end_grace_seconds),
    });
    let server = HttpServer::new(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("Player page: http://{}/view/{}", addr, random_path);
    let server_task = tokio::spawn(selfcast::http::listen(listener, server));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, draining the pipeline");
    controller.stop();

    // Keep the final playlist (with ENDLIST) up through the grace period,
    // then let remaining clients see the namespace die.
    tokio::time::sleep(Duration::from_secs(settings.end_grace_seconds)).await;
    server_task.abort();
    info!("Server closed");
    Ok(())
}

fn create_source(settings: &Settings) -> Result<Box<dyn FrameSource>> {
    match settings.source.parse::<SourceEndpoint>()? {
        #[cfg(feature = "test-pattern")]
        SourceEndpoint::TestPattern => {
            use selfcast::fraction::Fraction;
            let fps = Fraction::from((settings.encoder.frame_rate.round() as usize, 1));
            Ok(Box::new(selfcast::ingress::test::TestPatternSource::new(
                settings.encoder.width,
                settings.encoder.height,
                fps,
            )))
        }
        #[cfg(not(feature = "test-pattern"))]
        SourceEndpoint::TestPattern => {
            bail!("source '{}' needs the test-pattern feature", settings.source)
        }
    }
}

/// Backend selection is deferred to the pipeline thread so that a setup
/// failure surfaces on the encoder event stream.
#[cfg(feature = "encoder-openh264")]
fn backend_factory(
    settings: &Settings,
) -> impl FnOnce() -> Result<Box<dyn EncoderBackend>> + Send + 'static {
    let backend = settings.encoder.backend.clone();
    let config = settings.pipeline_config().video;
    move || match backend.as_str() {
        "openh264" => Ok(Box::new(selfcast::encode::openh264::Openh264Backend::new(
            &config,
        )?) as Box<dyn EncoderBackend>),
        other => bail!("Unknown encoder backend '{}'", other),
    }
}

#[cfg(not(feature = "encoder-openh264"))]
fn backend_factory(
    settings: &Settings,
) -> impl FnOnce() -> Result<Box<dyn EncoderBackend>> + Send + 'static {
    let backend = settings.encoder.backend.clone();
    move || -> Result<Box<dyn EncoderBackend>> {
        bail!(
            "Encoder backend '{}' unavailable: built without an encoder feature",
            backend
        )
    }
}
