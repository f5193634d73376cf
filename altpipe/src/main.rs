use std::process;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use encoder_engine::EngineConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use altpipe::config::AppConfig;
use altpipe::error::{Error, Result};
use altpipe::job::{GenerationKind, MediaJob, VideoMetadata};
use altpipe::offscreen::Coordinator;
use altpipe::orchestrator::{
    DirectPath, OffscreenPath, Orchestrator, TranscodePath, forward_engine_events,
};
use altpipe::proxy::ProxyClient;
use altpipe::transport::{PortEvent, PortRegistry};
use altpipe::{logging, transport::VttResult};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    /// Generate descriptive alt text.
    AltText,
    /// Generate WEBVTT captions.
    Captions,
}

impl From<Kind> for GenerationKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::AltText => GenerationKind::AltText,
            Kind::Captions => GenerationKind::Captions,
        }
    }
}

/// Prepare one media item and generate alt text or captions for it.
#[derive(Debug, Parser)]
#[command(name = "altpipe", version)]
struct Args {
    /// Media source: http(s) URL, data: URL, or local file path.
    src: String,

    #[arg(long, value_enum, default_value = "alt-text")]
    kind: Kind,

    /// File name reported to the proxy; derived from the source if omitted.
    #[arg(long)]
    file_name: Option<String>,

    /// Declared MIME type; defaults to video/mp4.
    #[arg(long)]
    media_type: Option<String>,

    /// Known clip duration in seconds, skips the probe step.
    #[arg(long)]
    duration: Option<f64>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = logging::init(config.log_dir.as_deref());
    info!(proxy = %config.proxy_url, "starting");

    let client = reqwest::Client::new();
    let cancel = CancellationToken::new();

    let engine_config = EngineConfig {
        ffmpeg_path: config.ffmpeg_path.clone(),
        ..EngineConfig::default()
    };
    let (coordinator, coordinator_events, coordinator_task) =
        Coordinator::spawn(engine_config.clone(), client.clone(), cancel.clone());

    let ports = Arc::new(PortRegistry::new());
    let mut events = ports.connect();
    let _forwarder = forward_engine_events(coordinator_events, ports.clone());

    let paths: Vec<Arc<dyn TranscodePath>> = vec![
        Arc::new(OffscreenPath::new(coordinator.clone())),
        Arc::new(DirectPath::new(engine_config)),
    ];
    let orchestrator = Orchestrator::new(
        client.clone(),
        ProxyClient::new(client, config.proxy_url.clone()),
        ports.clone(),
        paths,
        config.limits.clone(),
        config.job_timeout(),
    );

    let mut job = MediaJob::new(
        args.src.clone(),
        args.file_name
            .unwrap_or_else(|| file_name_from_src(&args.src)),
        args.media_type.unwrap_or_else(|| "video/mp4".to_string()),
        args.kind.into(),
    );
    if let Some(duration) = args.duration {
        job = job.with_metadata(VideoMetadata {
            duration: Some(duration),
            ..VideoMetadata::default()
        });
    }
    let job_id = job.id;

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_job(job).await })
    };

    let mut outcome = Err(Error::other("port closed before a result arrived"));
    while let Some(event) = events.recv().await {
        match event {
            PortEvent::Progress { message, .. } => info!("{message}"),
            PortEvent::Warning { message, .. } => warn!("{message}"),
            PortEvent::EngineStatus { status, error, .. } => {
                debug!(status = %status, ?error, "engine status")
            }
            PortEvent::Error {
                job_id: id, error, ..
            } if id == job_id => {
                outcome = Err(Error::other(error));
                break;
            }
            PortEvent::AltTextResult {
                job_id: id,
                alt_text,
                ..
            } if id == job_id => {
                println!("{alt_text}");
                outcome = Ok(());
                break;
            }
            PortEvent::CaptionResult {
                job_id: id,
                vtt_results,
                ..
            } if id == job_id => {
                print_captions(&vtt_results);
                outcome = Ok(());
                break;
            }
            _ => {}
        }
    }

    runner.await.map_err(|e| Error::other(e.to_string()))?;
    coordinator.shutdown().await;
    cancel.cancel();
    let _ = coordinator_task.await;
    outcome
}

fn print_captions(results: &[VttResult]) {
    for result in results {
        println!("--- {}", result.file_name);
        println!("{}", result.vtt_content);
    }
}

fn file_name_from_src(src: &str) -> String {
    src.rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or("media.mp4")
        .to_string()
}
