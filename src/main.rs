use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_voice::{
    http, AppState, AudioBackendFactory, AudioSink, AudioSource, BridgeOptions, BridgeService,
    Config, PacedSink, ProviderKind, SessionNotice, SessionOptions, VoiceSession, WavFileSink,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "loqa-voice", version, about = "Real-time voice conversation pipeline")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(long, global = true, default_value = "config/loqa-voice")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the streaming bridge
    Serve,

    /// Stream a WAV file to the bridge as one spoken turn and play the reply
    Talk {
        /// 16-bit PCM WAV used as the capture device
        #[arg(long)]
        input: PathBuf,

        /// Write played audio here instead of pacing it in real time
        #[arg(long)]
        output: Option<PathBuf>,

        /// Bridge conversation URL (overrides client.url)
        #[arg(long)]
        url: Option<String>,

        /// Quiet period after the reply before exiting, in seconds
        #[arg(long, default_value_t = 2)]
        linger_secs: u64,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loqa_voice=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;
    info!("Loqa Voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Talk {
            input,
            output,
            url,
            linger_secs,
        } => talk(cfg, input, output, url, Duration::from_secs(linger_secs)).await,
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let kind: ProviderKind = cfg.upstream.kind.parse()?;
    let provider = kind.build(&cfg.upstream, cfg.audio.sample_rate)?;
    let bridge = BridgeService::new(provider, BridgeOptions::from(&cfg));

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tokio::select! {
        result = http::serve(listener, AppState::new(bridge)) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn talk(
    cfg: Config,
    input: PathBuf,
    output: Option<PathBuf>,
    url: Option<String>,
    linger: Duration,
) -> Result<()> {
    let mut options = SessionOptions::from_config(&cfg);
    if let Some(url) = url {
        options.connection.url = url;
    }

    let (backend, _) = AudioBackendFactory::create(AudioSource::File(input), options.audio.clone())
        .context("Failed to create audio backend")?;
    let sink: Box<dyn AudioSink> = match output {
        Some(path) => Box::new(WavFileSink::new(path)),
        None => Box::new(PacedSink),
    };

    let session = VoiceSession::websocket(options, backend, sink);
    let mut notices = session
        .take_notices()
        .context("Session notices already taken")?;
    session.start().await?;

    let mut answered = false;
    let mut quiet_since: Option<tokio::time::Instant> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(SessionNotice::TurnFinalized(turn)) => {
                    let marker = if turn.interrupted { " (interrupted)" } else { "" };
                    println!("{:?}: {}{}", turn.role, turn.content, marker);
                    if turn.role == loqa_voice::protocol::Role::Assistant {
                        answered = true;
                    }
                }
                Some(SessionNotice::BridgeError(message)) => {
                    warn!("Bridge error: {}", message);
                    answered = true;
                }
                Some(SessionNotice::Terminal(err)) => {
                    error!("{}", err);
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let idle = session.playback().is_empty() && !session.playback().is_speaking();
                match (answered && idle, quiet_since) {
                    (true, None) => quiet_since = Some(tokio::time::Instant::now()),
                    (true, Some(since)) if since.elapsed() >= linger => break,
                    (false, _) => quiet_since = None,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let snapshot = session.stop().await;
    info!(
        "Session {} finished: {} turns, {} frames sent, {} dropped, {} played",
        snapshot.session_id,
        snapshot.turns.len(),
        snapshot.recorder.frames_sent,
        snapshot.recorder.frames_dropped,
        snapshot.frames_played
    );
    drop(session);

    Ok(())
}
