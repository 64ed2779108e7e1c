use anyhow::{Context, Result};
use clap::Parser;
use handsfree_voice::audio::{
    list_input_devices, AudioBackend, AudioBackendFactory, AudioSource, FileBackend,
};
use handsfree_voice::playback::{completion_channel, CpalSink};
use handsfree_voice::{create_router, AppState, Config, SendMode, SessionEngine, WebSocketConnector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Hands-free voice assistant client
#[derive(Parser)]
#[command(name = "handsfree", version, about)]
struct Args {
    /// Config file (any format the config crate reads; optional)
    #[arg(short, long, default_value = "config/handsfree")]
    config: String,

    /// Voice-turn endpoint, overriding the config
    #[arg(long)]
    url: Option<String>,

    /// How utterances are sent, overriding the config
    #[arg(long, value_enum)]
    mode: Option<SendMode>,

    /// Replay a WAV file instead of using the microphone
    #[arg(long)]
    input: Option<String>,

    /// Serve the local control API
    #[arg(long)]
    http: bool,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in list_input_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut cfg = Config::load(&args.config)?;
    if let Some(url) = args.url {
        cfg.server.url = url;
    }
    if let Some(mode) = args.mode {
        cfg.session.send_mode = mode;
    }
    if args.http {
        cfg.http.enabled = true;
    }

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Voice endpoint: {}", cfg.server.url);

    let session_config = cfg.session_config();
    let backend_config = cfg.backend_config();

    let backend: Box<dyn AudioBackend> = match args.input {
        Some(path) => {
            info!("Replaying {} instead of the microphone", path);
            // Trailing silence lets the last utterance reach its endpoint
            let tail = session_config.endpoint.silence_duration + Duration::from_millis(500);
            Box::new(FileBackend::open(&path, backend_config)?.with_trailing_silence(tail))
        }
        None => AudioBackendFactory::create(AudioSource::Microphone, backend_config)?,
    };

    let (completions_tx, completions_rx) = completion_channel();
    let sink = CpalSink::new(cfg.playback.sample_rate, completions_tx)
        .context("Failed to open audio output")?;

    let (engine, handle) = SessionEngine::new(
        session_config,
        backend,
        Arc::new(WebSocketConnector::new()),
        Box::new(sink),
        completions_rx,
    );
    let engine_task = engine.spawn();

    if cfg.http.enabled {
        let addr = format!("{}:{}", cfg.http.bind, cfg.http.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Control API listening on http://{}", addr);

        let router = create_router(AppState::new(handle.clone()));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("Control API stopped: {}", e);
            }
        });
    }

    // Print transcript and reply changes for terminal use
    let mut updates = handle.subscribe();
    tokio::spawn(async move {
        let mut last = updates.borrow().clone();
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.transcript != last.transcript && !snapshot.transcript.is_empty() {
                println!("you: {}", snapshot.transcript);
            }
            if snapshot.replies_played > last.replies_played && !snapshot.reply_text.is_empty() {
                println!("assistant: {}", snapshot.reply_text);
            }
            if snapshot.last_error != last.last_error {
                if let Some(e) = &snapshot.last_error {
                    warn!("{}", e);
                }
            }
            last = snapshot;
        }
    });

    handle.start().await?;
    info!("Listening. Press Ctrl+C to stop");

    // With the control API the process outlives individual sessions
    let serve_forever = cfg.http.enabled;
    let mut status = handle.subscribe();
    let session_over = async move {
        if serve_forever {
            std::future::pending::<()>().await;
        }
        let _ = status.wait_for(|s| !s.is_recording).await;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Stopping..."),
        _ = session_over => info!("Session ended"),
    }

    handle.stop().await?;
    handle.shutdown().await?;
    if let Err(e) = engine_task.await {
        error!("Session engine panicked: {}", e);
    }

    Ok(())
}
