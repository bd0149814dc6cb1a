use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use ingest::{
    config::CompositionCorrection, EndReason, IngestConfig, Player, SessionEvent,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Correction {
    Keep,
    AdaptiveOnly,
    AllTransports,
}

impl From<Correction> for CompositionCorrection {
    fn from(value: Correction) -> Self {
        match value {
            Correction::Keep => CompositionCorrection::Keep,
            Correction::AdaptiveOnly => CompositionCorrection::AdaptiveOnly,
            Correction::AllTransports => CompositionCorrection::AllTransports,
        }
    }
}

/// Plays a stream locator and writes it as fragmented MP4.
#[derive(Parser, Debug)]
#[clap(name = "ingest", version)]
struct IngestArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// TOML file with ingest settings. Flags override its values.
    #[clap(short, long, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Output file. Writes to stdout when omitted or `-`.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Verify TLS certificates of platform APIs and rtmps/rtsps servers
    #[clap(long, env = "INGEST_STRICT_TLS")]
    strict_tls: bool,

    #[clap(long, env = "INGEST_USER_AGENT")]
    user_agent: Option<String>,

    /// Fragment length of audio-only streams, in milliseconds
    #[clap(long)]
    fragment_duration: Option<u64>,

    /// Which transports get their composition offsets zeroed
    #[clap(long, value_enum)]
    composition_correction: Option<Correction>,

    /// Stop after writing this many fragments
    #[clap(long)]
    max_fragments: Option<usize>,

    /// File path or url: file, http(s), hls, rtmp(s), srt, rtsp(s), or a
    /// Chzzk/YouTube page
    locator: String,
}

impl IngestArgs {
    fn ingest_config(&self) -> anyhow::Result<IngestConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?
            }
            None => IngestConfig::default(),
        };

        if self.strict_tls {
            config.strict_tls = true;
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = Some(user_agent.clone());
        }
        if let Some(ms) = self.fragment_duration {
            config.packager.fragment_duration_ms = ms;
        }
        if let Some(correction) = self.composition_correction {
            config.packager.composition_correction = correction.into();
        }
        Ok(config)
    }

    async fn sink(&self) -> anyhow::Result<Box<dyn AsyncWrite + Unpin + Send>> {
        match &self.output {
            Some(path) if path.as_os_str() != "-" => {
                let file = tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("create {}", path.display()))?;
                log::info!("Writing to {}", path.display());
                Ok(Box::new(file))
            }
            _ => Ok(Box::new(tokio::io::stdout())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = IngestArgs::parse();
    pretty_env_logger::formatted_builder()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let config = args.ingest_config()?;
    let mut sink = args.sink().await?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut player = Player::with_config(config, events_tx);
    let session = player.play(&args.locator).await;

    let mut fragments = 0;
    let reason = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping");
                player.stop().await;
                continue;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            bail!("session {session} ended without a result");
        };

        match event {
            SessionEvent::Init { codecs, init, .. } => {
                log::info!("{} stream(s): {}", codecs.len(), init.mime);
                sink.write_all(&init.bytes).await?;
            }
            SessionEvent::Fragment { fragment, .. } => {
                log::debug!(
                    "Fragment #{} at {:?}, {:?}, {} bytes",
                    fragment.sequence,
                    fragment.decode_time,
                    fragment.duration,
                    fragment.bytes.len()
                );
                sink.write_all(&fragment.bytes).await?;
                fragments += 1;
                if args.max_fragments.is_some_and(|max| fragments >= max) {
                    log::info!("Wrote {fragments} fragments, stopping");
                    player.stop().await;
                }
            }
            SessionEvent::Ended { reason, .. } => break reason,
        }
    };

    sink.flush().await?;
    player.stop().await;
    match reason {
        EndReason::Finished => log::info!("Stream finished after {fragments} fragments"),
        EndReason::Cancelled => log::info!("Stopped after {fragments} fragments"),
        EndReason::Failed(e) => bail!("{e}"),
    }
    Ok(())
}
