use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use peerlink_core::config::AppConfig;
use peerlink_core::media::{MediaConstraints, SyntheticMediaSource};
use peerlink_core::negotiation::NegotiationState;
use peerlink_core::session::{SessionOrchestrator, SessionSettings};
use peerlink_core::transport::webrtc::WebRtcTransportFactory;
use peerlink_core::{metrics, telemetry};
use signal_bus::LocalBus;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(about = "WebRTC negotiation and candidate-pair monitoring harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Negotiate two in-process peers against each other
    Loopback(RunArgs),
    /// Run two endpoints over an in-process signaling channel
    Channel {
        #[command(flatten)]
        run: RunArgs,

        /// Signaling channel name (defaults to PEERLINK_CHANNEL)
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// ICE template, e.g. `openrelay-turn-udp` (defaults to PEERLINK_ICE_TEMPLATE)
    #[arg(long)]
    template: Option<String>,

    /// Media preset: `a`, `v` or `av` (defaults to PEERLINK_MEDIA)
    #[arg(long)]
    media: Option<String>,

    /// How long to keep the call up once stable
    #[arg(long, default_value_t = 5)]
    hold_secs: u64,

    /// Seconds to wait for negotiation to settle
    #[arg(long, default_value_t = 20)]
    connect_secs: u64,

    /// Print the metrics exposition on exit
    #[arg(long)]
    metrics: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(template) = &self.template {
            config.ice_template = Some(template.clone());
        }
        if let Some(media) = &self.media {
            config.media_preset = media.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    telemetry::init_tracing(&config.log_filter);

    match cli.command {
        Command::Loopback(run) => {
            run.apply(&mut config);
            loopback(&config, &run).await
        }
        Command::Channel { run, name } => {
            run.apply(&mut config);
            if let Some(name) = name {
                config.channel = name;
            }
            channel(&config, &run).await
        }
    }
}

async fn settings(config: &AppConfig, loopback: bool) -> SessionSettings {
    SessionSettings {
        transport: config.transport_config().await,
        policy: config.prune_policy.proposal_policy(loopback),
    }
}

async fn loopback(config: &AppConfig, run: &RunArgs) -> Result<()> {
    let factory = Arc::new(WebRtcTransportFactory::new());
    let session = SessionOrchestrator::loopback(factory, settings(config, true).await);
    let source = SyntheticMediaSource::default();

    session
        .start(&source, constraints(config))
        .await
        .context("failed to start loopback session")?;
    session.call().await.context("call failed")?;

    let settle = Duration::from_secs(run.connect_secs);
    for endpoint in session.endpoints() {
        if !session.wait_for_state(&endpoint, NegotiationState::Stable, settle).await {
            session.shutdown().await;
            bail!("{endpoint} did not reach stable within {settle:?}");
        }
    }
    info!("loopback negotiated");

    hold(run).await;
    report(&session, run)?;
    session.hangup().await?;
    session.shutdown().await;
    Ok(())
}

async fn channel(config: &AppConfig, run: &RunArgs) -> Result<()> {
    let bus = Arc::new(LocalBus::new());
    let factory = Arc::new(WebRtcTransportFactory::new());
    let settings = settings(config, false).await;
    let source = SyntheticMediaSource::default();

    // Bob joins after alice is up, so his `ready` is what prompts her offer.
    let alice = SessionOrchestrator::channel(factory.clone(), settings.clone(), bus.clone(), &config.channel, "alice");
    alice.start(&source, constraints(config)).await.context("alice failed to start")?;
    let bob = SessionOrchestrator::channel(factory, settings, bus, &config.channel, "bob");
    bob.start(&source, constraints(config)).await.context("bob failed to start")?;

    let settle = Duration::from_secs(run.connect_secs);
    for (name, side) in [("alice", &alice), ("bob", &bob)] {
        if !side.wait_for_state(name, NegotiationState::Stable, settle).await {
            alice.shutdown().await;
            bob.shutdown().await;
            bail!("{name} did not reach stable within {settle:?}");
        }
    }
    info!(channel = %config.channel, "channel negotiated");

    hold(run).await;
    report(&alice, run)?;
    report(&bob, run)?;
    alice.hangup().await?;
    if !bob.wait_for_state("bob", NegotiationState::Closed, Duration::from_secs(5)).await {
        warn!("bob did not observe the hangup");
    }
    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

fn constraints(config: &AppConfig) -> MediaConstraints {
    config.media_constraints()
}

async fn hold(run: &RunArgs) {
    if run.hold_secs == 0 {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(run.hold_secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
}

fn report(session: &SessionOrchestrator, run: &RunArgs) -> Result<()> {
    for monitor in session.monitors() {
        let snapshot = serde_json::to_string_pretty(&monitor.snapshot()).context("encode snapshot")?;
        println!("{snapshot}");
    }
    if run.metrics {
        println!("{}", String::from_utf8_lossy(&metrics::gather()));
    }
    Ok(())
}
