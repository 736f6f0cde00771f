//! novond — overlay live-stream broadcaster daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use novon_core::config::NovonConfig;
use novon_services::{
    ClientBalancer, DonationLedger, DonationValidator, FfmpegTranscoder, JsonRpcLedger,
    LogScanSource, Overlay, RetryPolicy, StreamEvent, StreamSettings, Streamer,
};

mod ingest;
mod overlay;

use ingest::SegmentWatcher;
use overlay::UdpOverlay;

/// How long startup waits for the overlay pool to connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    match NovonConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = NovonConfig::load().context("failed to load config")?;
    let wallet = config
        .identity
        .wallet_address()
        .context("identity.seed in the config file is missing or invalid")?;
    tracing::info!(%wallet, "identity loaded");

    // Overlay
    let overlay = Arc::new(
        UdpOverlay::bind(&config.network.listen_addr, config.network.pool_size, wallet)
            .await
            .with_context(|| format!("failed to bind {}", config.network.listen_addr))?,
    );
    let balancer = Arc::new(ClientBalancer::new(
        overlay.clients(),
        config.network.viewer_sub_clients,
    ));
    let connected = balancer.wait_ready(CONNECT_TIMEOUT).await;
    if connected == 0 {
        anyhow::bail!("no overlay client connected within {}s", CONNECT_TIMEOUT.as_secs());
    }
    tracing::info!(
        address = %overlay.address(),
        connected,
        pool = balancer.pool_size(),
        "overlay ready"
    );

    // Donations
    let d = &config.donation;
    let timeout = Duration::from_millis(d.attempt_timeout_ms);
    let rpc = JsonRpcLedger::new(d.rpc_url.clone(), timeout).context("failed to build ledger client")?;
    let validator = DonationValidator::new(
        Arc::new(DonationLedger::new()),
        Arc::new(rpc),
        Arc::new(overlay.wallet_codec()),
        overlay.wallet_address(),
    )
    .with_policies(
        d.allow_mempool,
        RetryPolicy {
            attempts: d.mempool_attempts,
            spacing: Duration::from_millis(d.mempool_spacing_ms),
            timeout,
        },
        RetryPolicy {
            attempts: d.confirm_attempts,
            spacing: Duration::from_millis(d.confirm_spacing_ms),
            timeout,
        },
    );
    tracing::info!(rpc = %d.rpc_url, mempool = d.allow_mempool, "donation validation ready");

    // Transcoding
    let transcoder = FfmpegTranscoder::default();
    if !transcoder.is_installed().await {
        tracing::warn!("ffmpeg not found, viewers will only receive source quality");
    }

    let streamer = Streamer::new(
        StreamSettings::from_config(&config),
        overlay.clone(),
        balancer,
        Arc::new(validator),
        Arc::new(transcoder),
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let overlay_rx_task = tokio::spawn(overlay::receive_loop(
        overlay.primary_socket(),
        inbound_tx,
        shutdown_tx.subscribe(),
    ));

    let receiver_task = tokio::spawn(streamer.clone().run_receiver(inbound_rx, shutdown_tx.subscribe()));
    let sweeper_task = tokio::spawn(streamer.clone().run_sweeper(shutdown_tx.subscribe()));
    let subscription_task = tokio::spawn(streamer.clone().maintain_subscription(shutdown_tx.subscribe()));
    let clients_task = tokio::spawn(streamer.clone().report_clients(shutdown_tx.subscribe()));
    let donation_task = tokio::spawn(streamer.clone().prune_donation_ids(shutdown_tx.subscribe()));

    let segment_task = tokio::spawn(
        SegmentWatcher::new(
            config.stream.segment_dir.clone(),
            Duration::from_millis(200),
            Duration::from_millis(250),
            shutdown_tx.subscribe(),
        )
        .run(streamer.clone()),
    );

    // Keeps the ingest server alive until main returns.
    let _ingest_child = if config.stream.ingest_command.is_empty() {
        tracing::info!("no ingest command, expecting segments from an external writer");
        None
    } else {
        let (lines_tx, lines_rx) = mpsc::channel(256);
        let child = ingest::spawn_ingest(&config.stream.ingest_command, lines_tx)?;
        tokio::spawn(
            streamer
                .clone()
                .run_ingest_events(LogScanSource::new(lines_rx), shutdown_tx.subscribe()),
        );
        Some(child)
    };

    let events_printer = {
        let mut events = streamer.subscribe_events();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "event printer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                match event {
                    StreamEvent::Publish {
                        segment_id,
                        viewers,
                        segment_bytes,
                        chunks,
                    } => tracing::info!(segment_id, viewers, segment_bytes, chunks, "segment published"),
                    StreamEvent::Clients { connected, pool } if connected < pool => {
                        tracing::warn!(connected, pool, "overlay clients disconnected")
                    }
                    StreamEvent::Clients { .. } => {}
                    StreamEvent::Ingest(ev) => tracing::debug!(?ev, "ingest event"),
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()    => tracing::info!("shutting down"),
        r = overlay_rx_task       => tracing::error!("overlay receiver exited: {:?}", r),
        r = receiver_task         => tracing::error!("receiver exited: {:?}", r),
        r = sweeper_task          => tracing::error!("viewer sweeper exited: {:?}", r),
        r = subscription_task     => tracing::error!("subscription task exited: {:?}", r),
        r = clients_task          => tracing::error!("client reporter exited: {:?}", r),
        r = donation_task         => tracing::error!("donation id pruner exited: {:?}", r),
        r = segment_task          => tracing::error!("segment watcher exited: {:?}", r),
        r = events_printer        => tracing::error!("event printer exited: {:?}", r),
    }

    Ok(())
}
