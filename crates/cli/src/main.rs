use std::{fmt::Write, time::Duration};

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use tracing::info;

use bit_swarm::{config::Config, file, swarm::SwarmCoordinator};

mod args;

fn init_tracing() {
    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = args::Args::parse();
    init_tracing();

    let meta = file::from_filename(&args.torrent)
        .with_context(|| format!("loading {}", args.torrent.display()))?;
    let total_size = meta.total_size;

    let config = Config {
        download_dir: args.output,
        listen_port: args.port,
        peer_limit: args.peers,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        verify_info_hash: !args.no_verify_info_hash,
        ..Config::default()
    };

    let coordinator = SwarmCoordinator::new(meta, config);
    let progress = coordinator.progress();

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}][{msg}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec},{eta})",
        )?
        .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("#>-"),
    );

    let bar = pb.clone();
    let reporter = tokio::spawn(async move {
        while let Ok(update) = progress.recv_async().await {
            bar.set_position(update.bytes_written);
            bar.set_message(format!("{}/{}", update.completed, update.total));
        }
    });

    let download = tokio::spawn(coordinator.clone().run());
    tokio::select! {
        r = download => {
            r.context("download task panicked")??;
            pb.finish_with_message("done");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            coordinator.shutdown();
            pb.abandon();
        }
    }
    reporter.abort();
    Ok(())
}
