use anyhow::Context;
use clap::{Parser, Subcommand};
use snappull::{manifest, DownloadController, FsStorage, MediaLibrary, PipelineConfig, RunState};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "snappull")]
#[command(about = "Download exported Snapchat memories with integrity checks", long_about = None)]
#[command(version)]
struct Args {
    /// Directory holding downloaded media
    #[arg(short, long, default_value = "snappull-media", global = true)]
    output: PathBuf,

    /// Library index file (defaults to <output>/library.json)
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every entry of an export manifest
    Pull {
        /// Path to the export manifest (memories_history.json)
        manifest: PathBuf,

        /// Time budget per download attempt
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Bodies of this size or smaller are treated as failed downloads
        #[arg(long, default_value_t = 1000)]
        min_bytes: usize,

        /// ffmpeg binary used to validate videos
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: String,
    },
    /// Remove library items whose files are missing or truncated
    Sweep,
    /// Show library size and storage usage
    Usage,
    /// Move items into the vault
    Archive {
        ids: Vec<Uuid>,
    },
    /// Move items out of the vault
    Unarchive {
        ids: Vec<Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("snappull={}", log_level))
        .init();

    let library_path = args
        .library
        .clone()
        .unwrap_or_else(|| args.output.join("library.json"));
    let mut library = MediaLibrary::open(&library_path, FsStorage::new(&args.output))
        .await
        .with_context(|| format!("Failed to open library {}", library_path.display()))?;

    match args.command {
        Command::Pull {
            manifest,
            timeout,
            min_bytes,
            ffmpeg,
        } => {
            let config = PipelineConfig {
                fetch_timeout: timeout,
                min_payload_bytes: min_bytes,
                media_dir: args.output.clone(),
                scratch_dir: args.output.join(".scratch"),
                ffmpeg_path: ffmpeg,
                ..PipelineConfig::default()
            };
            pull(config, &manifest, &mut library).await
        }
        Command::Sweep => {
            let removed = library.sweep_broken().await?;
            info!("🧹 Removed {} broken items", removed.len());
            for item in removed {
                println!("{}\t{}\t{}", item.id, item.media_kind, item.storage_ref);
            }
            Ok(())
        }
        Command::Usage => {
            let used = library.used_storage().await;
            println!(
                "{} items ({} in vault), {:.1} MiB on disk",
                library.items().len(),
                library.archived().count(),
                used as f64 / 1_048_576.0
            );
            Ok(())
        }
        Command::Archive { ids } => {
            let changed = library.set_archived(&ids, true).await?;
            info!("🔒 Moved {} items to the vault", changed);
            Ok(())
        }
        Command::Unarchive { ids } => {
            let changed = library.set_archived(&ids, false).await?;
            info!("🔓 Moved {} items out of the vault", changed);
            Ok(())
        }
    }
}

async fn pull(
    config: PipelineConfig,
    manifest_path: &Path,
    library: &mut MediaLibrary,
) -> anyhow::Result<()> {
    let entries = manifest::parse_file(manifest_path).await;
    if entries.is_empty() {
        info!("Nothing to download in {}", manifest_path.display());
        return Ok(());
    }

    info!("🚀 SnapPull - {} entries", entries.len());
    info!("Output directory: {:?}", config.media_dir);

    let controller = DownloadController::from_config(config)?;
    let mut feed = controller.subscribe();
    let completion = controller.start(entries).await;

    let pb = indicatif::ProgressBar::new(controller.progress().total as u64);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")?
            .progress_chars("█▓▒░ "),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let progress = {
        let pb = pb.clone();
        tokio::spawn(async move {
            while feed.changed().await.is_ok() {
                let progress = *feed.borrow_and_update();
                pb.set_position(progress.processed() as u64);
                pb.set_message(format!("| ✅ {} ❌ {}", progress.accepted, progress.failed));
                if progress.state == RunState::Completed {
                    break;
                }
            }
        })
    };

    let wait = completion.wait();
    tokio::pin!(wait);
    let report = tokio::select! {
        report = &mut wait => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, keeping what was saved so far");
            controller.stop().await;
            wait.await?
        }
    };
    // Closes the progress feed so the progress task always exits
    drop(controller);
    let _ = progress.await;

    pb.finish_with_message(format!(
        "| ✅ {} saved, ❌ {} failed",
        report.accepted.len(),
        report.failed.len()
    ));

    for failed in &report.failed {
        println!(
            "{}\t{}\t{}",
            failed.entry.captured_at, failed.kind, failed.detail
        );
    }

    library.merge(report.accepted).await?;
    info!(
        "💾 Library now holds {} items ({:.1} MiB)",
        library.items().len(),
        library.used_storage().await as f64 / 1_048_576.0
    );
    Ok(())
}
