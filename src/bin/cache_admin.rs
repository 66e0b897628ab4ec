#![forbid(unsafe_code)]

//! Offline cache maintenance: print per-category usage or purge artifacts
//! without going through the HTTP API.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use ytbshow_tools::cache::{ArtifactCategory, CacheStats, DiskCache, PurgeTarget};
use ytbshow_tools::config::{RuntimeOverrides, resolve_runtime_settings};
use ytbshow_tools::formats::format_bytes;
use ytbshow_tools::security::ensure_not_root;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and purge the ytbshow artifact cache.")]
struct Cli {
    #[arg(long = "cache-root", help = "Cache directory (defaults to YTBSHOW_CACHE_ROOT)")]
    cache_root: Option<PathBuf>,
    #[arg(long = "env-file", help = "Env file to read settings from (default: .env)")]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print item count and size per category.
    Stats,
    /// Delete cached artifacts.
    Purge {
        #[arg(
            long = "type",
            value_parser = parse_target,
            help = "What to delete: all, videos, frames or audio"
        )]
        target: PurgeTarget,
    },
}

fn parse_target(value: &str) -> std::result::Result<PurgeTarget, String> {
    value.parse::<PurgeTarget>().map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    ensure_not_root("cache_admin")?;

    let settings = resolve_runtime_settings(RuntimeOverrides {
        cache_root: cli.cache_root,
        env_path: cli.env_file,
        ..RuntimeOverrides::default()
    })?;
    let cache = DiskCache::new(&settings.cache_root);

    match cli.command {
        Command::Stats => {
            let stats = cache
                .stats()
                .await
                .with_context(|| format!("reading cache at {}", settings.cache_root.display()))?;
            print!("{}", render_stats(&stats));
        }
        Command::Purge { target } => {
            let report = cache
                .purge(target)
                .await
                .with_context(|| format!("purging cache at {}", settings.cache_root.display()))?;
            println!("{}", report.summary());
        }
    }
    Ok(())
}

fn render_stats(stats: &CacheStats) -> String {
    let mut out = String::new();
    for category in ArtifactCategory::ALL {
        let entry = match category {
            ArtifactCategory::Videos => stats.videos,
            ArtifactCategory::Frames => stats.frames,
            ArtifactCategory::Audio => stats.audio,
        };
        out.push_str(&format!(
            "{:<8} {:>6} item(s)  {}\n",
            category.dir_name(),
            entry.count,
            format_bytes(entry.size)
        ));
    }
    out.push_str(&format!("{:<8} {:>15}  {}\n", "total", "", format_bytes(stats.total_size())));
    out
}
