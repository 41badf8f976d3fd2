//! texconv - texture conversion command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use texconv::cache::{ThumbnailObserver, ThumbnailReady};
use texconv::config::PipelineConfig;
use texconv::descriptor::{DescriptorCatalog, DescriptorStore};
use texconv::job::{FreshnessPolicy, GpuFamily, ResourceKey};
use texconv::pipeline::{Pipeline, PipelineEvent};
use texconv::textures::DdsCodec;

#[derive(Parser)]
#[command(name = "texconv")]
#[command(version)]
#[command(about = "Convert textures for GPU families and render thumbnails")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.config/texconv/config.json)
    #[arg(long, global = true, env = "TEXCONV_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every texture under a directory for the enabled GPU families
    Convert {
        /// Directory containing .tex descriptors
        root: PathBuf,

        /// Only convert for these families (ios, android, tegra, mali, adreno, dx11)
        #[arg(short, long = "family", value_parser = parse_family)]
        families: Vec<GpuFamily>,

        /// When to re-encode: force, stale, missing or skip
        #[arg(short, long, default_value = "stale", value_parser = parse_policy)]
        policy: FreshnessPolicy,
    },

    /// Write PNG thumbnails for every texture under a directory
    Thumbnails {
        /// Directory containing .tex descriptors
        root: PathBuf,

        /// Output directory for the PNG files
        #[arg(short, long)]
        output: PathBuf,

        /// Thumbnail edge length (overrides the config)
        #[arg(short, long)]
        size: Option<u32>,
    },

    /// List texture descriptors and the state of their converted artifacts
    List {
        /// Directory containing .tex descriptors
        root: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn parse_family(s: &str) -> Result<GpuFamily, String> {
    GpuFamily::from_name(s).ok_or_else(|| format!("unknown GPU family '{}'", s))
}

fn parse_policy(s: &str) -> Result<FreshnessPolicy, String> {
    FreshnessPolicy::from_name(s).ok_or_else(|| format!("unknown policy '{}'", s))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "texconv=debug".parse()? } else { "texconv=warn".parse()? }),
            )
            .init();
    }

    let config = PipelineConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Convert { root, families, policy } => convert(config, &root, families, policy),
        Commands::Thumbnails { root, output, size } => thumbnails(config, &root, &output, size),
        Commands::List { root } => list(&root),
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save(cli.config.as_deref())?;
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
    }
}

fn convert(mut config: PipelineConfig, root: &Path, families: Vec<GpuFamily>, policy: FreshnessPolicy) -> Result<()> {
    if !families.is_empty() {
        let mut unique = Vec::new();
        for family in families {
            if !unique.contains(&family) {
                unique.push(family);
            }
        }
        config.families = unique;
    }

    let catalog = DescriptorCatalog::scan(root)?;
    println!("Found {} textures in {}", catalog.len(), root.display());
    let family_names: Vec<&str> = config.families.iter().map(|f| f.name()).collect();
    println!("Families: {}  Policy: {}", family_names.join(", "), policy.name());

    let mut pipeline = Pipeline::new(config, Arc::new(catalog), Arc::new(DdsCodec::new()));
    let queued = pipeline.reconvert_all(policy);
    if queued == 0 {
        println!("Nothing to convert.");
        return Ok(());
    }

    let pb = ProgressBar::new(queued as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] Converting [{bar:40.cyan/blue}] {pos}/{len} | {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let report = pipeline.wait_all(true, &AtomicBool::new(false), |event| {
        if let PipelineEvent::ConvertProgress(progress) = event {
            pb.set_length(progress.total as u64);
            pb.set_position(progress.completed as u64);
            let name = progress
                .current_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            pb.set_message(format!("{} ({})", name, progress.family.name()));
        }
    });
    pb.finish_and_clear();

    println!("{}", report.summary());
    for path in &report.failed {
        println!("  FAILED: {}", path.display());
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} conversions failed", report.failed.len());
    }
    Ok(())
}

fn thumbnails(mut config: PipelineConfig, root: &Path, output: &Path, size: Option<u32>) -> Result<()> {
    if let Some(size) = size {
        config.thumbnail_size = size;
    }
    config.validate()?;

    let catalog = DescriptorCatalog::scan(root)?;
    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {:?}", output))?;

    let keys = catalog.keys();
    let mut pipeline = Pipeline::new(config, Arc::new(catalog), Arc::new(DdsCodec::new()));
    let (observer, rx) = ThumbnailObserver::channel(0);
    for key in &keys {
        pipeline.request_thumbnail(key, observer.clone());
    }
    drop(observer);

    let pb = ProgressBar::new(keys.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] Loading [{bar:40.cyan/blue}] {pos}/{len}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );
    pipeline.wait_all(true, &AtomicBool::new(false), |event| {
        if let PipelineEvent::ThumbnailLoaded { .. } = event {
            pb.inc(1);
        }
    });
    pb.finish_and_clear();

    let ready: Vec<ThumbnailReady> = rx.try_iter().collect();
    let written: Vec<Result<usize>> = ready
        .par_iter()
        .map(|thumb| write_thumbnail(thumb, root, output))
        .collect();

    let mut files = 0;
    let mut failed = 0;
    for result in written {
        match result {
            Ok(count) => files += count,
            Err(e) => {
                eprintln!("  {:#}", e);
                failed += 1;
            }
        }
    }
    println!("Wrote {} thumbnails to {} ({} failed)", files, output.display(), failed);
    Ok(())
}

/// Output name for a descriptor: its path below `root` without extension,
/// directories joined with `_` so equal stems in different folders don't collide
fn thumbnail_stem(key: &ResourceKey, root: &Path) -> String {
    let path = key.to_path_buf();
    let relative = path.strip_prefix(root).unwrap_or(&path).with_extension("");
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        "texture".to_string()
    } else {
        parts.join("_")
    }
}

fn write_thumbnail(thumb: &ThumbnailReady, root: &Path, output: &Path) -> Result<usize> {
    if thumb.payload.is_stub() {
        anyhow::bail!("Could not load {}", thumb.key);
    }

    let stem = thumbnail_stem(&thumb.key, root);

    let faces: Vec<_> = thumb.payload.images.iter().flatten().collect();
    for (index, face) in faces.iter().enumerate() {
        let name = if faces.len() > 1 {
            format!("{}_{}.png", stem, index)
        } else {
            format!("{}.png", stem)
        };
        let path = output.join(name);
        face.save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(faces.len())
}

fn list(root: &Path) -> Result<()> {
    let catalog = DescriptorCatalog::scan(root)?;

    for descriptor in catalog.iter() {
        let kind = if descriptor.is_cube_map() { "cube" } else { "2d" };
        println!("{} [{}]", descriptor.path.display(), kind);

        for family in GpuFamily::ALL {
            let Some(format) = descriptor.format_for(family) else {
                continue;
            };
            let state = if descriptor.is_converted_actual(family) {
                "up to date"
            } else if descriptor.converted_path(family).exists() {
                "stale"
            } else {
                "missing"
            };
            println!("  {:<8} {:<5} {}", family.name(), format.name(), state);
        }
    }

    eprintln!("\nTotal: {} textures", catalog.len());
    Ok(())
}
