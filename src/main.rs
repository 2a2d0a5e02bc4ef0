use std::path::PathBuf;
use std::process::ExitCode;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use tilekiln::bulk::{self, BatchReport, BulkRunner, ItemOutcome, RangeSummary};
use tilekiln::config::Config;
use tilekiln::error::{KilnError, Result};
use tilekiln::generator::layer_queries;
use tilekiln::serving::ServingMode;
use tilekiln::startup::{
    build_app, build_service, connect_generator, init_logging, load_catalog, resolve_config_path,
};
use tilekiln::storage::{self, ZoomScope};
use tilekiln::tile::TileCoordinate;
use tilekiln::tileset::TilesetConfig;

#[derive(Parser)]
#[command(name = "tilekiln")]
#[command(about = "Generate, store and serve vector tiles from PostGIS", version)]
struct Cli {
    /// Process config (TOML). Defaults to $TILEKILN_CONFIG, then ./tilekiln.toml.
    #[arg(long, global = true)]
    settings: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve tiles over HTTP
    Serve {
        #[arg(value_enum)]
        mode: ModeArg,
        /// Tileset YAML file; repeat to serve several tilesets
        #[arg(long = "config", required = true)]
        configs: Vec<PathBuf>,
        #[arg(long)]
        bind_host: Option<String>,
        #[arg(long)]
        bind_port: Option<u16>,
        /// Public URL prefix used in TileJSON tile URLs
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Generate tiles into storage
    #[command(subcommand)]
    Generate(GenerateCommand),
    /// Manage tile storage
    #[command(subcommand)]
    Storage(StorageCommand),
    /// Inspect a tileset config
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Generate every tile on request, no storage
    Dev,
    /// Serve from storage, generating and storing misses
    Live,
    /// Serve from storage only
    Static,
}

impl From<ModeArg> for ServingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Dev => ServingMode::Dev,
            ModeArg::Live => ServingMode::Live,
            ModeArg::Static => ServingMode::Static,
        }
    }
}

#[derive(Args)]
struct TilesetArg {
    /// Tileset YAML file
    #[arg(long)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum GenerateCommand {
    /// Generate the z/x/y tiles listed on stdin, one per line
    Tiles {
        #[command(flatten)]
        tileset: TilesetArg,
        /// Only generate these layers
        #[arg(long = "layer")]
        layers: Vec<String>,
    },
    /// Generate every tile in a zoom range
    Zooms {
        #[command(flatten)]
        tileset: TilesetArg,
        #[arg(long)]
        min_zoom: u8,
        #[arg(long)]
        max_zoom: u8,
        #[arg(long = "layer")]
        layers: Vec<String>,
    },
}

#[derive(Subcommand)]
enum StorageCommand {
    /// Create storage for a tileset
    Init {
        #[command(flatten)]
        tileset: TilesetArg,
    },
    /// Drop a tileset's storage and metadata
    Destroy {
        #[arg(long)]
        id: String,
    },
    /// Delete all tiles of a tileset, or of one zoom
    Delete {
        #[arg(long)]
        id: String,
        #[arg(long)]
        zoom: Option<u8>,
    },
    /// Delete the z/x/y tiles listed on stdin, one per line
    Tiledelete {
        #[arg(long)]
        id: String,
    },
    /// List registered tilesets with per-zoom tile counts
    List,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate a tileset config
    Test {
        #[command(flatten)]
        tileset: TilesetArg,
    },
    /// Print the SQL run for one tile
    Sql {
        #[command(flatten)]
        tileset: TilesetArg,
        #[arg(long)]
        layer: Option<String>,
        #[arg(long)]
        zoom: u32,
        #[arg(short = 'x')]
        x: u32,
        #[arg(short = 'y')]
        y: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Priority: --settings > TILEKILN_CONFIG > ./tilekiln.toml > defaults
    let path = cli.settings.clone().or_else(resolve_config_path);
    let config = match Config::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return exit_code(&e);
        }
    };
    init_logging(&config);

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            exit_code(&e)
        }
    }
}

/// Broken tileset or process config exits 2, everything else 1.
fn exit_code(err: &KilnError) -> ExitCode {
    if err.is_config_error() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

async fn run(command: Command, mut config: Config) -> Result<ExitCode> {
    match command {
        Command::Serve {
            mode,
            configs,
            bind_host,
            bind_port,
            base_url,
        } => {
            if let Some(host) = bind_host {
                config.server.host = host;
            }
            if let Some(port) = bind_port {
                config.server.port = port;
            }
            if base_url.is_some() {
                config.server.base_url = base_url;
            }
            serve(config, mode.into(), &configs).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Generate(cmd) => generate(cmd, config).await,
        Command::Storage(cmd) => storage_command(cmd, config).await,
        Command::Config(cmd) => config_command(cmd),
    }
}

async fn serve(config: Config, mode: ServingMode, tilesets: &[PathBuf]) -> Result<()> {
    let catalog = load_catalog(tilesets)?;
    let (service, store) = build_service(&config, mode, catalog).await?;
    let app = build_app(config.clone(), service, store);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %addr, mode = %mode, "listening");
    let listener = TcpListener::bind(&addr).await?;

    // Fires once a signal arrives; in-flight requests then get the grace period.
    let stopping = Arc::new(Notify::new());
    let signalled = stopping.clone();
    let shutdown_signal = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = terminate => tracing::info!("received SIGTERM"),
        }
        signalled.notify_one();
    };

    let grace = Duration::from_secs(config.server.shutdown_timeout_secs);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .into_future();
    tokio::select! {
        served = server => served?,
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(grace).await;
        } => tracing::warn!(grace_secs = grace.as_secs(), "grace period elapsed, dropping open connections"),
    }
    tracing::info!("tilekiln shutdown complete");
    Ok(())
}

async fn bulk_runner(config: &Config) -> Result<BulkRunner> {
    let generator = connect_generator(config).await?;
    let store = storage::connect(config).await?;
    Ok(BulkRunner::new(
        generator,
        store,
        config.server.bulk_concurrency,
    ))
}

fn layer_filter(layers: &[String]) -> Option<&[String]> {
    (!layers.is_empty()).then_some(layers)
}

async fn generate(cmd: GenerateCommand, config: Config) -> Result<ExitCode> {
    match cmd {
        GenerateCommand::Tiles { tileset, layers } => {
            let tileset = TilesetConfig::load(&tileset.config)?;
            tileset.check_layer_names(&layers)?;
            let runner = bulk_runner(&config).await?;
            let stdin = BufReader::new(tokio::io::stdin());
            let report = runner
                .generate_from(&tileset, stdin, layer_filter(&layers))
                .await?;
            Ok(print_batch(&report))
        }
        GenerateCommand::Zooms {
            tileset,
            min_zoom,
            max_zoom,
            layers,
        } => {
            let tileset = TilesetConfig::load(&tileset.config)?;
            tileset.check_layer_names(&layers)?;
            let runner = bulk_runner(&config).await?;
            let summary = runner
                .generate_zooms(&tileset, min_zoom, max_zoom, layer_filter(&layers))
                .await?;
            Ok(print_range(&summary))
        }
    }
}

async fn storage_command(cmd: StorageCommand, config: Config) -> Result<ExitCode> {
    let store = storage::connect(&config).await?;
    match cmd {
        StorageCommand::Init { tileset } => {
            let tileset = TilesetConfig::load(&tileset.config)?;
            store.init_tileset(&tileset).await?;
            println!("initialized {}", tileset.id);
        }
        StorageCommand::Destroy { id } => {
            store.destroy_tileset(&id).await?;
            println!("destroyed {id}");
        }
        StorageCommand::Delete { id, zoom } => {
            let scope = zoom.map_or(ZoomScope::All, ZoomScope::Zoom);
            let removed = store.delete_zoom(&id, scope).await?;
            println!("deleted {removed} tiles from {id}");
        }
        StorageCommand::Tiledelete { id } => {
            let stdin = BufReader::new(tokio::io::stdin());
            let report =
                bulk::delete_from(store.as_ref(), &id, stdin, config.server.bulk_concurrency)
                    .await?;
            return Ok(print_batch(&report));
        }
        StorageCommand::List => {
            for id in store.tileset_ids().await? {
                let meta = store.tileset_metadata(&id).await?;
                println!(
                    "{id}\tlayers={}\tcreated={}",
                    meta.layers.join(","),
                    meta.created_at.to_rfc3339()
                );
                for stats in store.zoom_stats(&id).await? {
                    println!("  z{}\t{} tiles\t{} bytes", stats.zoom, stats.tiles, stats.bytes);
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn config_command(cmd: ConfigCommand) -> Result<ExitCode> {
    match cmd {
        ConfigCommand::Test { tileset } => {
            let tileset = TilesetConfig::load(&tileset.config)?;
            match (tileset.minzoom(), tileset.maxzoom()) {
                (Some(min), Some(max)) => println!(
                    "{} is valid: {} layers, zooms {min}-{max}",
                    tileset.id,
                    tileset.layers.len()
                ),
                _ => println!("{} is valid: no layers", tileset.id),
            }
        }
        ConfigCommand::Sql {
            tileset,
            layer,
            zoom,
            x,
            y,
        } => {
            let tileset = TilesetConfig::load(&tileset.config)?;
            let only = layer.map(|l| vec![l]);
            if let Some(names) = &only {
                tileset.check_layer_names(names)?;
            }
            let coordinate = TileCoordinate::new(zoom, x, y)?;
            for query in layer_queries(&tileset, coordinate, only.as_deref())? {
                println!("-- {}\n{}\n", query.layer, query.sql);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_batch(report: &BatchReport) -> ExitCode {
    for item in &report.items {
        match &item.outcome {
            ItemOutcome::Generated { bytes } => println!("{}\tok\t{bytes} bytes", item.input.trim()),
            ItemOutcome::Deleted => println!("{}\tdeleted", item.input.trim()),
            ItemOutcome::Failed(e) => println!("{}\tfailed\t{e}", item.input.trim()),
        }
    }
    let failed = report.items.len() - report.succeeded();
    eprintln!("{} succeeded, {failed} failed", report.succeeded());
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_range(summary: &RangeSummary) -> ExitCode {
    for item in &summary.failures {
        if let ItemOutcome::Failed(e) = &item.outcome {
            println!("{}\tfailed\t{e}", item.input);
        }
    }
    if summary.unreported() > 0 {
        println!("... {} more failures not listed", summary.unreported());
    }
    eprintln!(
        "{} of {} tiles generated, {} failed",
        summary.succeeded, summary.tiles, summary.failed
    );
    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
