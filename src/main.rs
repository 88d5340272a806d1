use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use freeproxy::{
    config::{default_config_path, AppConfig},
    database::ProxyDatabase,
    export::{render_export, render_single_proxy},
    models::ProxyQuery,
    pipeline::{FetchReport, Pipeline, PipelineOptions, TidyReport},
    progress::ProgressSnapshot,
    proxy::{CheckerConfig, ProxyChecker},
    source::{CrawlerConfig, SourceRegistry},
    tui::ProgressDashboard,
};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Collects free proxy share-links, validates them and keeps the working ones
#[derive(Parser)]
#[command(name = "freeproxy")]
#[command(about = "Collects free proxy share-links, validates them and keeps the working ones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as YAML
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
    /// Fetch links from the sources, validate them and store new proxies
    Fetch {
        /// Log only, without the progress dashboard
        #[arg(short, long)]
        quiet: bool,
        /// Number of concurrent workers
        #[arg(short = 'w', long)]
        worker: Option<usize>,
        /// Source names to fetch (can specify multiple); all enabled by default
        #[arg(short, long)]
        source: Vec<String>,
    },
    /// Re-validate stored proxies and remove dead ones
    Tidy {
        /// Log only, without the progress dashboard
        #[arg(short, long)]
        quiet: bool,
        /// Number of concurrent workers
        #[arg(short = 'w', long)]
        worker: Option<usize>,
    },
    /// Show stored proxy counts per protocol and country
    Summary,
    /// Export stored proxies as a Clash profile
    Export {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        filter: FilterArgs,
        /// Maximum number of proxies
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Write a single-proxy Clash profile for a local listener
    Proxy {
        /// Listen address
        #[arg(short, long)]
        address: Option<String>,
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,
        #[command(flatten)]
        filter: FilterArgs,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Only these country codes, comma separated (e.g. "us,jp")
    #[arg(long)]
    country_code: Option<String>,
    /// Exclude these country codes, comma separated
    #[arg(long)]
    not_country_code: Option<String>,
    /// Select a proxy by id
    #[arg(long)]
    id: Option<i64>,
    /// Lowest delay first instead of random order
    #[arg(long)]
    fast: bool,
}

impl FilterArgs {
    fn query(&self) -> ProxyQuery {
        let mut query = ProxyQuery::new();
        if let Some(id) = self.id {
            query = query.with_id(id);
        }
        if let Some(codes) = &self.country_code {
            query = query.with_country_codes(codes);
        }
        if let Some(codes) = &self.not_country_code {
            query = query.with_not_country_codes(codes);
        }
        if self.fast {
            query = query.fastest();
        }
        query
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path)?;

    let dashboard = matches!(
        cli.command,
        Commands::Fetch { quiet: false, .. } | Commands::Tidy { quiet: false, .. }
    );
    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_tracing(level, config.log.file.as_deref(), dashboard)?;

    match cli.command {
        Commands::Config { default } => {
            let shown = if default {
                AppConfig::with_default_sources()
            } else {
                config
            };
            print!("{}", shown.to_yaml()?);
        }
        Commands::Fetch {
            quiet,
            worker,
            source,
        } => {
            let config = match worker {
                Some(worker) => config.with_worker(worker),
                None => config,
            };
            let pipeline = Arc::new(build_pipeline(&config).await?);
            let cancel = cancel_on_ctrl_c();

            let run = {
                let pipeline = Arc::clone(&pipeline);
                let cancel = cancel.clone();
                tokio::spawn(async move { pipeline.fetch(&source, &cancel).await })
            };
            let report = if quiet {
                run.await??
            } else {
                ProgressDashboard::new("Fetching proxies", pipeline.progress(), cancel)
                    .run(run)
                    .await??
            };

            print_fetch_report(&report);
            pipeline.database().close().await;
        }
        Commands::Tidy { quiet, worker } => {
            let config = match worker {
                Some(worker) => config.with_worker(worker),
                None => config,
            };
            let pipeline = Arc::new(build_pipeline(&config).await?);
            let cancel = cancel_on_ctrl_c();

            let run = {
                let pipeline = Arc::clone(&pipeline);
                let cancel = cancel.clone();
                tokio::spawn(async move { pipeline.tidy(&cancel).await })
            };
            let report = if quiet {
                run.await??
            } else {
                ProgressDashboard::new("Tidying stored proxies", pipeline.progress(), cancel)
                    .run(run)
                    .await??
            };

            print_tidy_report(&report);
            pipeline.database().close().await;
        }
        Commands::Summary => {
            let db = ProxyDatabase::new(&config.storage.path).await?;
            let summary = db.summary().await?;

            println!("Total proxies: {}", summary.total);
            if !summary.by_type.is_empty() {
                println!("\nBy type:");
                for row in &summary.by_type {
                    println!("  {:<8} {}", row.kind, row.count);
                }
            }
            if !summary.by_country.is_empty() {
                println!("\nBy country:");
                for row in &summary.by_country {
                    let code = if row.country_code.is_empty() {
                        "--"
                    } else {
                        row.country_code.as_str()
                    };
                    println!("  {:<3} {:<24} {}", code, row.country, row.count);
                }
            }
            db.close().await;
        }
        Commands::Export {
            output,
            filter,
            count,
        } => {
            let db = ProxyDatabase::new(&config.storage.path).await?;
            let mut query = filter.query();
            if let Some(count) = count {
                query = query.with_limit(count);
            }
            let proxies = db.get_proxies(&query).await?;
            db.close().await;

            let profile = render_export(&proxies)?;
            let output = output.or(config.export.output_path);
            write_output(output.as_deref(), &profile).await?;
            info!(proxies = proxies.len(), "exported proxies");
        }
        Commands::Proxy {
            address,
            port,
            filter,
            output,
        } => {
            let db = ProxyDatabase::new(&config.storage.path).await?;
            let proxy = db
                .get_proxies(&filter.query().with_limit(1))
                .await?
                .into_iter()
                .next();
            db.close().await;
            let proxy = proxy.ok_or_else(|| anyhow!("No stored proxy matches the filters"))?;

            let address = address.unwrap_or(config.proxy.bind_address);
            let port = port.unwrap_or(config.proxy.port);
            let profile = render_single_proxy(&proxy, &address, port)?;
            let output = output.or(config.proxy.output_path);
            write_output(output.as_deref(), &profile).await?;
            info!(id = proxy.id, server = %proxy.server, port = proxy.port, "selected proxy");
        }
    }

    Ok(())
}

/// Install the global subscriber; with the dashboard up, logs go to the
/// configured file or nowhere
fn init_tracing(level: &str, file: Option<&Path>, dashboard: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None if dashboard => builder.with_writer(io::sink).init(),
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

async fn build_pipeline(config: &AppConfig) -> Result<Pipeline> {
    let registry = SourceRegistry::from_config(&config.sources, &CrawlerConfig::new())?;
    let checker = ProxyChecker::with_config(CheckerConfig::from(&config.validator))?;
    let db = ProxyDatabase::new(&config.storage.path).await?;
    Ok(Pipeline::new(
        registry,
        checker,
        db,
        PipelineOptions::from(&config.app),
    ))
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping");
            token.cancel();
        }
    });
    cancel
}

async fn write_output(path: Option<&Path>, content: &str) -> Result<()> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, content).await?;
            println!("Saved to {:?}", path);
        }
        None => print!("{content}"),
    }
    Ok(())
}

fn print_fetch_report(report: &FetchReport) {
    if report.cancelled {
        println!("Fetch cancelled, partial results kept.");
    }
    println!("Sources:");
    for source in &report.sources {
        match &source.error {
            Some(error) => println!("  {:<20} {:>6} links  ({})", source.name, source.links, error),
            None => println!("  {:<20} {:>6} links", source.name, source.links),
        }
    }
    print_snapshot(&report.progress);
    println!(
        "Created: {} | Duplicate: {} | Invalid: {} | Failed: {}",
        report.progress.created,
        report.progress.duplicate,
        report.progress.invalid,
        report.progress.failed
    );
}

fn print_tidy_report(report: &TidyReport) {
    if report.cancelled {
        println!("Tidy cancelled, remaining proxies left untouched.");
    }
    print_snapshot(&report.progress);
    println!(
        "Succeeded: {} | Removed: {} | With country: {} | Without country: {}",
        report.progress.succeeded,
        report.progress.removed,
        report.progress.country_set,
        report.progress.country_empty
    );
}

fn print_snapshot(snapshot: &ProgressSnapshot) {
    println!(
        "Processed {}/{} in {:.1}s",
        snapshot.completed,
        snapshot.total,
        snapshot.elapsed.as_secs_f64()
    );
}
