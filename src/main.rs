use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::Regex;
use rust_decimal::Decimal;

use price_parser::audit::{AuditLog, AuditSink, Fanout, ParseMetrics};
use price_parser::config::Settings;
use price_parser::db::{PageRequest, ProductFilter, ProductStore, SortOrder, SqliteStore};
use price_parser::fetch::{build_fetcher, Fetcher};
use price_parser::links;
use price_parser::model::Product;
use price_parser::orchestrator::ParseOrchestrator;
use price_parser::scheduler::{BatchScheduler, TickOutcome};

#[derive(Parser)]
#[command(name = "price_parser", about = "Product page price parser")]
struct Cli {
    /// Extra TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and check the product backlog
    Init {
        /// Rebuild the links file from this sitemap
        #[arg(long)]
        sitemap: Option<String>,
        /// Keep only sitemap URLs matching this pattern
        #[arg(long, default_value = "/catalog/")]
        pattern: String,
    },
    /// Fetch, parse and save the given URLs
    Parse {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Parse saved HTML files without fetching or saving
    Extract {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Print products as JSON
        #[arg(long)]
        json: bool,
    },
    /// Work through the backlog batch by batch until done or Ctrl-C
    Run {
        /// Keep ticking after the backlog is exhausted
        #[arg(long)]
        forever: bool,
        /// Start immediately instead of after the configured delay
        #[arg(long)]
        now: bool,
    },
    /// Query saved products
    List {
        #[arg(long)]
        min_price: Option<Decimal>,
        #[arg(long)]
        max_price: Option<Decimal>,
        /// Case-insensitive title substring
        #[arg(short, long)]
        title: Option<String>,
        /// Sort keys like "price,desc" (repeatable)
        #[arg(short, long)]
        sort: Vec<String>,
        #[arg(long, default_value = "0")]
        page: usize,
        #[arg(short = 'n', long, default_value = "20")]
        size: usize,
        /// Only products above this price, most expensive first
        #[arg(long, conflicts_with_all = ["min_price", "max_price", "title", "sort"])]
        expensive: Option<Decimal>,
    },
    /// Show database statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref());

    let result = match cli.command {
        Commands::Init { sitemap, pattern } => init(&settings, sitemap, &pattern).await,
        Commands::Parse { urls } => parse(&settings, &urls).await,
        Commands::Extract { files, json } => extract_files(&files, json),
        Commands::Run { forever, now } => run(&settings, forever, now).await,
        Commands::List { min_price, max_price, title, sort, page, size, expensive } => {
            let store = SqliteStore::open(&settings.db_path)?;
            match expensive {
                Some(threshold) => {
                    let products = store.find_expensive(threshold)?;
                    print_products(&products);
                    println!("\n{} products above {}", products.len(), threshold);
                }
                None => {
                    let filter = ProductFilter { min_price, max_price, title_contains: title };
                    let request = PageRequest {
                        page,
                        size,
                        sort: sort.iter().map(|s| SortOrder::parse(s)).collect(),
                    };
                    let found = store.find_filtered(&filter, &request)?;
                    print_products(&found.items);
                    println!(
                        "\npage {}/{} | {} matching products",
                        found.page + 1,
                        found.total_pages().max(1),
                        found.total
                    );
                }
            }
            Ok(())
        }
        Commands::Stats => {
            let store = SqliteStore::open(&settings.db_path)?;
            let s = store.stats()?;
            println!("Products:    {}", s.products);
            println!("With price:  {}", s.priced);
            println!("No price:    {}", s.products - s.priced);
            match s.last_parsed_at {
                Some(at) => println!("Last parsed: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last parsed: never"),
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn init(settings: &Settings, sitemap: Option<String>, pattern: &str) -> anyhow::Result<()> {
    let store = SqliteStore::open(&settings.db_path)?;
    println!("Database: {} ({} products)", settings.db_path.display(), store.count()?);

    if let Some(sitemap) = sitemap {
        let fetcher = build_fetcher(settings.fetcher, &settings.fetch_options(), &settings.base_url)?;
        let re = Regex::new(pattern).context("invalid --pattern")?;
        let urls = links::fetch_sitemap_urls(fetcher.as_ref(), &sitemap, &re).await?;
        fs::write(&settings.links_file, serde_json::to_string_pretty(&urls)?)
            .with_context(|| format!("cannot write {}", settings.links_file.display()))?;
        println!("Wrote {} links to {}", urls.len(), settings.links_file.display());
    }

    let backlog = links::load_links_file(&settings.links_file, &settings.base_url);
    println!("Backlog: {} product URLs", backlog.len());
    Ok(())
}

struct Runtime {
    orchestrator: Arc<ParseOrchestrator>,
    metrics: Arc<ParseMetrics>,
    audit_log: Arc<AuditLog>,
}

impl Runtime {
    fn start(settings: &Settings) -> anyhow::Result<Self> {
        let store: Arc<dyn ProductStore> = Arc::new(SqliteStore::open(&settings.db_path)?);
        let fetcher: Arc<dyn Fetcher> = Arc::from(build_fetcher(
            settings.fetcher,
            &settings.fetch_options(),
            &settings.base_url,
        )?);
        let metrics = Arc::new(ParseMetrics::new());
        let audit_log = Arc::new(AuditLog::spawn(settings.queue_capacity));
        let audit: Arc<dyn AuditSink> =
            Arc::new(Fanout(vec![metrics.clone() as Arc<dyn AuditSink>, audit_log.clone()]));
        let orchestrator = Arc::new(ParseOrchestrator::new(
            fetcher,
            store,
            audit,
            settings.orchestrator_options(),
        ));
        Ok(Runtime { orchestrator, metrics, audit_log })
    }

    async fn stop(self) {
        self.orchestrator.shutdown().await;
        self.audit_log.shutdown().await;
        self.metrics.report();
        match self.orchestrator.store().count() {
            Ok(n) => println!("{} products stored", n),
            Err(e) => eprintln!("cannot count products: {}", e),
        }
    }
}

async fn parse(settings: &Settings, urls: &[String]) -> anyhow::Result<()> {
    let rt = Runtime::start(settings)?;
    let report = rt.orchestrator.parse_many_outcomes(urls).await;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(p) => println!("ok   {} | {} | {}", p.url, truncate(&p.title, 40), p.price),
            Err(e) if e.is_incomplete() => println!("wait {} | {}", outcome.url, e),
            Err(e) => println!("fail {} | {}", outcome.url, e),
        }
    }
    println!(
        "\n{}/{} parsed{}",
        report.success_count(),
        urls.len(),
        if report.is_complete() { "" } else { " (some still running at deadline)" }
    );
    rt.stop().await;
    Ok(())
}

fn extract_files(files: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let pb = progress_bar(files.len() as u64);
    let results: Vec<_> = files
        .par_iter()
        .map(|path| {
            let product = fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))
                .and_then(|markup| {
                    let url = format!("file://{}", path.display());
                    Ok(price_parser::extract::extract(&url, &markup)?)
                });
            pb.inc(1);
            (path, product)
        })
        .collect();
    pb.finish_and_clear();

    let mut products = Vec::new();
    for (path, result) in results {
        match result {
            Ok(p) => products.push(p),
            Err(e) => eprintln!("{}: {:#}", path.display(), e),
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&products)?);
    } else {
        print_products(&products);
    }
    Ok(())
}

async fn run(settings: &Settings, forever: bool, now: bool) -> anyhow::Result<()> {
    let backlog = links::load_links_file(&settings.links_file, &settings.base_url);
    if backlog.is_empty() && !forever {
        println!("Backlog is empty. Check {} or run 'init'.", settings.links_file.display());
        return Ok(());
    }

    let rt = Runtime::start(settings)?;
    let scheduler =
        BatchScheduler::new(backlog, settings.batch_size, Arc::clone(&rt.orchestrator));
    let pb = progress_bar(scheduler.backlog_len() as u64);
    let initial_delay = if now { std::time::Duration::ZERO } else { settings.initial_delay() };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let mut ok = 0;
    let total = scheduler
        .run(initial_delay, settings.interval(), !forever, shutdown, |outcome| {
            if let TickOutcome::Processed { end, successes, .. } = outcome {
                ok += successes;
                pb.set_position(*end as u64);
                pb.set_message(format!("{} ok", ok));
            }
        })
        .await;
    pb.finish_and_clear();

    println!(
        "Processed {}/{} URLs, {} saved.",
        scheduler.cursor(),
        scheduler.backlog_len(),
        total
    );
    rt.stop().await;
    Ok(())
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn print_products(products: &[Product]) {
    if products.is_empty() {
        println!("No products found.");
        return;
    }
    println!("{:>5} | {:<40} | {:>12} | {:<19} | {}", "id", "Title", "Price", "Parsed", "URL");
    println!("{}", "-".repeat(110));
    for p in products {
        let id = p.id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:>5} | {:<40} | {:>12} | {:<19} | {}",
            id,
            truncate(&p.title, 40),
            p.price.to_string(),
            p.parsed_at.format("%Y-%m-%d %H:%M:%S"),
            p.url
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
