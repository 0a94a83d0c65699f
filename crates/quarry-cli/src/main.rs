use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use quarry_client::{HttpPageProvider, MarkdownReportSink, ReqwestImageSource};
use quarry_core::task::{TaskRecord, TaskStatus, TaskUpdate};
use quarry_core::traits::{NullTaskStore, PageSourceProvider, TaskStore};
use quarry_core::{AppError, MetricsTracker, Orchestrator, TaskConfig, TaskOutcome, Tunables};
use quarry_db::{Database, DatabaseConfig, TaskRepository};

#[derive(Parser)]
#[command(name = "quarry", version, about = "Product page extraction pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract text, images and reviews from a product page
    Scrape(ScrapeArgs),

    /// Show one stored task
    Task {
        /// Task id
        id: Uuid,
    },

    /// List recent tasks
    Tasks {
        /// Only tasks with this status (pending, running, completed, failed)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete tasks older than the given number of days
    Cleanup {
        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },
}

#[derive(Args)]
struct ScrapeArgs {
    /// Product page URL
    #[arg(short, long)]
    url: String,

    /// Root folder for product output (overrides QUARRY_OUTPUT_DIR)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Locator statistics carried between runs
    #[arg(long, env = "QUARRY_METRICS_FILE", default_value = "quarry-metrics.json")]
    metrics: PathBuf,

    /// Record the task in the database (requires DATABASE_URL)
    #[arg(long, default_value_t = false)]
    save: bool,

    /// Render the page in headless Chromium instead of plain HTTP
    #[arg(long, default_value_t = false)]
    browser: bool,

    /// Allow private and loopback addresses
    #[arg(long, default_value_t = false)]
    allow_private: bool,

    #[arg(long, default_value_t = 10)]
    max_reviews: usize,

    #[arg(long)]
    no_hero: bool,
    #[arg(long)]
    no_gallery: bool,
    #[arg(long)]
    no_aplus_brand: bool,
    #[arg(long)]
    no_aplus_product: bool,
    #[arg(long)]
    no_aplus_manufacturer: bool,
    #[arg(long)]
    no_text: bool,
    #[arg(long)]
    no_reviews: bool,
}

impl ScrapeArgs {
    fn task_config(&self) -> TaskConfig {
        TaskConfig {
            hero: !self.no_hero,
            gallery: !self.no_gallery,
            aplus_brand: !self.no_aplus_brand,
            aplus_product: !self.no_aplus_product,
            aplus_manufacturer: !self.no_aplus_manufacturer,
            text: !self.no_text,
            reviews: !self.no_reviews,
            max_reviews: self.max_reviews,
        }
    }
}

/// Task persistence chosen at startup.
enum Store {
    Null(NullTaskStore),
    Db(TaskRepository),
}

impl TaskStore for Store {
    async fn create_task(&self, url: &str, config: &TaskConfig) -> Result<Uuid, AppError> {
        match self {
            Store::Null(s) => s.create_task(url, config).await,
            Store::Db(s) => s.create_task(url, config).await,
        }
    }

    async fn update_task(&self, id: Uuid, update: &TaskUpdate) -> Result<(), AppError> {
        match self {
            Store::Null(s) => s.update_task(id, update).await,
            Store::Db(s) => s.update_task(id, update).await,
        }
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, AppError> {
        match self {
            Store::Null(s) => s.get_task(id).await,
            Store::Db(s) => s.get_task(id).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quarry=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape(args) => cmd_scrape(args).await?,
        Commands::Task { id } => {
            let repo = connect_db().await?;
            cmd_task(&repo, id).await?;
        }
        Commands::Tasks { status, limit } => {
            let repo = connect_db().await?;
            cmd_tasks(&repo, status, limit).await?;
        }
        Commands::Cleanup { days } => {
            let repo = connect_db().await?;
            let deleted = repo.delete_older_than(days).await?;
            println!("Deleted {deleted} tasks older than {days} days");
        }
    }

    Ok(())
}

async fn connect_db() -> Result<TaskRepository> {
    let config = DatabaseConfig::from_env().context("Database required for this command")?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db.task_repo())
}

async fn cmd_scrape(args: ScrapeArgs) -> Result<()> {
    let config = args.task_config();
    config.validate()?;
    url::Url::parse(&args.url).with_context(|| format!("Invalid URL: {}", args.url))?;

    let mut tunables = Tunables::from_env()?;
    if let Some(root) = &args.output {
        tunables.output_root = root.clone();
    }

    let store = if args.save {
        Store::Db(connect_db().await?)
    } else {
        Store::Null(NullTaskStore)
    };

    let mut images = ReqwestImageSource::new()?;
    if args.allow_private {
        images = images.allow_private_urls();
    }

    let mut metrics = MetricsTracker::load(&args.metrics, tunables.metrics_capacity)
        .with_context(|| format!("Failed to load metrics from {}", args.metrics.display()))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling task");
            on_signal.cancel();
        }
    });

    let outcome = if args.browser {
        run_browser(&args, &config, images, store, tunables, &mut metrics, &cancel).await?
    } else {
        let mut pages = HttpPageProvider::new()?;
        if args.allow_private {
            pages = pages.allow_private_urls();
        }
        execute(pages, images, store, tunables, &args.url, &config, &mut metrics, &cancel).await?
    };

    if let Err(e) = metrics.save(&args.metrics) {
        tracing::warn!(error = %e, path = %args.metrics.display(), "Failed to save metrics");
    }

    print_outcome(&outcome)?;
    if !outcome.is_completed() {
        bail!(
            "Task {} failed: {}",
            outcome.task_id,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[cfg(feature = "browser")]
async fn run_browser(
    args: &ScrapeArgs,
    config: &TaskConfig,
    images: ReqwestImageSource,
    store: Store,
    tunables: Tunables,
    metrics: &mut MetricsTracker,
    cancel: &CancellationToken,
) -> Result<TaskOutcome> {
    let pages = quarry_client::BrowserPageProvider::launch()
        .await
        .context("Failed to launch headless browser")?;
    execute(pages, images, store, tunables, &args.url, config, metrics, cancel).await
}

#[cfg(not(feature = "browser"))]
async fn run_browser(
    _args: &ScrapeArgs,
    _config: &TaskConfig,
    _images: ReqwestImageSource,
    _store: Store,
    _tunables: Tunables,
    _metrics: &mut MetricsTracker,
    _cancel: &CancellationToken,
) -> Result<TaskOutcome> {
    bail!("--browser requires building with the `browser` feature")
}

#[allow(clippy::too_many_arguments)]
async fn execute<P: PageSourceProvider>(
    pages: P,
    images: ReqwestImageSource,
    store: Store,
    tunables: Tunables,
    url: &str,
    config: &TaskConfig,
    metrics: &mut MetricsTracker,
    cancel: &CancellationToken,
) -> Result<TaskOutcome> {
    let orchestrator = Orchestrator::new(pages, images, MarkdownReportSink::new(), store, tunables);
    let outcome = orchestrator.run(url, config, metrics, cancel).await?;
    Ok(outcome)
}

fn print_outcome(outcome: &TaskOutcome) -> Result<()> {
    let envelope = &outcome.envelope;
    let summary = serde_json::json!({
        "task_id": outcome.task_id,
        "state": outcome.state,
        "url": envelope.url,
        "output_dir": outcome.output_dir,
        "report": outcome.report_path,
        "elapsed_seconds": (outcome.elapsed.as_secs_f64() * 100.0).round() / 100.0,
        "text": envelope.text,
        "images": {
            "hero": envelope.images.hero.len(),
            "gallery": envelope.images.gallery.len(),
            "aplus_brand": envelope.images.aplus_brand.len(),
            "aplus_product": envelope.images.aplus_product.len(),
            "aplus_manufacturer": envelope.images.aplus_manufacturer.len(),
            "review_images": envelope.images.review_images.len(),
        },
        "reviews": envelope.reviews.reviews.len(),
        "validation": envelope.validation,
        "errors": envelope.errors,
        "error": outcome.error,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_task(repo: &TaskRepository, id: Uuid) -> Result<()> {
    let Some(task) = repo.get_task(id).await? else {
        bail!("No task with id {id}");
    };
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

async fn cmd_tasks(repo: &TaskRepository, status: Option<TaskStatus>, limit: usize) -> Result<()> {
    let tasks = repo.list_tasks(status, limit).await?;
    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    for task in &tasks {
        println!(
            "  [{}] {} {} {}",
            task.status,
            task.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            task.id,
            task.product_name.as_deref().unwrap_or(&task.url),
        );
    }
    println!("\nTotal: {} tasks", tasks.len());
    Ok(())
}
