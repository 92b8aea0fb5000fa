//! ivory - Piano practice analytics from the command line

mod cli;

use anyhow::{Context, Result};
use chrono::Datelike;
use clap::{Args, Parser, Subcommand};
use ivory_core::analytics::{IntervalType, Metric};
use ivory_core::catalog::{CatalogQuery, CatalogScope, SortKey, SortOrder};
use ivory_core::config::AnalyticsConfig;
use ivory_core::models::{LearnScores, UserId};
use ivory_core::store::Dataset;
use ivory_core::{MemoryStore, PracticeAnalytics};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "ivory",
    version,
    about = "Piano practice analytics",
    long_about = "Practice heatmaps, interval trends and song catalog queries over a\n\
                  practice dataset exported as JSON.\n\
                  \n\
                  Examples:\n\
                    ivory -d data.json heatmap -u alice --year 2024\n\
                    ivory -d data.json trend -u alice --interval month --index 1 -m score -m combo\n\
                    ivory -d data.json library -u alice --scope union --search chopin --sort composer\n\
                    ivory -d data.json genres -u alice --scope import\n\
                    ivory learn-score --correct 15 --wrong 5 --missed 2\n\
                  \n\
                  Environment Variables:\n\
                    IVORY_DATA                       # Dataset path\n\
                    IVORY_CONFIG                     # Config file (default: <config dir>/ivory/config.toml)\n\
                    IVORY_NO_COLOR                   # Disable ANSI colors\n\
                    RUST_LOG                         # Log filter (default: ivory=info)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Dataset JSON file (users, songs, scores, favorites, imports)
    #[arg(long, short = 'd', env = "IVORY_DATA", global = true)]
    data: Option<PathBuf>,

    /// Analytics config file (TOML)
    #[arg(long, env = "IVORY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Disable ANSI colors (log-friendly)
    #[arg(long, env = "IVORY_NO_COLOR", global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Daily practice heatmap for a year
    Heatmap {
        #[arg(long, short = 'u')]
        user: String,
        /// Defaults to the current year
        #[arg(long, short = 'y')]
        year: Option<i32>,
    },
    /// Compare a window with the one before it
    Trend {
        #[arg(long, short = 'u')]
        user: String,
        /// week | month | quarter
        #[arg(long, default_value = "week")]
        interval: IntervalType,
        /// 0 = most recent complete window
        #[arg(long, default_value = "0")]
        index: u32,
        /// practice_time | score | combo | multiplier (repeatable)
        #[arg(long = "metric", short = 'm', default_value = "practice_time")]
        metrics: Vec<Metric>,
    },
    /// The user's favorite songs
    Favorites {
        #[arg(long, short = 'u')]
        user: String,
        #[command(flatten)]
        list: ListArgs,
    },
    /// Songs the user imported
    Imports {
        #[arg(long, short = 'u')]
        user: String,
        #[command(flatten)]
        list: ListArgs,
        #[arg(long)]
        favorites_only: bool,
    },
    /// General catalog query
    Library {
        #[arg(long, short = 'u')]
        user: String,
        #[command(flatten)]
        list: ListArgs,
        /// library | import | union
        #[arg(long, default_value = "library")]
        scope: CatalogScope,
        #[arg(long)]
        favorites_only: bool,
        #[arg(long)]
        owned_only: bool,
    },
    /// Distinct genres in a scope
    Genres {
        #[arg(long, short = 'u')]
        user: String,
        /// library | import | union
        #[arg(long, default_value = "library")]
        scope: CatalogScope,
    },
    /// Performance and accuracy for one session's note counts
    LearnScore {
        #[arg(long)]
        correct: u32,
        #[arg(long)]
        wrong: u32,
        #[arg(long)]
        missed: u32,
    },
}

#[derive(Args)]
struct ListArgs {
    /// 1-based page number
    #[arg(long, short = 'p', default_value = "1")]
    page: u32,
    /// Defaults to the configured page size
    #[arg(long, short = 'n')]
    page_size: Option<u32>,
    /// Case-insensitive title/composer substring
    #[arg(long, short = 's')]
    search: Option<String>,
    #[arg(long, short = 'g')]
    genre: Option<String>,
    /// title | composer | duration | difficulty
    #[arg(long, default_value = "title")]
    sort: SortKey,
    /// asc | desc
    #[arg(long, default_value = "asc")]
    order: SortOrder,
}

impl ListArgs {
    fn apply(self, mut query: CatalogQuery) -> CatalogQuery {
        query = query.page(self.page).sort(self.sort, self.order);
        if let Some(size) = self.page_size {
            query = query.page_size(size);
        }
        if let Some(text) = self.search {
            query = query.search(text);
        }
        if let Some(genre) = self.genre {
            query = query.genre(genre);
        }
        query
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "ivory=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    let no_color = cli.no_color;

    // Offline command, no dataset needed
    if let Command::LearnScore {
        correct,
        wrong,
        missed,
    } = cli.command
    {
        let scores = LearnScores::from_counts(correct, wrong, missed);
        println!("{}", cli::format_learn_scores(&scores, json));
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let data = cli
        .data
        .context("--data <dataset.json> (or IVORY_DATA) is required for this command")?;
    let analytics = open_dataset(&data, config)?;

    match cli.command {
        Command::Heatmap { user, year } => {
            run_heatmap(&analytics, UserId::from(user), year, json, no_color).await?;
        }
        Command::Trend {
            user,
            interval,
            index,
            metrics,
        } => {
            run_trend(&analytics, UserId::from(user), interval, index, &metrics, json, no_color)
                .await?;
        }
        Command::Favorites { user, list } => {
            let query = list
                .apply(CatalogQuery::new(UserId::from(user), CatalogScope::Union))
                .favorites_only(true);
            run_catalog(&analytics, query, json, no_color).await?;
        }
        Command::Imports {
            user,
            list,
            favorites_only,
        } => {
            let query = list
                .apply(CatalogQuery::new(UserId::from(user), CatalogScope::Import))
                .favorites_only(favorites_only);
            run_catalog(&analytics, query, json, no_color).await?;
        }
        Command::Library {
            user,
            list,
            scope,
            favorites_only,
            owned_only,
        } => {
            let query = list
                .apply(CatalogQuery::new(UserId::from(user), scope))
                .favorites_only(favorites_only)
                .owned_only(owned_only);
            run_catalog(&analytics, query, json, no_color).await?;
        }
        Command::Genres { user, scope } => {
            let genres = analytics.get_genres(&UserId::from(user), scope).await?;
            println!("{}", cli::format_genres(&genres, json));
        }
        // Handled before the dataset was loaded
        Command::LearnScore { .. } => {}
    }

    tracing::debug!(stats = ?analytics.cache_stats(), "Cache activity");
    Ok(())
}

/// Explicit path, else `<config dir>/ivory/config.toml` when present
fn load_config(path: Option<&Path>) -> Result<AnalyticsConfig> {
    if let Some(path) = path {
        return AnalyticsConfig::load(path);
    }
    match dirs::config_dir() {
        Some(dir) => AnalyticsConfig::load_or_default(&dir.join("ivory").join("config.toml")),
        None => Ok(AnalyticsConfig::default()),
    }
}

fn open_dataset(path: &Path, config: AnalyticsConfig) -> Result<PracticeAnalytics<MemoryStore>> {
    let dataset = Dataset::from_json_file(path)?;
    let store = MemoryStore::from_dataset(dataset);
    tracing::info!(
        path = %path.display(),
        songs = store.song_count(),
        scores = store.score_count(),
        "Dataset loaded"
    );
    PracticeAnalytics::new(Arc::new(store), config).context("Failed to start analytics")
}

async fn run_heatmap(
    analytics: &PracticeAnalytics<MemoryStore>,
    user: UserId,
    year: Option<i32>,
    json: bool,
    no_color: bool,
) -> Result<()> {
    let year = year.unwrap_or_else(|| analytics.today().year());
    let heatmap = analytics.get_heatmap_data(&user, year).await?;
    println!("{}", cli::format_heatmap(&heatmap, json, no_color));
    Ok(())
}

async fn run_trend(
    analytics: &PracticeAnalytics<MemoryStore>,
    user: UserId,
    interval: IntervalType,
    index: u32,
    metrics: &[Metric],
    json: bool,
    no_color: bool,
) -> Result<()> {
    let comparison = analytics
        .get_interval_comparison(&user, interval, index, metrics)
        .await?;
    println!("{}", cli::format_comparison(&comparison, json, no_color));
    Ok(())
}

async fn run_catalog(
    analytics: &PracticeAnalytics<MemoryStore>,
    query: CatalogQuery,
    json: bool,
    no_color: bool,
) -> Result<()> {
    let page = analytics.get_library_songs(query).await?;
    println!("{}", cli::format_catalog_page(&page, json, no_color));
    Ok(())
}
