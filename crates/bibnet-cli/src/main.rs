use std::path::{Path, PathBuf};

use bibnet::{
  config::Settings,
  errors::BibnetError,
  pipeline::{Pipeline, BASELINE_SCHEMA},
  strategy::SearchStrategy,
};
use clap::{builder::ArgAction, Parser, Subcommand};
use console::{style, Emoji};
use errors::BibnetCliError;
use tracing::{debug, trace};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod errors;

static LOOKING_GLASS: Emoji<'_, '_> = Emoji("🔍 ", "");
static BOOKS: Emoji<'_, '_> = Emoji("📚 ", "");
static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
static SAVE: Emoji<'_, '_> = Emoji("💾 ", "");
static WARNING: Emoji<'_, '_> = Emoji("⚠️  ", "");
static SUCCESS: Emoji<'_, '_> = Emoji("✨ ", "");

#[derive(Parser)]
#[command(author, version, about = "Harvest bibliometric records and build collaboration networks")]
struct Cli {
  /// Verbose mode (-v, -vv, -vvv)
  #[arg(
        short,
        long,
        action = ArgAction::Count,
        global = true,
        help = "Increase logging verbosity"
    )]
  verbose: u8,

  /// Settings file; defaults to the user configuration directory
  #[arg(long, short, global = true)]
  config: Option<PathBuf>,

  /// Answer yes to every confirmation prompt
  #[arg(long, global = true)]
  accept_defaults: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Validate the settings and show the derived paths
  Check,
  /// Show the entries of a search strategy
  Strategy {
    /// Strategy file, overriding the settings
    #[arg(long, short)]
    strategy: Option<PathBuf>,
  },
  /// Download the organisation registry and the subject taxonomies
  Baselines,
  /// Compute per-discipline citation statistics into the baseline store
  Normalisation {
    /// Strategy file, overriding the settings
    #[arg(long, short)]
    strategy: Option<PathBuf>,
  },
  /// Harvest records for the strategy's topics
  Harvest {
    /// Strategy file, overriding the settings
    #[arg(long, short)]
    strategy: Option<PathBuf>,
  },
  /// Build the project tables and the collaboration network from harvested records
  Build,
  /// Run harvest and build, downloading baselines first if they are missing
  Run {
    /// Strategy file, overriding the settings
    #[arg(long, short)]
    strategy: Option<PathBuf>,
  },
  /// Remove the project store, and the harvested records unless told to keep them
  Clean {
    /// Keep the harvested records cache
    #[arg(long)]
    keep_cache: bool,
  },
}

/// Setup logging with the specified verbosity level, also into `log_dir` when given
fn setup_logging(verbosity: u8, log_dir: Option<&Path>) -> Result<(), BibnetCliError> {
  let filter = match verbosity {
    0 => "warn",
    1 => "info",
    2 => "debug",
    _ => "trace",
  };

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

  let file_layer = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)?;
      let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix("bibnet")
        .filename_suffix("log")
        .build(dir)?;
      Some(fmt::layer().with_writer(file_appender).with_ansi(false).with_target(true))
    },
    None => None,
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true),
    )
    .with(file_layer)
    .init();
  Ok(())
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings, BibnetCliError> {
  let path = path.unwrap_or_else(|| {
    let default_path = Settings::default_path();
    println!(
      "{} Using default settings: {}",
      style(BOOKS).cyan(),
      style(default_path.display()).yellow()
    );
    default_path
  });
  Ok(Settings::load(path)?)
}

fn load_strategy(settings: &Settings, path: Option<PathBuf>) -> Result<SearchStrategy, BibnetCliError> {
  let path = path.or_else(|| settings.strategy_path().map(Path::to_path_buf)).ok_or_else(|| {
    BibnetError::Config("no search strategy: set paths.strategy or pass --strategy".into())
  })?;
  trace!("Using search strategy at: {}", path.display());
  Ok(SearchStrategy::load(path)?)
}

fn confirm(prompt: &str, accept_defaults: bool) -> Result<bool, BibnetCliError> {
  if accept_defaults {
    return Ok(true);
  }
  Ok(dialoguer::Confirm::new().with_prompt(prompt).default(false).wait_for_newline(true).interact()?)
}

async fn harvest(pipeline: &Pipeline, strategy: &SearchStrategy) -> Result<(), BibnetCliError> {
  let settings = pipeline.settings();
  println!(
    "{} Harvesting {} for {}..={}",
    style(LOOKING_GLASS).cyan(),
    style(&settings.project().name).yellow(),
    style(settings.project().start_year).yellow(),
    style(settings.project().end_year).yellow()
  );
  let summary = pipeline.harvest(strategy).await?;
  debug!("Harvest summary: {:?}", summary);
  if summary.from_cache {
    println!(
      "{} Reused {} cached records from {}",
      style(SAVE).green(),
      style(summary.records).yellow(),
      style(settings.raw_cache_path().display()).yellow()
    );
  } else {
    for (topic, bucket) in &summary.buckets {
      println!(
        "   {} {} {}: {} of {} ({:?})",
        style("Topic").green().bold(),
        style(topic).cyan(),
        style(bucket.year).white(),
        style(bucket.retrieved).yellow(),
        style(bucket.total_hits).yellow(),
        bucket.status
      );
    }
    if summary.partial {
      println!(
        "{} Some years failed; {} records kept at {}, run harvest again to retry",
        style(WARNING).yellow(),
        style(summary.records).yellow(),
        style(settings.partial_cache_path().display()).yellow()
      );
    } else {
      println!("{} Harvested {} records", style(SUCCESS).green(), style(summary.records).yellow());
    }
  }
  if summary.aggregations > 0 {
    println!("{} Wrote {} aggregate tables", style(SAVE).green(), style(summary.aggregations).yellow());
  }
  Ok(())
}

async fn build(pipeline: &Pipeline) -> Result<(), BibnetCliError> {
  println!("{} Building project tables", style(ROCKET).cyan());
  let summary = pipeline.build().await?;
  debug!("Build summary: {:?}", summary);
  println!("   {} {}", style("Records:").green().bold(), style(summary.records).white());
  println!("   {} {}", style("Contributions:").green().bold(), style(summary.contributions).white());
  println!("   {} {}", style("Organisations:").green().bold(), style(summary.organisations).white());
  println!("   {} {}", style("Locations:").green().bold(), style(summary.locations).white());
  println!(
    "   {} {} edges, {} nodes",
    style("Network:").green().bold(),
    style(summary.edges).white(),
    style(summary.nodes).white()
  );
  println!(
    "{} Wrote {} tables to {}",
    style(SUCCESS).green(),
    style(summary.tables).yellow(),
    style(pipeline.settings().project_db().display()).yellow()
  );
  Ok(())
}

async fn baselines(pipeline: &Pipeline) -> Result<(), BibnetCliError> {
  println!(
    "{} Downloading baselines into {} ({})",
    style(GLOBE).cyan(),
    style(pipeline.settings().baseline_db().display()).yellow(),
    BASELINE_SCHEMA
  );
  let summary = pipeline.baselines().await?;
  println!(
    "{} {} organisations, {} concepts, {} topics",
    style(SUCCESS).green(),
    style(summary.organisations).yellow(),
    style(summary.concepts).yellow(),
    style(summary.topics).yellow()
  );
  Ok(())
}

async fn normalisation(pipeline: &Pipeline, strategy: &SearchStrategy) -> Result<(), BibnetCliError> {
  println!(
    "{} Computing citation baselines into {}",
    style(GLOBE).cyan(),
    style(pipeline.settings().baseline_db().display()).yellow()
  );
  let summary = pipeline.normalisation(strategy).await?;
  debug!("Normalisation summary: {:?}", summary);
  println!(
    "{} {} disciplines x {} publication types: {} rows",
    style(SUCCESS).green(),
    style(summary.groups).yellow(),
    style(summary.types).yellow(),
    style(summary.rows).yellow()
  );
  Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BibnetCliError> {
  let cli = Cli::parse();
  let settings = load_settings(cli.config)?;
  setup_logging(cli.verbose, Some(&settings.log_dir()))?;
  debug!("Using project {} in {}", settings.project().name, settings.data_dir().display());

  match cli.command {
    Commands::Check => {
      let project = settings.project();
      println!("{} Settings are valid", style(SUCCESS).green());
      println!("   {} {}", style("Project:").green().bold(), style(&project.name).white());
      if let Some(variant) = &project.variant {
        println!("   {} {}", style("Variant:").green().bold(), style(variant).white());
      }
      println!(
        "   {} {}..={}",
        style("Years:").green().bold(),
        style(project.start_year).white(),
        style(project.end_year).white()
      );
      println!("   {} {}", style("Project store:").green().bold(), style(settings.project_db().display()).white());
      println!("   {} {}", style("Baseline store:").green().bold(), style(settings.baseline_db().display()).white());
      println!("   {} {}", style("Record cache:").green().bold(), style(settings.raw_cache_path().display()).white());
      Ok(())
    },

    Commands::Strategy { strategy } => {
      let strategy = load_strategy(&settings, strategy)?;
      if strategy.entries().is_empty() {
        println!("{} Search strategy is empty", style(WARNING).yellow());
      }
      for entry in strategy.entries() {
        println!(
          "   {} {}.{} {} {:?}",
          style(&entry.id).cyan().bold(),
          style(&entry.source).white(),
          style(&entry.category).white(),
          style(entry.name.as_deref().unwrap_or("")).yellow(),
          entry.kind
        );
      }
      Ok(())
    },

    Commands::Baselines => baselines(&Pipeline::new(settings)).await,

    Commands::Normalisation { strategy } => {
      let strategy = load_strategy(&settings, strategy)?;
      normalisation(&Pipeline::new(settings), &strategy).await
    },

    Commands::Harvest { strategy } => {
      let strategy = load_strategy(&settings, strategy)?;
      harvest(&Pipeline::new(settings), &strategy).await
    },

    Commands::Build => build(&Pipeline::new(settings)).await,

    Commands::Run { strategy } => {
      let strategy = load_strategy(&settings, strategy)?;
      let pipeline = Pipeline::new(settings);
      if pipeline.settings().baseline_db().exists() {
        println!("{} Baselines already present", style(BOOKS).cyan());
      } else {
        baselines(&pipeline).await?;
      }
      harvest(&pipeline, &strategy).await?;
      build(&pipeline).await
    },

    Commands::Clean { keep_cache } => {
      let store = settings.project_db();
      let cache = settings.raw_cache_path();
      let mut targets = Vec::new();
      if let Some(stem) = store.file_stem().and_then(|s| s.to_str()) {
        let pattern = store.with_file_name(format!("{stem}*.db"));
        targets.extend(glob::glob(&pattern.to_string_lossy())?.flatten());
      }
      if !keep_cache {
        targets.extend([cache, settings.partial_cache_path()].into_iter().filter(|path| path.exists()));
      }

      if targets.is_empty() {
        println!("{} Nothing to clean for {}", style(WARNING).yellow(), style(&settings.project().name).yellow());
        return Ok(());
      }
      for target in &targets {
        println!("{} Found: {}", style(WARNING).yellow(), style(target.display()).yellow());
      }
      if !confirm("Are you sure you want to delete these files?", cli.accept_defaults)? {
        println!("{} Operation cancelled", style("✖").red());
        return Ok(());
      }
      for target in targets {
        trace!("Removing {}", target.display());
        std::fs::remove_file(target)?;
      }
      println!("{} Project files cleaned", style(SUCCESS).green());
      Ok(())
    },
  }
}
