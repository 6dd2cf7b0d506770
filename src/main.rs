//! Taggable - print tag counts as JSON
//!
//! Usage: `taggable [TYPE] [--at-least N] [--at-most N]`
//!
//! Configuration is read from `$TAGGABLE_CONFIG` (default `taggable.yml`)
//! with `TAGGABLE_*` environment overrides. Without a type, counts cover
//! every taggable type.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taggable::{
    config::Config,
    db::{
        self,
        repositories::{SqlxTagRepository, SqlxTaggingRepository},
    },
    models::{CountFilter, EntityScope},
    services::{TagService, TaggableRegistry, TaggableService},
};

/// Command line arguments
#[derive(Debug, Default, PartialEq)]
struct CountArgs {
    taggable_type: Option<String>,
    filter: CountFilter,
}

impl CountArgs {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--at-least" | "--at-most" => {
                    let value = args
                        .next()
                        .with_context(|| format!("{} requires a number", arg))?;
                    let count: i64 = value
                        .parse()
                        .with_context(|| format!("Invalid count for {}: {}", arg, value))?;
                    if arg == "--at-least" {
                        parsed.filter.at_least = Some(count);
                    } else {
                        parsed.filter.at_most = Some(count);
                    }
                }
                flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
                name => {
                    if parsed.taggable_type.is_some() {
                        bail!("Only one taggable type can be given");
                    }
                    parsed.taggable_type = Some(name.to_string());
                }
            }
        }

        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taggable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CountArgs::parse(std::env::args().skip(1))?;

    // Load configuration
    let config_path =
        std::env::var("TAGGABLE_CONFIG").unwrap_or_else(|_| "taggable.yml".to_string());
    let config = Config::load_with_env(Path::new(&config_path))?;
    tracing::info!("Configuration loaded from {}", config_path);

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    // Run migrations
    db::migrations::run_migrations(&pool).await?;

    let registry = TaggableRegistry::resolve(&pool, &config.tagging).await?;
    tracing::info!("{} taggable type(s) registered", registry.len());

    let tag_repo = SqlxTagRepository::boxed(pool.clone());
    let counts = match &args.taggable_type {
        Some(taggable_type) => {
            let service = TaggableService::new(
                Arc::new(registry),
                tag_repo,
                SqlxTaggingRepository::boxed(pool.clone()),
                &config.tagging,
            );
            service
                .tag_counts_for_type(taggable_type, &args.filter, &EntityScope::all())
                .await?
        }
        None => TagService::new(tag_repo).counts(&args.filter).await?,
    };

    println!("{}", serde_json::to_string_pretty(&counts)?);

    pool.close().await;
    Ok(())
}
