use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gsf_adapters::{fetch_catalog, EmailApiSender, FormPostWriter, NormalizerConfig};
use gsf_catalog::{facet_options, CatalogFilter};
use gsf_core::NotificationRequest;
use gsf_notify::{
    maybe_build_scheduler, request_notification, sign_up, NotifyConfig, NotifyPipeline,
    SignupError,
};
use gsf_storage::{FeedFetcher, FileIdentityStore, HttpClientConfig};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "gsf-cli")]
#[command(about = "Grant Scheme Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List schemes with display filters applied.
    Schemes {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        funding_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Print the distinct filter values instead of the listing.
        #[arg(long)]
        facets: bool,
    },
    /// Run one notification check.
    Check,
    /// Keep running scheduled notification checks until interrupted.
    Watch,
    /// Register as a subscriber.
    Signup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Ask to be notified when a specific scheme opens.
    NotifyMe {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        program: String,
        #[arg(long)]
        organization: String,
    },
}

fn build_fetcher(config: &NotifyConfig) -> Result<FeedFetcher> {
    FeedFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

async fn build_pipeline(config: NotifyConfig) -> Result<NotifyPipeline> {
    let sender = Arc::new(EmailApiSender::new(config.sender.clone())?);
    NotifyPipeline::new(config, sender).await
}

fn print_summary(summary: &gsf_notify::NotifyRunSummary) {
    println!(
        "check complete: run_id={} schemes={} requests={} matches={} dispatched={} already_notified={} failures={} dropped_rows={}",
        summary.run_id,
        summary.schemes,
        summary.requests,
        summary.matches,
        summary.dispatched,
        summary.already_notified,
        summary.dispatch_failures,
        summary.dropped_rows
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NotifyConfig::from_env();

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Schemes {
            category,
            funding_type,
            status,
            facets,
        } => {
            let fetcher = build_fetcher(&config)?;
            let batch = fetch_catalog(
                &fetcher,
                Uuid::new_v4(),
                &config.catalog_url,
                &NormalizerConfig::default(),
            )
            .await?;
            let today = Utc::now().date_naive();

            if facets {
                let options = facet_options(&batch.items, today);
                println!("categories: {}", options.categories.join(", "));
                println!("funding types: {}", options.funding_types.join(", "));
                println!("statuses: {}", options.statuses.join(", "));
            } else {
                let filter = CatalogFilter {
                    category,
                    funding_type,
                    status,
                };
                let schemes = filter.apply(&batch.items, today);
                for scheme in &schemes {
                    let deadline = scheme
                        .deadline
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "no deadline".to_string());
                    println!(
                        "[{}] {} | {} | {} | {}",
                        scheme.status_on(today),
                        scheme.title,
                        scheme.organization,
                        deadline,
                        scheme.apply_link
                    );
                }
                println!("{} schemes listed", schemes.len());
            }

            if !batch.row_errors.is_empty() {
                eprintln!("{} catalog rows dropped as unparsable", batch.row_errors.len());
            }
        }
        Commands::Check => {
            let pipeline = build_pipeline(config).await?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Watch => {
            let mut config = config;
            config.scheduler_enabled = true;
            let cron = config.check_cron.clone();
            let pipeline = Arc::new(build_pipeline(config).await?);

            let Some(mut scheduler) = maybe_build_scheduler(pipeline).await? else {
                bail!("scheduler could not be constructed");
            };
            scheduler.start().await?;
            println!("watching on cron '{cron}'; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            println!("stopping");
        }
        Commands::Signup { name, email } => {
            let fetcher = build_fetcher(&config)?;
            let writer = FormPostWriter::new(config.registrant_write_url.clone())?;
            let identity_store =
                FileIdentityStore::new(config.identity_path.clone(), config.identity_ttl());

            match sign_up(
                &fetcher,
                &writer,
                &identity_store,
                &config.registrant_url,
                &name,
                &email,
            )
            .await
            {
                Ok(identity) => println!("signed up as {} <{}>", identity.name, identity.email),
                Err(SignupError::Duplicate(detail)) => {
                    eprintln!("already registered: {detail}");
                }
                Err(SignupError::InvalidEmail(detail)) => {
                    eprintln!("invalid email address: {detail}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::NotifyMe {
            name,
            email,
            program,
            organization,
        } => {
            let fetcher = build_fetcher(&config)?;
            let writer = FormPostWriter::new(config.subscription_write_url.clone())?;
            let request = NotificationRequest {
                name,
                email,
                program,
                organization,
            };

            match request_notification(&fetcher, &writer, &config.subscription_url, &request).await
            {
                Ok(()) => println!(
                    "notification request recorded for '{}' by '{}'",
                    request.program, request.organization
                ),
                Err(SignupError::Duplicate(detail)) => {
                    eprintln!("already requested: {detail}");
                }
                Err(SignupError::InvalidEmail(detail)) => {
                    eprintln!("invalid email address: {detail}");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(())
}
