//! famly-sync: incrementally mirrors a child's Famly photos, videos and files
//! to local disk.
//!
//! Media is enumerated from the tagged-images REST endpoint and, optionally,
//! the observations GraphQL feed. Each run only downloads what is not already
//! on disk and newer than the per-child watermark kept in the credential
//! cache, so a run can be interrupted and restarted at any point.

#![warn(clippy::all)]

mod cli;
mod config;
mod credentials;
mod download;
mod famly;
mod lock;
mod login;
pub mod retry;
mod shutdown;
mod sync;
mod types;

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use credentials::{Credential, CredentialStore};
use download::{paths, DownloadEngine, EngineConfig};
use famly::ApiClient;
use login::{CredentialSource, TokenLogin};

/// Per-request timeout for API calls. Media downloads only bound the connect.
const API_TIMEOUT: Duration = Duration::from_secs(60);

fn sync_options(config: &config::Config) -> sync::SyncOptions {
    sync::SyncOptions {
        sources: config.sources,
        include_messages: config.messages,
        plan: sync::PlanOptions {
            full_refetch: config.full,
            until_found: config.until_found,
            not_before: config.not_before,
        },
        resolution: config.resolution,
        page_size: config.page_size,
        observation_page_size: config.observation_page_size,
        dry_run: config.dry_run,
        ..sync::SyncOptions::default()
    }
}

/// Cached profiles for the requested children, or every cached profile when
/// none were named. Children without a cached profile are left out.
fn select_profiles(
    store: &CredentialStore,
    cached: Vec<Credential>,
    wanted: &[String],
) -> Result<Vec<Credential>, credentials::CredentialError> {
    if wanted.is_empty() {
        return Ok(cached);
    }
    let mut picked = Vec::new();
    for id in wanted {
        if let Some(credential) = store.load(Some(id.as_str()))? {
            picked.push(credential);
        }
    }
    Ok(picked)
}

/// Whether the login collaborator has to run before syncing: on `--login`,
/// with no usable profile, when a requested child is missing from the cache,
/// or when an explicit token differs from the cached one.
fn needs_login(config: &config::Config, profiles: &[Credential]) -> bool {
    let token_changed = config
        .access_token
        .as_deref()
        .is_some_and(|token| profiles.iter().any(|p| p.access_token != token));
    config.login
        || profiles.is_empty()
        || profiles.len() < config.child_ids.len()
        || token_changed
}

/// Run the sync command.
async fn run_sync(args: cli::SyncArgs) -> anyhow::Result<()> {
    let config = config::Config::from_sync_args(args)?;
    tracing::debug!(?config, "Resolved configuration");

    let run_lock = lock::SyncLock::acquire(&config.output_dir).await?;
    tracing::debug!("Holding {}", run_lock.path().display());
    let store = CredentialStore::new(&config.output_dir);

    // A corrupt cache stops the run here, before any request is made.
    let cached = store.load_all().with_context(|| {
        format!(
            "Cannot read credential cache {}; fix or remove it, then run with --login",
            store.path().display()
        )
    })?;

    let client = ApiClient::new(config.api_base.as_str(), config.retry, API_TIMEOUT)?;

    let mut profiles = select_profiles(&store, cached, &config.child_ids)?;

    if needs_login(&config, &profiles) {
        let source = TokenLogin::new(
            client.clone(),
            config.access_token.clone(),
            config.child_ids.clone(),
        );
        let grant = source.acquire().await?;
        let granted: HashSet<String> = grant.children.iter().map(|c| c.id.clone()).collect();
        for credential in grant.into_credentials() {
            store.save(&credential)?;
        }
        // Reload so each profile carries the watermark the store preserved.
        profiles = store
            .load_all()?
            .into_iter()
            .filter(|c| granted.contains(&c.child_id))
            .collect();
        tracing::info!("Saved credentials to {}", store.path().display());
    }

    if profiles.is_empty() {
        anyhow::bail!("No children to sync");
    }

    let engine = DownloadEngine::new(
        EngineConfig {
            workers: config.workers,
            retry: config.retry,
            dry_run: config.dry_run,
            no_progress_bar: config.no_progress_bar,
        },
        &config.api_base,
    )?;
    let options = sync_options(&config);
    let shutdown_token = shutdown::install_signal_handler()?;

    tracing::info!(
        workers = config.workers,
        children = profiles.len(),
        "Starting famly-sync"
    );

    let multiple = profiles.len() > 1;
    let mut failed = 0usize;
    let mut stalled = 0usize;

    for credential in &profiles {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, skipping remaining children");
            break;
        }

        let destination = paths::child_directory(&config.output_dir, credential, multiple);
        let outcome = sync::sync_child(
            &client,
            &engine,
            &store,
            credential,
            &destination,
            &options,
            shutdown_token.clone(),
        )
        .await;

        match outcome {
            Ok(result) => {
                result.log_summary(credential.display_name(), &destination);
                failed += result.failed.len();
                stalled += result.stalls.len();
            }
            Err(e) if e.is_auth() => {
                anyhow::bail!(
                    "Access token rejected while syncing {}: {}\n\
                     Run `famly-sync sync --login` with a fresh token.",
                    credential.display_name(),
                    e
                );
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Sync failed for {}", credential.display_name()));
            }
        }
    }

    if stalled > 0 {
        anyhow::bail!(
            "{} source(s) stopped returning pages; the archive may be incomplete",
            stalled
        );
    }
    if failed > 0 {
        anyhow::bail!("{} downloads failed", failed);
    }
    Ok(())
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let (output_dir, _) = config::resolve_target(&args.target)?;
    let store = CredentialStore::new(&output_dir);
    let profiles = store.load_all()?;

    if profiles.is_empty() {
        println!("No cached children in {}", store.path().display());
        println!("Run a sync first to create the cache.");
        return Ok(());
    }

    println!("Credential cache: {}", store.path().display());
    let multiple = profiles.len() > 1;
    for profile in &profiles {
        let dir = paths::child_directory(&output_dir, profile, multiple);
        let files = paths::ExistingMedia::scan(&dir)
            .with_context(|| format!("Failed to scan {}", dir.display()))?
            .len();

        println!();
        println!("{} ({})", profile.display_name(), profile.child_id);
        println!("  Directory:  {}", dir.display());
        println!("  Files:      {}", files);
        match profile.last_sync_timestamp {
            Some(ts) => println!("  Watermark:  {}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("  Watermark:  never synced"),
        }
    }

    Ok(())
}

/// Run the list-children command.
async fn run_list_children(args: cli::ListChildrenArgs) -> anyhow::Result<()> {
    let (output_dir, api_base) = config::resolve_target(&args.target)?;

    let token = match args
        .access_token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
    {
        Some(token) => token,
        None => CredentialStore::new(&output_dir)
            .load_all()?
            .into_iter()
            .next()
            .map(|c| c.access_token)
            .ok_or_else(|| {
                anyhow::anyhow!("No access token: pass --access-token or run a sync first")
            })?,
    };

    let client = ApiClient::new(api_base.as_str(), retry::RetryConfig::default(), API_TIMEOUT)?;
    let children = client
        .fetch_children(&token)
        .await
        .context("Failed to list children")?;

    if children.is_empty() {
        println!("No children visible to this token.");
        return Ok(());
    }
    println!("Children:");
    for child in children {
        println!("  {}  {}", child.id, child.name.as_deref().unwrap_or("Unknown"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Sync(args) => run_sync(args).await,
        Command::Status(args) => run_status(args).await,
        Command::ListChildren(args) => run_list_children(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&Credential::new("a", "t")).unwrap();
        store.save(&Credential::new("b", "t")).unwrap();
        let cached = store.load_all().unwrap();

        assert_eq!(select_profiles(&store, cached.clone(), &[]).unwrap().len(), 2);
        let picked = select_profiles(&store, cached, &["b".to_string(), "z".to_string()]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].child_id, "b");
    }

    fn config(extra: &[&str]) -> config::Config {
        let mut argv = vec!["famly-sync", "sync", "--output", "/tmp/famly"];
        argv.extend_from_slice(extra);
        match cli::Cli::try_parse_from(argv).unwrap().command {
            Command::Sync(args) => config::Config::from_sync_args(args).unwrap(),
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_needs_login() {
        let cached = vec![Credential::new("a", "old-token")];

        assert!(!needs_login(&config(&[]), &cached));
        assert!(needs_login(&config(&["--login"]), &cached));
        assert!(needs_login(&config(&[]), &[]));
        assert!(needs_login(&config(&["--child-id", "a,b"]), &cached));
        assert!(!needs_login(&config(&["--access-token", "old-token"]), &cached));
    }

    #[test]
    fn test_explicit_new_token_replaces_cached_one() {
        let cached = vec![Credential::new("a", "old-token")];
        assert!(needs_login(&config(&["--access-token", "new-token"]), &cached));
        assert!(needs_login(
            &config(&["--access-token", "new-token", "--child-id", "a"]),
            &cached
        ));
    }
}
