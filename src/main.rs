//! Searcher entry point

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use searcher::cli::ArchiveSource;
use searcher::fetch::{ArchiveFetcher, GitserverFetcher, LocalGitFetcher};
use searcher::{debug_server, socket_server};
use searcher::{ArchiveCache, Cli, SearchExecutor, SearchService, SearcherError};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            match e.downcast_ref::<SearcherError>() {
                Some(err) => err.exit_code(),
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    cli.validate()?;

    // The blocking HTTP client owns its own runtime and must be built
    // outside of ours.
    let fetcher: Arc<dyn ArchiveFetcher> = match cli.archive_source()? {
        ArchiveSource::Gitservers(addrs) => Arc::new(GitserverFetcher::new(addrs)?),
        ArchiveSource::Local(root) => Arc::new(LocalGitFetcher::new(root)),
    };
    tracing::info!(
        "Starting searcher v{} (archives from {})",
        env!("CARGO_PKG_VERSION"),
        fetcher.describe()
    );

    let config = cli.cache_config();
    tracing::info!(
        root = %config.root.display(),
        max_size_bytes = config.max_size_bytes,
        max_concurrent_fetches = config.max_concurrent_fetches,
        "Archive cache"
    );

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| SearcherError::config(format!("Failed to create async runtime: {}", e)))?;

    let grace = cli.shutdown_grace();
    let outcome = runtime.block_on(async move {
        let cache = ArchiveCache::new(config, fetcher);
        let restored = cache.start()?;
        tracing::info!("Restored {} cached archives", restored);

        let executor = Arc::new(SearchExecutor::new(cli.workers())?);
        let service = SearchService::new(cache.clone(), executor, cli.max_request_duration());

        let listener = TcpListener::bind(cli.listen)
            .await
            .with_context(|| format!("Failed to bind {}", cli.listen))?;

        let shutdown = CancellationToken::new();

        let debug = match cli.prof_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind debug listener {}", addr))?;
                Some(tokio::spawn(debug_server::serve(
                    listener,
                    cache.clone(),
                    shutdown.clone(),
                )))
            }
            None => None,
        };

        tokio::spawn(socket_server::shutdown_on(
            tokio::signal::ctrl_c(),
            shutdown.clone(),
        ));

        socket_server::serve(listener, service, shutdown.clone(), cli.shutdown_grace()).await;

        shutdown.cancel();
        if let Some(debug) = debug {
            if let Ok(Err(e)) = debug.await {
                tracing::warn!("Debug listener failed: {}", e);
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    // Abandoned fetch threads may still be parked on a stalled transport.
    runtime.shutdown_timeout(grace);
    outcome
}
