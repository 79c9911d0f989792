use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use smart_dialer::{init_logging, new_dialer, CancelToken, HostDialer, SqliteResultCache};

const CONFIG_FOLDER_NAME: &str = "smart-dialer";

/// Race candidate circumvention strategies against test domains and dial through whichever wins.
#[derive(Parser)]
struct CliArgs {
    /// path to the YAML strategy menu (dns/tls/fallback lists)
    #[arg(short, long)]
    strategy: PathBuf,

    /// a domain known to be censored on this network; repeatable, at least one required
    #[arg(short = 'd', long = "domain", required = true)]
    test_domains: Vec<String>,

    /// "host:port" to dial once a strategy wins, to demonstrate the returned dialer; skipped if absent
    #[arg(long)]
    dial: Option<String>,

    /// path to the strategy-result cache database; defaults under the user config directory
    #[arg(long)]
    cache: Option<PathBuf>,

    /// give up and exit after this many seconds if no strategy has won yet
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = CliArgs::parse();

    let cache_path = match args.cache {
        Some(p) => p,
        None => default_cache_path()?,
    };

    smolscale::block_on(async move {
        let strategy_bytes = std::fs::read(&args.strategy)
            .with_context(|| format!("reading strategy file {}", args.strategy.display()))?;
        let cache = SqliteResultCache::open(Some(&cache_path))
            .await
            .context("opening strategy result cache")?;

        let cancel = match args.timeout_secs {
            Some(secs) => CancelToken::with_deadline(std::time::Duration::from_secs(secs)),
            None => CancelToken::new(),
        };

        let dialer = new_dialer(&args.test_domains, &strategy_bytes, &cache, &cancel, None)
            .await
            .context("no circumvention strategy reached the test domains")?;
        tracing::info!("smart dialer ready");

        if let Some(addr) = args.dial {
            dialer
                .dial_host(&addr)
                .await
                .with_context(|| format!("dialing {addr} through the winning strategy"))?;
            tracing::info!(addr, "dial succeeded");
        }
        anyhow::Ok(())
    })?;
    Ok(())
}

fn default_cache_path() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("could not determine the user config directory")?
        .join(CONFIG_FOLDER_NAME);
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("cache.db"))
}
