use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use drive_core::DriveClient;
use telemsync::auth::resolve_access_token;
use telemsync::config::RunConfig;
use telemsync::pipeline::Pipeline;
use telemsync::remote::DriveStore;
use telemsync::sync::pool::HandlePool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct CliOptions {
    help: bool,
    rebuild_tree: bool,
    fresh_ledger: bool,
}

fn parse_cli<I>(args: I) -> anyhow::Result<CliOptions>
where
    I: IntoIterator<Item = String>,
{
    let mut options = CliOptions::default();
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--rebuild-tree" => options.rebuild_tree = true,
            "--fresh-ledger" => options.fresh_ledger = true,
            "--help" | "-h" => options.help = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(options)
}

fn print_usage() {
    println!("Usage: telemsync [--rebuild-tree] [--fresh-ledger]");
    println!("  --rebuild-tree   List remote folders instead of using the saved tree");
    println!("  --fresh-ledger   Ignore the processed-files ledger for this run");
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telemsync=info")),
        )
        .init();

    let options = parse_cli(std::env::args())?;
    if options.help {
        print_usage();
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = RunConfig::from_env().context("invalid configuration")?;
    if options.fresh_ledger {
        config.ledger.fresh_start = true;
    }

    let token = resolve_access_token(&config.credentials, None)
        .await
        .context("failed to obtain an access token")?;
    let handles = (0..config.handles.max(1))
        .map(|_| DriveClient::new(token.clone()).map(DriveStore::new))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to build drive client")?;
    let pool = HandlePool::new(handles).context("failed to build handle pool")?;

    info!(
        root = %config.root.display(),
        drivers = config.drivers.len(),
        handles = pool.size(),
        "starting run"
    );
    let summary = Pipeline::new(config, Arc::new(pool))
        .with_rebuild_tree(options.rebuild_tree)
        .run()
        .await
        .context("run aborted")?;

    for failure in &summary.failed {
        error!(item = %failure.name, reason = %failure.reason, "not converted");
    }
    println!(
        "converted {}, failed {}, already done {}",
        summary.succeeded.len(),
        summary.failed.len(),
        summary.skipped.len()
    );
    Ok(if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
