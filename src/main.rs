use anyhow::{ensure, Result};
use clap::Parser;
use sheetstream::{
    producers::{server, spreadsheet::Spreadsheet, Registry},
    readers::{DelimitedReader, FsLoader, Loader, MonospaceReader},
};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Serves spreadsheets from a data directory as HTML tables.
#[derive(Parser, Debug)]
struct Args {
    /// Directory holding the `.csv` and `.mon` files
    #[arg(long, default_value = "./data")]
    datadir: PathBuf,

    /// Port to listen on
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(args.log_level.parse().unwrap_or(Level::INFO.into()))
    });
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_target(false)
        .init();

    std::panic::set_hook(Box::new(|info| {
        error!("panic: {}", info);
    }));

    // ─── 2) wire readers ─────────────────────────────────────────────
    ensure!(
        args.datadir.is_dir(),
        "data directory {} does not exist",
        args.datadir.display()
    );
    let loader: Arc<dyn Loader> = Arc::new(FsLoader::new(&args.datadir));

    let registry = Registry::new();
    registry.add_producer(
        "csv",
        Arc::new(Spreadsheet::new(DelimitedReader::new(Arc::clone(&loader)))),
    )?;
    registry.add_producer("mon", Arc::new(Spreadsheet::new(MonospaceReader::new(loader))))?;

    // ─── 3) serve ────────────────────────────────────────────────────
    info!(datadir = %args.datadir.display(), port = args.port, "server starting");
    info!("csv: http://localhost:{}/csv/<name>", args.port);
    info!("mon: http://localhost:{}/mon/<name>", args.port);

    warp::serve(server::routes("/", Arc::new(registry)))
        .run(([0, 0, 0, 0], args.port))
        .await;

    Ok(())
}
