use clap::Parser;
use mongo_backup::{DuplicatePolicy, MongoRestorer, RestoreConfig};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// target database uri, begins with 'mongodb://'.
    #[clap(short, long)]
    uri: String,
    /// dump directory to restore from.
    #[clap(short, long, default_value = "dump")]
    source: PathBuf,
    /// fail the restore on the first document the target already holds,
    /// instead of skipping it.
    #[clap(long)]
    abort_on_duplicate: bool,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap();
            let file_name = path.file_name().unwrap().to_str().unwrap();
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let policy = if opts.abort_on_duplicate {
        Some(DuplicatePolicy::Abort)
    } else {
        None
    };
    let conf = RestoreConfig::new(opts.uri, opts.source, policy);

    let restorer = match MongoRestorer::new(&conf) {
        Ok(restorer) => restorer,
        Err(e) => {
            error!(?e, "Failed to set up restore.");
            std::process::exit(1);
        }
    };
    match restorer.restore() {
        Ok(stats) => {
            info!(
                loaded = stats.loaded,
                skipped = stats.skipped,
                applied = stats.applied,
                "Restore succeeded."
            );
            Ok(())
        }
        Err(e) => {
            error!(?e, "Restore failed.");
            std::process::exit(1);
        }
    }
}
