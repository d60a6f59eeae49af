use clap::Parser;
use mongo_backup::{DumpConfig, MongoDumper};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// source database uri, begins with 'mongodb://'.
    #[clap(short, long)]
    uri: String,
    /// database to dump.
    #[clap(short, long)]
    db: String,
    /// collections to dump; all collections of the database when not given.
    #[clap(short, long)]
    colls: Vec<String>,
    /// dump output directory.
    #[clap(short, long, default_value = "dump")]
    output: PathBuf,
    /// capture the oplog window alongside the data dump; requires a replica set target.
    #[clap(long)]
    oplog: bool,
    /// how many collections to dump concurrently.
    #[clap(long)]
    collection_concurrent: Option<usize>,
    /// how many reader threads to use inside one large collection.
    #[clap(long)]
    doc_concurrent: Option<usize>,
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

    let colls = if opts.colls.is_empty() {
        None
    } else {
        Some(opts.colls)
    };
    let conf = DumpConfig::new(
        opts.uri,
        opts.db,
        colls,
        opts.output,
        opts.oplog,
        opts.collection_concurrent,
        opts.doc_concurrent,
    );

    let dumper = match MongoDumper::new(&conf) {
        Ok(dumper) => dumper,
        Err(e) => {
            error!(?e, "Failed to set up dump.");
            std::process::exit(1);
        }
    };
    match dumper.dump() {
        Ok(manifest) => {
            let total: u64 = manifest.collections().values().sum();
            info!(
                collections = manifest.collections().len(),
                documents = total,
                oplog = manifest.window().is_some(),
                "Dump succeeded."
            );
            Ok(())
        }
        Err(e) => {
            error!(?e, "Dump failed.");
            std::process::exit(1);
        }
    }
}
