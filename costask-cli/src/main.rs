use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use costask::{
    objstore::{CosStorage, HttpRangeReader, MemoryStorage, ObjectLocation},
    summarize, ConcatFileTask, ConcatParams, Config, CosTaskError, DeleteFileTask, DeleteParams,
    TaskOutcome, TriggerEvent,
};
use serde::Serialize;
use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};
use url::Url;

/// Concatenate or bulk-delete objects in Tencent Cloud Object Storage (COS)
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: Config,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    /// Don't modify anything in COS.
    ///
    /// `concat` still signs and reads the sources, but uploads the result into memory and
    /// discards it, which checks that every source is readable.  `delete` runs against an empty
    /// in-memory object store, which shows how an event would be interpreted.
    #[clap(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Concatenate source objects, in the order given, into one target object
    Concat {
        /// URL of the object to write the concatenation to.
        ///
        /// Must be a COS object URL like
        /// https://examplebucket-1250000000.cos.ap-guangzhou.myqcloud.com/dir/all.mp4
        #[clap(short = 't', long, value_parser, value_name = "URL")]
        target: Url,

        /// URLs of the source objects.
        ///
        /// COS object URLs are signed with the configured credentials; any other URL must be
        /// readable as-is, for example because it's already signed.
        #[clap(value_parser, required = true, value_name = "URLS")]
        sources: Vec<Url>,
    },

    /// Delete objects, coalescing the deletes into bulk delete calls
    Delete {
        /// Read a trigger event (JSON) from this file, or from stdin if the path is `-`, and
        /// delete the objects it names
        #[clap(short = 'e', long, value_parser, value_name = "PATH")]
        event: Option<PathBuf>,

        /// URLs of COS objects to delete, in addition to any named by the event
        #[clap(value_parser, value_name = "URLS")]
        objects: Vec<Url>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_logging(&args.globals);

    let succeeded = match args.command {
        Command::Concat { target, sources } => {
            let target = ObjectLocation::parse_cos_url(&target)?;
            let params = ConcatParams {
                source_list: sources,
                target,
            };

            let signer = CosStorage::new(args.config.clone());
            let reader = HttpRangeReader::new(&args.config);
            let mut task = if args.globals.dry_run {
                ConcatFileTask::new(
                    params,
                    args.config,
                    Box::new(signer),
                    Box::new(reader),
                    Box::new(MemoryStorage::new()),
                )
            } else {
                ConcatFileTask::new(
                    params,
                    args.config,
                    Box::new(signer.clone()),
                    Box::new(reader),
                    Box::new(signer),
                )
            };

            report("concat", task.run_task().await)?
        }
        Command::Delete { event, objects } => {
            let mut params = match event {
                Some(path) => DeleteParams::from(TriggerEvent::parse_str(&read_event(&path)?)?),
                None => DeleteParams::new(Vec::new()),
            };
            for url in &objects {
                params.source_list.push(ObjectLocation::parse_cos_url(url)?);
            }

            if params.source_list.is_empty() {
                return Err(eyre!("No objects to delete"));
            }

            let task = if args.globals.dry_run {
                DeleteFileTask::new(params, args.config, Box::new(MemoryStorage::new()))
            } else {
                let storage = CosStorage::new(args.config.clone());
                DeleteFileTask::new(params, args.config, Box::new(storage))
            };
            let task = Arc::new(task);

            // Stop scheduling deletes on Ctrl-C; deletes already sent are allowed to finish
            {
                let task = task.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted; waiting for pending deletes to finish");
                        task.cancel_task(CosTaskError::TaskQueueCancelled {
                            reason: "interrupted".to_string(),
                        });
                    }
                });
            }

            report("delete", task.run_task().await)?
        }
    };

    if !succeeded {
        std::process::exit(1);
    }

    Ok(())
}

/// Log a summary of the outcome, print the outcome itself to stdout, and return whether the task
/// succeeded
fn report<P: Serialize, R: Serialize>(
    name: &str,
    outcome: TaskOutcome<P, R>,
) -> color_eyre::Result<bool> {
    let succeeded = outcome.is_ok();
    let outcome = [outcome];

    for message in summarize(name, &outcome).messages {
        info!("{message}");
    }

    println!("{}", serde_json::to_string_pretty(&outcome[0])?);

    Ok(succeeded)
}

fn read_event(path: &Path) -> color_eyre::Result<String> {
    let mut event = String::new();

    if path.as_os_str() == "-" {
        std::io::stdin()
            .read_to_string(&mut event)
            .wrap_err("Error reading event from stdin")?;
    } else {
        event = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Error reading event from '{}'", path.display()))?;
    }

    Ok(event)
}

fn init_logging(globals: &Globals) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = if globals.verbose {
        "costask=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "costask=info,warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
