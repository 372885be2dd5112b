mod cli;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands};

use farmhand::api;
use farmhand::config::Config;
use farmhand::dispatcher::{DispatchError, Dispatcher, WaitOutcome};
use farmhand::job::{JobKind, JobParams};
use farmhand::observability::{self, Metrics};
use farmhand::store::StoreClient;
use farmhand::worker::Worker;

const EXIT_INVALID: i32 = 2;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_TIMEOUT: i32 = 4;
const EXIT_TRANSPORT: i32 = 5;

fn exit_code(err: &DispatchError) -> i32 {
    match err {
        DispatchError::Validation(_) => EXIT_INVALID,
        DispatchError::NotFound(_) => EXIT_NOT_FOUND,
        DispatchError::Transport(_) => EXIT_TRANSPORT,
        DispatchError::Internal(_) => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_INVALID);
        }
    };

    observability::init_tracing(config.debug);

    std::process::exit(run(cli, config).await);
}

async fn run(cli: Cli, config: Config) -> i32 {
    let store = match StoreClient::from_config(&config.store) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_TRANSPORT;
        }
    };
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Dispatcher::new(store.clone(), config.dispatcher.clone(), metrics.clone());

    match cli.command {
        Commands::Submit(args) => {
            let kind: JobKind = match args.kind.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    eprintln!("error: {e}");
                    return EXIT_INVALID;
                }
            };

            let mut overrides = BTreeMap::new();
            for pair in &args.params {
                let Some((key, value)) = pair.split_once('=') else {
                    eprintln!("error: --param expects KEY=VALUE, got {pair:?}");
                    return EXIT_INVALID;
                };
                overrides.insert(key.to_string(), serde_json::Value::from(value));
            }

            let params = JobParams {
                script: args.script,
                characters: if args.characters.is_empty() {
                    None
                } else {
                    Some(args.characters)
                },
                output_dir: args.output,
                overrides: if overrides.is_empty() {
                    None
                } else {
                    Some(overrides)
                },
                assets: args.assets,
                extra: BTreeMap::new(),
            };

            let id = match dispatcher.submit(kind, params).await {
                Ok(id) => id,
                Err(e) => {
                    eprintln!("error: {e}");
                    return exit_code(&e);
                }
            };
            println!("{id}");

            if args.wait {
                let timeout = Duration::from_secs(config.dispatcher.wait_timeout_secs);
                return wait_and_report(&dispatcher, &id, timeout).await;
            }
            0
        }

        Commands::Status(args) => match args.id {
            Some(id) => match dispatcher.status(&id).await {
                Ok(status) => {
                    println!("{id}\t{status}");
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit_code(&e)
                }
            },
            None => {
                let manifests = match dispatcher.list() {
                    Ok(manifests) => manifests,
                    Err(e) => {
                        eprintln!("error: {e}");
                        return exit_code(&e);
                    }
                };
                for manifest in manifests {
                    match dispatcher.status(&manifest.job_id).await {
                        Ok(status) => println!("{}\t{status}", manifest.job_id),
                        Err(e) => {
                            eprintln!("error: {e}");
                            return exit_code(&e);
                        }
                    }
                }
                0
            }
        },

        Commands::Wait(args) => {
            let timeout = Duration::from_secs(
                args.timeout.unwrap_or(config.dispatcher.wait_timeout_secs),
            );
            wait_and_report(&dispatcher, &args.id, timeout).await
        }

        Commands::Download(args) => {
            let dest_root = args
                .dest
                .clone()
                .unwrap_or_else(|| config.dispatcher.output_dir.clone());
            let target = dest_root.join(&args.id);
            if target.exists() && !args.force {
                eprintln!(
                    "error: {} already exists (use --force to overwrite)",
                    target.display()
                );
                return EXIT_INVALID;
            }

            match dispatcher.download(&args.id, args.dest.as_deref()).await {
                Ok(files) => {
                    for file in files {
                        println!("{file}");
                    }
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit_code(&e)
                }
            }
        }

        Commands::List => match dispatcher.list() {
            Ok(manifests) => {
                for manifest in manifests {
                    println!(
                        "{}\t{}\t{}",
                        manifest.job_id,
                        manifest.job_type,
                        manifest.created_at.to_rfc3339()
                    );
                }
                0
            }
            Err(e) => {
                eprintln!("error: {e}");
                exit_code(&e)
            }
        },

        Commands::Worker => {
            let worker = Worker::new(store, config.worker.clone(), config.debug, metrics);
            match worker.run().await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("error: {e}");
                    EXIT_TRANSPORT
                }
            }
        }

        Commands::Serve(args) => {
            let address = args.address.unwrap_or(config.server.bind_addr);
            let state = api::state::AppState::new(config, dispatcher, metrics);
            match api::run(address, state).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }

        Commands::Reap(args) => {
            match dispatcher
                .reap(Duration::from_secs(args.older_than_secs))
                .await
            {
                Ok(requeued) => {
                    for id in requeued {
                        println!("{id}");
                    }
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit_code(&e)
                }
            }
        }
    }
}

async fn wait_and_report(dispatcher: &Dispatcher, id: &str, timeout: Duration) -> i32 {
    match dispatcher.wait(id, timeout).await {
        Ok(WaitOutcome::Completed) => {
            println!("{id}\tcompleted");
            0
        }
        Ok(WaitOutcome::TimedOut) => {
            eprintln!("error: timed out waiting for {id}");
            EXIT_TIMEOUT
        }
        Err(e) => {
            eprintln!("error: {e}");
            exit_code(&e)
        }
    }
}
