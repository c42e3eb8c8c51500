use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use parallel_sign::client::{HttpClient, SigningClient, DEFAULT_BASE_URL};
use parallel_sign::config::{ConfigStore, StamperType};
use parallel_sign::harness::{self, DispatchMode};
use parallel_sign::isolated::ContextHost;
use parallel_sign::provider;
use parallel_sign::stamper::ApiKeyStamper;

/// Parallel signing benchmark for a remote key-management API.
#[derive(Parser, Debug)]
#[command(name = "parallel-sign")]
#[command(about = "Benchmark concurrent sign-raw-payload requests", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Directory holding the persisted configuration
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Edit the persisted configuration; each flag is saved immediately
    Configure {
        #[arg(long)]
        organization_id: Option<String>,

        #[arg(long)]
        api_public_key: Option<String>,

        #[arg(long)]
        api_private_key: Option<String>,

        /// Address or private key id to sign with
        #[arg(long)]
        sign_with: Option<String>,

        /// Number of signatures per run; zero or less is an empty run
        #[arg(long, allow_hyphen_values = true)]
        num_signatures: Option<i64>,

        /// How requests are stamped
        #[arg(long, value_enum)]
        stamper_type: Option<StamperArg>,
    },

    /// Print the configuration with the private key masked
    Show,

    /// Generate a P-256 API key pair
    Keygen {
        /// Store the generated pair in the configuration
        #[arg(long)]
        save: bool,
    },

    /// Run one benchmark with the persisted configuration
    Run {
        /// API base URL
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,

        /// Only build and stamp requests; send nothing but the identity check
        #[arg(long)]
        stamp_only: bool,

        /// How long to wait for the isolated context to start
        #[arg(long, default_value_t = 10_000)]
        init_timeout_ms: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StamperArg {
    ApiKey,
    Iframe,
}

impl From<StamperArg> for StamperType {
    fn from(arg: StamperArg) -> Self {
        match arg {
            StamperArg::ApiKey => StamperType::ApiKey,
            StamperArg::Iframe => StamperType::Iframe,
        }
    }
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = real_main(cli) {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main(cli: Cli) -> Result<()> {
    let store = match cli.state_dir {
        Some(dir) => ConfigStore::new(dir),
        None => ConfigStore::from_env(),
    };

    match cli.command {
        Command::Configure {
            organization_id,
            api_public_key,
            api_private_key,
            sign_with,
            num_signatures,
            stamper_type,
        } => {
            // One write per edited field, like a form saving on every change.
            if let Some(v) = organization_id {
                store.update(|c| c.organization_id = v)?;
            }
            if let Some(v) = api_public_key {
                store.update(|c| c.api_public_key = v)?;
            }
            if let Some(v) = api_private_key {
                store.update(|c| c.api_private_key = v)?;
            }
            if let Some(v) = sign_with {
                store.update(|c| c.sign_with = v)?;
            }
            if let Some(v) = num_signatures {
                store.update(|c| c.num_signatures = v)?;
            }
            if let Some(v) = stamper_type {
                store.update(|c| c.stamper_type = v.into())?;
            }
            let cfg = store.load()?;
            println!("Saved {}", store.path().display());
            print_config(&cfg.masked())?;
        }
        Command::Show => {
            let cfg = store
                .load()
                .with_context(|| format!("failed to load {}", store.path().display()))?;
            print_config(&cfg.masked())?;
        }
        Command::Keygen { save } => {
            let key = ApiKeyStamper::generate();
            println!("API public key:  {}", key.public_key_hex());
            println!("API private key: {}", key.private_key_hex());
            if save {
                store.update(|c| {
                    c.api_public_key = key.public_key_hex().to_string();
                    c.api_private_key = key.private_key_hex();
                })?;
                println!("Saved {}", store.path().display());
            }
        }
        Command::Run {
            base_url,
            stamp_only,
            init_timeout_ms,
        } => {
            let cfg = store
                .load()
                .with_context(|| format!("failed to load {}", store.path().display()))?;
            let mode = if stamp_only {
                DispatchMode::StampOnly
            } else {
                DispatchMode::Submit
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;

            let result = runtime.block_on(async {
                let stamper = provider::build_stamper(
                    &cfg,
                    ContextHost::global(),
                    Duration::from_millis(init_timeout_ms),
                )
                .await
                .context("failed to build stamper")?;
                let client: Arc<dyn SigningClient> = Arc::new(
                    HttpClient::new(&base_url, stamper).context("failed to build API client")?,
                );
                info!(base_url = %base_url, count = cfg.request_count(), "starting run");
                harness::run(client, &cfg, mode)
                    .await
                    .context("parallel signing run failed")
            })?;

            println!("{result}");
        }
    }

    Ok(())
}

fn print_config(cfg: &parallel_sign::config::Configuration) -> Result<()> {
    let json = serde_json::to_string_pretty(cfg).context("failed to encode configuration")?;
    println!("{json}");
    Ok(())
}
