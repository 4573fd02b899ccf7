//! acme-store - inspect the ACME state persisted in a Kubernetes Secret

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use acme_store::{codec, KubernetesBackend, KubernetesStore, Store, StoreConfig};

/// Inspect ACME account, certificate and challenge state stored in a Secret
#[derive(Parser, Debug)]
#[command(name = "acme-store")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "ACME_STORE_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace holding the storage secret (overrides configuration)
    #[arg(short = 'n', long = "namespace")]
    namespace: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit
    Check,
    /// Print a summary of the stored state
    Inspect,
    /// Print the stored state as JSON
    Dump,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let mut config =
        StoreConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    config.validate().context("Configuration validation failed")?;

    match cli.command {
        Commands::Check => {
            println!(
                "acme-store: configuration is valid (secret {}/{} via {})",
                config.namespace, config.secret_name, config.api_server
            );
            Ok(())
        }
        Commands::Inspect => with_store(&config, |store| {
            print_summary(store);
            Ok(())
        }),
        Commands::Dump => with_store(&config, |store| {
            let payload = codec::encode(&store.snapshot()).context("Failed to encode state")?;
            println!("{}", String::from_utf8_lossy(&payload));
            Ok(())
        }),
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn with_store(
    config: &StoreConfig,
    f: impl FnOnce(&KubernetesStore) -> Result<()>,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let store = open_store(config).await?;
        let result = f(&store);
        store.shutdown().await;
        result
    })
}

async fn open_store(config: &StoreConfig) -> Result<KubernetesStore> {
    let backend =
        KubernetesBackend::from_config(config).context("Failed to create Kubernetes backend")?;
    KubernetesStore::new(config, backend)
        .await
        .context("Failed to load ACME state")
}

fn print_summary(store: &KubernetesStore) {
    info!(namespace = %store.namespace(), "Inspecting ACME state");

    match store.get_account() {
        Some(account) => println!("account: {} ({})", account.email, account.key_type),
        None => println!("account: <none>"),
    }

    let certificates = store.get_certificates();
    println!("certificates: {}", certificates.len());
    for cert in &certificates {
        println!("  - {}", cert.domain.all().collect::<Vec<_>>().join(", "));
    }

    let data = store.snapshot();
    println!("http-01 challenges: {}", data.http_challenges.len());
    for (token, domains) in &data.http_challenges {
        let domains: Vec<&str> = domains.keys().map(String::as_str).collect();
        println!("  - {}: {}", token, domains.join(", "));
    }

    println!("tls-alpn-01 challenges: {}", data.tls_challenges.len());
    for domain in data.tls_challenges.keys() {
        println!("  - {}", domain);
    }
}
