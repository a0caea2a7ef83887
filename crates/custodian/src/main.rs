#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use custodian::{
    cloud_backup::{self, codec::SUPPORTED_VERSIONS, CloudBackup},
    doctor,
    keys::{AppKeysGenerator, AppPrivateKeyDao, BitcoinNetworkType},
    paths::CustodianPaths,
    secure_store::{load_or_create_machine_secret, SecureStore},
    store::ConfigStore,
};
use eyre::Context as _;
use std::{io::Write as _, path::PathBuf};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "custodian", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print resolved paths (useful for debugging).
    Paths,

    /// Print a quick self-diagnostic report (safe to paste; contains no secrets).
    Doctor {
        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Generate an app key bundle into the local secure store and print its public half.
    Keygen {
        /// Defaults to the configured network.
        #[arg(long)]
        network: Option<BitcoinNetworkType>,
    },

    /// Work with cloud backup files.
    Backup {
        #[command(subcommand)]
        cmd: BackupCommand,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Decode a backup envelope and print its metadata. Sealed fields stay sealed.
    Inspect { file: PathBuf },
}

fn init_logging(paths: &CustodianPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("custodian.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn write_json(value: &serde_json::Value) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(value).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

async fn keygen(paths: &CustodianPaths, network: Option<BitcoinNetworkType>) -> eyre::Result<()> {
    let cfg = ConfigStore::new(paths).load_or_init_default()?;
    let network = network.unwrap_or(cfg.network);
    let secret = load_or_create_machine_secret(&paths.machine_secret_path())?;
    let store = SecureStore::open_file(&paths.secure_store_dir(), &secret)
        .context("open secure store")?;
    let generator = AppKeysGenerator::new(AppPrivateKeyDao::new(store));
    let bundle = generator
        .generate_key_bundle(network)
        .await
        .context("generate key bundle")?;
    write_json(&serde_json::to_value(&bundle).context("serialize key bundle")?)
}

fn inspect_backup(file: &std::path::Path) -> eyre::Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let backup = cloud_backup::decode(&raw).with_context(|| {
        format!(
            "decode {} (supported versions: {SUPPORTED_VERSIONS:?})",
            file.display()
        )
    })?;
    let CloudBackup::V2(body) = &backup;
    write_json(&serde_json::json!({
      "version": backup.version(),
      "account_id": body.account_id.to_string(),
      "bitcoin_network_type": body.bitcoin_network_type.to_string(),
      "f8e_environment": body.f8e_environment.as_str(),
      "is_test_account": body.is_test_account,
      "is_using_socrec_fakes": body.is_using_socrec_fakes,
    }))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = CustodianPaths::discover()?;
    paths.ensure_private_dirs()?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Paths => write_json(&serde_json::json!({
          "config_dir": paths.config_dir,
          "data_dir": paths.data_dir,
          "log_file": paths.log_file,
          "secure_store_dir": paths.secure_store_dir(),
        })),
        Command::Doctor { json } => doctor::run(&paths, json).context("doctor failed"),
        Command::Keygen { network } => keygen(&paths, network).await.context("keygen failed"),
        Command::Backup { cmd } => match cmd {
            BackupCommand::Inspect { file } => inspect_backup(&file).context("backup inspect failed"),
        },
    }
}
