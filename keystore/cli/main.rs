//! for CLI
//!
//! Thin wrappers over the key coordinator: register or unregister keys and
//! stream files through the cipher they were registered for.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use eds_engine::catalog::CatalogAdapter;
use eds_engine::catalog::file::FileCatalog;
use eds_engine::crypto::Direction;
use eds_engine::logging::init_logging;
use eds_engine::{
    CipherSession, DnsDiscovery, EdsConfig, KeyCoordinator, ReplicaId, ServiceDiscovery, StaticDiscovery,
};

/// Read/write granularity for the encrypt and decrypt loops.
const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "eds", version = "0.1", about = "Encrypted data storage key manager")]
struct Cli {
    /// Catalog endpoint, repeatable; the first is the primary. Overrides EDS_CATALOG_ENDPOINTS.
    #[arg(long = "endpoint", global = true)]
    endpoints: Vec<String>,

    /// Service type to discover. Overrides GLITE_SD_METADATA_TYPE.
    #[arg(long, global = true)]
    service_type: Option<String>,

    /// Directory the file-backed catalog endpoints live under
    #[arg(long, global = true, default_value = ".")]
    catalog_root: PathBuf,

    /// Also write a daily rolling log file here
    #[arg(long, global = true)]
    log_dir: Option<String>,

    #[arg(long, global = true, help = "Log files in JSON instead of logfmt")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the catalog endpoints discovery currently returns
    Endpoints,

    /// Generate a key for an item and distribute its shares
    Register {
        id: String,

        #[arg(short, long, help = "Cipher name, e.g. aes-256-cbc (default: EDS_DEFAULT_CIPHER or bf-cbc)")]
        cipher: Option<String>,

        #[arg(short, long, default_value_t = 0, help = "Key size in bits, 0 for the cipher default")]
        key_size: usize,

        /// GUID or srm:// SURL to record alongside the key
        #[arg(long)]
        replica: Option<String>,
    },

    /// Remove an item's key shares from every endpoint
    Unregister { id: String },

    /// Encrypt a file with the item's registered key
    Encrypt { id: String, input: PathBuf, output: PathBuf },

    /// Decrypt a file with the item's registered key
    Decrypt { id: String, input: PathBuf, output: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments using clap (see `Cli` and `Commands`)
    let cli = Cli::parse();

    // Held until exit so the file writer flushes
    let _log_guard = init_logging(cli.log_dir.as_deref(), cli.json_logs);

    let mut config = EdsConfig::from_env().context("reading configuration from the environment")?;
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }
    if let Some(service_type) = &cli.service_type {
        config.service_type = service_type.clone();
    }

    let coordinator = build_coordinator(&config, &cli)?;

    match cli.command {
        Commands::Endpoints => {
            let endpoints = coordinator
                .catalog_endpoints()
                .await
                .context("discovering catalog endpoints")?;
            for endpoint in endpoints {
                println!("{endpoint}");
            }
        }

        Commands::Register {
            id,
            cipher,
            key_size,
            replica,
        } => {
            match replica {
                Some(replica) => {
                    let replica = ReplicaId::parse(&replica)?;
                    coordinator
                        .register_replica(&id, &replica, cipher.as_deref(), key_size)
                        .await
                        .with_context(|| format!("registering key for {id} ({replica})"))?;
                }
                None => coordinator
                    .register(&id, cipher.as_deref(), key_size)
                    .await
                    .with_context(|| format!("registering key for {id}"))?,
            }
            println!("registered {id}");
        }

        Commands::Unregister { id } => {
            coordinator
                .unregister(&id)
                .await
                .with_context(|| format!("unregistering {id}"))?;
            println!("unregistered {id}");
        }

        Commands::Encrypt { id, input, output } => {
            let session = coordinator
                .init_encrypt(&id)
                .await
                .with_context(|| format!("loading key for {id}"))?;
            let bytes = stream_file(session, &input, &output).await?;
            info!(item_id = %id, bytes, "file encrypted");
        }

        Commands::Decrypt { id, input, output } => {
            let session = coordinator
                .init_decrypt(&id)
                .await
                .with_context(|| format!("loading key for {id}"))?;
            let bytes = stream_file(session, &input, &output).await?;
            info!(item_id = %id, bytes, "file decrypted");
        }
    }

    Ok(())
}

fn build_coordinator(config: &EdsConfig, cli: &Cli) -> Result<KeyCoordinator> {
    let discovery: Arc<dyn ServiceDiscovery> = if config.endpoints.is_empty() {
        Arc::new(DnsDiscovery::new(config.dns_port))
    } else {
        Arc::new(StaticDiscovery::with_endpoints(&config.service_type, &config.endpoints)?)
    };
    let catalog = CatalogAdapter::new(Arc::new(FileCatalog::with_root(&cli.catalog_root)));

    Ok(KeyCoordinator::from_config(config, discovery, catalog))
}

/// Pump `input` through the session into `output`, returning the input size.
async fn stream_file(mut session: CipherSession, input: &Path, output: &Path) -> Result<u64> {
    if input == output {
        bail!("input and output must be different files");
    }

    let mut reader = File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut writer = File::create(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    let encrypting = session.direction() == Direction::Encrypt;
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .with_context(|| format!("reading {}", input.display()))?;
        if n == 0 {
            break;
        }
        total += n as u64;

        let out = if encrypting {
            session.encrypt_block(&buf[..n])?
        } else {
            session.decrypt_block(&buf[..n])?
        };
        writer.write_all(&out).await.context("writing output")?;
    }

    let tail = if encrypting {
        session.encrypt_final()?
    } else {
        session.decrypt_final()?
    };
    writer.write_all(&tail).await.context("writing output")?;
    writer.flush().await.context("flushing output")?;
    session.finalize()?;

    Ok(total)
}
