//! sigbox client
//!
//! Thin command-line front end to a running agent or proxy.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use sigbox_client::RemoteBox;
use sigbox_crypto::StreamKey;
use sigbox_protocol::PipeStep;
use sigbox_transport::Endpoint;
use std::path::PathBuf;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

/// sigbox client - talk to a signing agent
#[derive(Parser, Debug)]
#[command(name = "sigbox")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent or proxy: socket path, unix:///path or tcp://host:port
    #[arg(short, long)]
    connect: Option<String>,

    /// Hex stream key
    #[arg(short, long)]
    key: Option<String>,

    /// Existing session to address
    #[arg(long)]
    bid: Option<String>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the certificates of the box
    Info,

    /// Sign a file
    Sign {
        input: PathBuf,
        output: PathBuf,

        /// Write the signature only
        #[arg(long)]
        detached: bool,

        /// Load this key into a fresh session first
        #[arg(long)]
        key_file: Option<PathBuf>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Verify a signed file, printing the signer metadata
    Unwrap {
        input: PathBuf,

        /// Signed content, for detached signatures
        #[arg(long)]
        content: Option<PathBuf>,

        /// Where to write the unwrapped content
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the keys inside a password-protected container
    Unprotect {
        container: PathBuf,

        #[arg(long)]
        password: Option<String>,
    },
}

async fn read(path: &PathBuf) -> Result<Bytes> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(Bytes::from(raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let endpoint = match args.connect.as_deref() {
        Some(uri) => Endpoint::from_uri(uri),
        None => Endpoint::default_unix()?,
    };
    let key = args
        .key
        .as_deref()
        .map(StreamKey::from_hex)
        .transpose()
        .context("invalid stream key")?;

    debug!("Connecting to {}", endpoint);
    let mut remote = RemoteBox::connect(&endpoint, key.as_ref())
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    if args.bid.is_some() {
        remote.set_bid(args.bid);
    }

    match args.command {
        Command::Info => {
            let certs = if remote.bid().is_some() {
                remote.info().await?
            } else {
                remote.certificates().to_vec()
            };
            println!("{}", serde_json::to_string_pretty(&certs)?);
        }
        Command::Sign {
            input,
            output,
            detached,
            key_file,
            password,
        } => {
            let content = read(&input).await?;
            let session = key_file.is_some();
            if let Some(key_file) = key_file {
                remote.init().await?;
                remote
                    .add_key(vec![read(&key_file).await?], password.as_deref())
                    .await?;
            }
            let signed = remote
                .pipe(content, vec![PipeStep::sign().with("detached", detached)], None)
                .await?;
            if session {
                remote.evict().await?;
            }
            tokio::fs::write(&output, &signed)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
        }
        Command::Unwrap {
            input,
            content,
            output,
        } => {
            let signed = read(&input).await?;
            let detached = match content {
                Some(path) => Some(read(&path).await?),
                None => None,
            };
            let unwrapped = remote.unwrap(signed, detached, serde_json::Value::Null).await?;
            println!("{}", serde_json::to_string_pretty(&unwrapped.meta)?);
            if let Some(output) = output {
                tokio::fs::write(&output, &unwrapped.content)
                    .await
                    .with_context(|| format!("writing {}", output.display()))?;
            }
        }
        Command::Unprotect {
            container,
            password,
        } => {
            let keys = remote
                .unprotect(read(&container).await?, password.as_deref())
                .await?;
            for key in keys {
                println!("# {}\n{}", key.id, key.pem);
            }
        }
    }

    Ok(())
}
