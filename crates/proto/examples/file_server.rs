//! KimCloud file server.
//!
//! Accepts uploads from authenticated clients and stores each file as
//! `{upload_dir}/{username}_{filename}`.
//!
//! Usage:
//!   cargo run --example file_server -- --port 2222 --upload-dir ./uploads
//!
//! With an account file (`username:password` per line):
//!   cargo run --example file_server -- --users users.txt
//!
//! Then upload with:
//!   cargo run --example file_client -- --user hosung --password kim notes.txt

use clap::Parser;
use kimcloud_proto::ssh::auth::CredentialStore;
use kimcloud_proto::ssh::config::ServerConfig;
use kimcloud_proto::ssh::server::FileServer;
use std::path::PathBuf;

/// KimCloud file upload server
#[derive(Parser, Debug)]
#[command(name = "file_server")]
#[command(about = "KimCloud file upload server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 2222)]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Directory uploads are written to
    #[arg(short, long, default_value = "./uploads")]
    upload_dir: PathBuf,

    /// Account file with `username:password` lines (demo accounts if omitted)
    #[arg(long)]
    users: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let credentials = match &args.users {
        Some(path) => CredentialStore::load(path).await?,
        None => {
            tracing::warn!("No account file given, using the demo accounts");
            CredentialStore::with_defaults()
        }
    };

    let config = ServerConfig::builder()
        .with_bind_addr(format!("{}:{}", args.host, args.port))
        .with_upload_dir(args.upload_dir)
        .build()?;

    let server = FileServer::bind(config, credentials).await?;
    println!("KimCloud server listening on {}", server.local_addr()?);
    println!("Press Ctrl+C to stop\n");

    server.run().await?;
    Ok(())
}
