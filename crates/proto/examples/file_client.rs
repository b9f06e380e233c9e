//! KimCloud upload client.
//!
//! Usage:
//!   cargo run --example file_client -- --host 127.0.0.1 --port 2222 \
//!       --user hosung --password kim report.pdf notes.txt
//!
//! The password is read from stdin when `--password` is omitted.

use clap::Parser;
use kimcloud_proto::ssh::client::FileClient;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// KimCloud file upload client
#[derive(Parser, Debug)]
#[command(name = "file_client")]
#[command(about = "Upload files to a KimCloud server")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 2222)]
    port: u16,

    /// Username
    #[arg(short, long)]
    user: String,

    /// Password (prompted when omitted)
    #[arg(long)]
    password: Option<String>,

    /// Files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn prompt_password() -> io::Result<String> {
    print!("Password: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
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
    let password = match args.password {
        Some(password) => password,
        None => prompt_password()?,
    };

    let addr = format!("{}:{}", args.host, args.port);
    println!("Connecting to {}...", addr);
    let mut client = FileClient::connect(&addr).await?;
    println!("✓ Secure channel established");

    client.authenticate(&args.user, &password).await?;
    println!("✓ Authenticated as {}", args.user);

    let results = client.upload_all(&args.files).await?;
    for (path, result) in args.files.iter().zip(results) {
        match result {
            Ok(report) => println!(
                "✓ {} -> {}_{} ({} bytes, {} chunks)",
                path.display(),
                args.user,
                report.remote_name,
                report.bytes_sent,
                report.chunks
            ),
            Err(e) => println!("✗ {}: {}", path.display(), e),
        }
    }

    client.disconnect().await?;
    println!("Disconnected");
    Ok(())
}
