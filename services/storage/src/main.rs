use anyhow::{anyhow, Context, Result};
use b2_storage_client::config::{Config, ServiceConfig};
use b2_storage_client::upload::sha1_hex;
use b2_storage_client::{B2Client, LargeFileUploader, UploadOptions};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "b2-upload")]
#[command(about = "Upload files and inspect buckets through the B2 native API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Upload {
        /// File to upload
        path: PathBuf,

        /// Remote file name (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,

        /// Target bucket (overrides b2.bucket_id)
        #[arg(long, env = "B2_BUCKET_ID")]
        bucket_id: Option<String>,

        /// Upload in a single request instead of as a large file
        #[arg(long)]
        single: bool,
    },
    /// Get an upload URL for single-request uploads
    UploadUrl {
        #[arg(long, env = "B2_BUCKET_ID")]
        bucket_id: Option<String>,
    },
    /// List buckets of the authorized account
    ListBuckets,
    /// List large files that were started but never finished
    ListUnfinished {
        #[arg(long, env = "B2_BUCKET_ID")]
        bucket_id: Option<String>,
    },
    /// Cancel an unfinished large file
    Cancel {
        /// Large file id
        file_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.service)?;

    config.validate()?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting B2 client"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let client = B2Client::from_config(&config).context("Failed to build B2 client")?;

    match run(cli.command, &config, client).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            Err(e)
        }
    }
}

async fn run(command: Commands, config: &Config, client: B2Client) -> Result<Value> {
    let value = match command {
        Commands::Upload {
            path,
            name,
            bucket_id,
            single,
        } => {
            let bucket_id = resolve_bucket(bucket_id, config)?;
            let file_name = match name {
                Some(name) => name,
                None => default_file_name(&path)?,
            };
            let data = Bytes::from(
                tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
            );

            info!(
                file_name = %file_name,
                size_bytes = data.len(),
                single = single,
                "Uploading file"
            );

            if single {
                let sha1 = sha1_hex(&data);
                client
                    .upload_file(
                        &bucket_id,
                        &file_name,
                        &config.upload.content_type,
                        data,
                        &sha1,
                    )
                    .await?
            } else {
                let uploader =
                    LargeFileUploader::new(client, UploadOptions::from(config.upload.clone()));
                uploader
                    .upload_large_file(data, &file_name, &bucket_id)
                    .await?
            }
        }
        Commands::UploadUrl { bucket_id } => {
            let bucket_id = resolve_bucket(bucket_id, config)?;
            client.b2_get_upload_url(&bucket_id).await?
        }
        Commands::ListBuckets => {
            let session = client.session().ensure_session().await?;
            let account_id = session
                .account_id
                .ok_or_else(|| anyhow!("Authorization response did not include an account id"))?;
            client
                .b2_list_buckets(json!({ "accountId": account_id }))
                .await?
        }
        Commands::ListUnfinished { bucket_id } => {
            let bucket_id = resolve_bucket(bucket_id, config)?;
            client
                .b2_list_unfinished_large_files(json!({ "bucketId": bucket_id }))
                .await?
        }
        Commands::Cancel { file_id } => client.b2_cancel_large_file(&file_id).await?,
    };

    Ok(value)
}

fn resolve_bucket(flag: Option<String>, config: &Config) -> Result<String> {
    flag.or_else(|| config.b2.bucket_id.clone())
        .ok_or_else(|| anyhow!("No bucket id given; pass --bucket-id or set b2.bucket_id"))
}

fn default_file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Cannot derive a file name from {}", path.display()))
}

/// Initialize logging based on configuration.
fn init_logging(config: &ServiceConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!(
            "b2_storage_client={level},b2_upload={level}",
            level = config.log_level
        ))?,
    };
    let filter = filter
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    // Logs go to stderr; stdout carries command output
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
