use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use resilient_fetch::proxy::ProxySource;
use resilient_fetch::utils::{self, Timer};
use resilient_fetch::{AppConfig, DirectClient, DirectoryProxySource, FetchEngine, FetchRequest, ProxyAddress};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "resilient-fetch", about = "Proxy-rotating HTTP fetcher", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a page, retrying through fresh proxies until it is acceptable
    Fetch {
        url: String,

        /// Connect directly, bypassing the rotator
        #[arg(long, conflicts_with = "proxy")]
        direct: bool,

        /// Pin a proxy (host:port) for every attempt
        #[arg(long)]
        proxy: Option<ProxyAddress>,

        /// Extra request header, "Name: value"
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Accept any 2xx body, even empty or block pages
        #[arg(long)]
        status_only: bool,
    },

    /// Fetch a page and extract the JSON object between two markers
    Json {
        url: String,

        #[arg(long)]
        prefix: Option<String>,

        #[arg(long)]
        suffix: Option<String>,
    },

    /// Download the raw body (single attempt, no decoding)
    Stream {
        url: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Ask the directory for one proxy and print it
    Proxy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "resilient_fetch=info,warn",
        1 => "resilient_fetch=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Fetch {
            url,
            direct,
            proxy,
            headers,
            status_only,
        } => {
            let mut request = FetchRequest::get(&url);
            for raw in &headers {
                let (name, value) = raw
                    .split_once(':')
                    .with_context(|| format!("header {:?} is not \"Name: value\"", raw))?;
                request = request.with_header(name.trim(), value.trim());
            }
            if direct {
                request = request.direct();
            } else if let Some(proxy) = proxy {
                request = request.via(proxy);
            }

            let engine = FetchEngine::from_config(&config)
                .await
                .context("Failed to start fetch engine")?;
            let _t = Timer::start(format!("fetch {}", url));

            let body = if status_only {
                engine.fetch_with(&request, None).await
            } else {
                engine.fetch(&request).await
            }
            .with_context(|| format!("Failed to fetch {}", url))?;

            let Some(body) = body else {
                bail!("nothing fetched: {:?} is not a usable URL", url);
            };
            let stats = engine.stats();
            info!(
                "{} decoded, {} proxy rotations",
                utils::fmt_bytes(body.len() as u64),
                stats.refreshes
            );
            println!("{}", body);
            engine.close().await;
        }

        Command::Json {
            url,
            prefix,
            suffix,
        } => {
            let engine = FetchEngine::from_config(&config)
                .await
                .context("Failed to start fetch engine")?;
            let _t = Timer::start(format!("json {}", url));

            let object = engine
                .fetch_as_json(&url, prefix.as_deref(), suffix.as_deref())
                .await
                .with_context(|| format!("Failed to fetch JSON from {}", url))?;

            let Some(object) = object else {
                bail!("nothing fetched: {:?} is not a usable URL", url);
            };
            println!("{}", serde_json::to_string_pretty(&object)?);
            engine.close().await;
        }

        Command::Stream { url, output } => {
            let engine = FetchEngine::from_config(&config)
                .await
                .context("Failed to start fetch engine")?;
            let _t = Timer::start(format!("stream {}", url));

            let Some(mut stream) = engine.fetch_as_stream(&FetchRequest::get(&url)).await? else {
                bail!("nothing fetched: {:?} is not a usable URL", url);
            };

            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("Failed to create {:?}", path))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };

            let mut total = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Stream interrupted")?;
                total += chunk.len() as u64;
                sink.write_all(&chunk).await?;
            }
            sink.flush().await?;
            info!("{} written", utils::fmt_bytes(total));
            engine.close().await;
        }

        Command::Proxy => {
            let directory = DirectClient::new(&config.proxy, &config.transport)?;
            let source = DirectoryProxySource::from_config(&config.proxy, directory);
            if !source.is_configured() {
                println!("No proxy directory configured (set FETCH__PROXY__API_URL).");
                return Ok(());
            }
            info!("Polling the proxy directory every {:?}", config.proxy.delay());

            match source.acquire().await {
                Some(proxy) => println!("{}", proxy),
                None => println!("direct"),
            }
        }
    }

    Ok(())
}
