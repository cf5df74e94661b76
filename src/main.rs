use anyhow::{Context, Result};
use clap::Parser;
use gemtx::{Client, ClientConfig, ClientError, GeminiUrl, Response, StatusFilter, TrustStore};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

/// Fetch Gemini URLs, pinning server certificates on first use.
///
/// With one URL the response header goes to stderr and the raw body to
/// stdout. With several URLs, or a wordlist, every URL is fetched
/// concurrently and one summary line per matching response is printed.
#[derive(Parser, Debug)]
#[command(name = "gemtx", version)]
struct Args {
    /// The gemini:// URLs to fetch.
    #[arg(required_unless_present = "forget")]
    urls: Vec<String>,

    /// Trust store holding pinned certificates (JSON Lines).
    #[arg(long, default_value = "known_hosts.jsonl")]
    known_hosts: PathBuf,

    /// Deadline for each transaction, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Fail instead of buffering a body larger than this many bytes.
    #[arg(long)]
    max_body_size: Option<usize>,

    /// Connect to this port instead of the one in the URL.
    #[arg(short, long)]
    port: Option<u16>,

    /// Append every word of this file to each URL as a path segment.
    #[arg(short, long)]
    wordlist: Option<PathBuf>,

    /// Comma-separated extensions to try for every word, e.g. `gmi,txt`.
    #[arg(short = 'x', long, value_delimiter = ',', requires = "wordlist")]
    extensions: Vec<String>,

    /// How many transactions may run at once.
    #[arg(short = 't', long, default_value_t = 10)]
    workers: usize,

    /// Statuses to report: `all`, a category digit such as `2`, or a code such as `51`.
    #[arg(short = 'c', long, default_value = "2,3")]
    status: StatusFilter,

    /// Do not report responses whose body is exactly this many bytes.
    #[arg(short = 's', long)]
    hide_size: Option<usize>,

    /// Remove the pinned certificate for HOST and exit.
    #[arg(long, value_name = "HOST", conflicts_with = "urls")]
    forget: Option<String>,

    /// Log debug output to stderr. RUST_LOG overrides this.
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "gemtx=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => match error.downcast_ref::<ClientError>() {
            Some(ClientError::CertificateMismatch { host, expected, presented }) => {
                eprintln!("WARNING: {host} presented a certificate that does not match the pinned one.");
                eprintln!("  pinned:    {expected}");
                eprintln!("  presented: {presented}");
                eprintln!("Someone may be intercepting the connection. If the host rotated its");
                eprintln!("certificate on purpose, remove the pin with `gemtx --forget {host}`.");
                ExitCode::from(2)
            }
            _ => {
                eprintln!("error: {error:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(args: Args) -> Result<()> {
    if let Some(host) = &args.forget {
        let store = TrustStore::open(&args.known_hosts)
            .with_context(|| format!("failed to open {}", args.known_hosts.display()))?;
        if store.forget(host)? {
            store.compact()?;
            eprintln!("removed the pinned certificate for {host}");
        } else {
            eprintln!("{host} has no pinned certificate");
        }
        return Ok(());
    }

    let mut bases = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let mut url = GeminiUrl::parse(url).with_context(|| format!("invalid URL `{url}`"))?;
        if let Some(port) = args.port {
            url = url.with_port(port)?;
        }
        bases.push(url);
    }

    let client = Client::new(ClientConfig {
        trust_store: Some(args.known_hosts.clone()),
        timeout: Duration::from_secs(args.timeout),
        max_body_size: args.max_body_size,
    })?;

    if let (None, [url]) = (&args.wordlist, bases.as_slice()) {
        return fetch_one(&client, url).await;
    }

    let urls = match &args.wordlist {
        Some(path) => {
            let words = read_wordlist(path).await?;
            let urls = expand(&bases, &words, &args.extensions)?;
            eprintln!("loaded {} words, fetching {} URLs with {} workers", words.len(), urls.len(), args.workers);
            urls
        }
        None => bases,
    };

    scan(&client, urls, &args).await
}

async fn fetch_one(client: &Client, url: &GeminiUrl) -> Result<()> {
    let response = client.perform_request(url, tokio::time::Instant::now() + client.config().timeout).await?;
    eprintln!("{} {}", response.status(), response.meta());

    if let Some(body) = response.body() {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(body).await?;
        stdout.flush().await?;
    }

    Ok(())
}

async fn scan(client: &Client, urls: Vec<GeminiUrl>, args: &Args) -> Result<()> {
    let mut mismatch = None;

    for (url, result) in client.fetch_all(urls, args.workers).await {
        match result {
            Ok(response) => {
                if args.status.matches(response.status()) && Some(response.size()) != args.hide_size {
                    println!("{}", summary(&url, &response));
                }
            }
            Err(error) if error.is_security_relevant() => {
                eprintln!("{url}: {error}");
                mismatch.get_or_insert(error);
            }
            Err(error) => {
                if args.verbose {
                    eprintln!("{url}: {error}");
                }
            }
        }
    }

    match mismatch {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn summary(url: &GeminiUrl, response: &Response) -> String {
    let status = format!("[{}]", response.status());
    let target = match response.redirect_target(url) {
        Some(Ok(target)) => format!("{url} -> {target}"),
        _ => url.to_string(),
    };

    format!("{status:<6} {target:<40} Size: {:<8} {}", response.size(), response.meta())
}

async fn read_wordlist(path: &Path) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read wordlist {}", path.display()))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|word| !word.is_empty() && !word.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Every base URL joined with every word, and with every word plus each extension.
fn expand(bases: &[GeminiUrl], words: &[String], extensions: &[String]) -> Result<Vec<GeminiUrl>> {
    let mut urls = Vec::with_capacity(bases.len() * words.len() * (extensions.len() + 1));

    for base in bases {
        for word in words {
            urls.push(base.child(word)?);
            for extension in extensions {
                urls.push(base.child(&format!("{word}.{}", extension.trim_matches('.')))?);
            }
        }
    }

    Ok(urls)
}
