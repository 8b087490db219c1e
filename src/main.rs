//! bucketd - A Multi-Bucket Key-Value Cache Daemon
//!
//! This is the main entry point for the bucketd server.
//! It parses the command line, sets up logging, starts the worker threads
//! and serves until Ctrl+C.

use bucketd::config::{ReqsPerEvent, Settings};
use bucketd::server::{Server, ServerContext};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "bucketd", version = bucketd::VERSION, about)]
struct Args {
    /// Host to bind to
    #[arg(short = 'l', long, env = "BUCKETD_HOST", default_value = bucketd::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "BUCKETD_PORT", default_value_t = bucketd::DEFAULT_PORT)]
    port: u16,

    /// Number of worker threads (defaults to the available parallelism)
    #[arg(short, long, env = "BUCKETD_THREADS")]
    threads: Option<usize>,

    /// Requests served per event before a connection yields
    #[arg(short = 'R', long, default_value_t = 20)]
    reqs_per_event: u32,

    /// Maximum simultaneous connections
    #[arg(short = 'c', long, default_value_t = 65_000)]
    max_connections: usize,

    /// Size of the bucket table, including the no-bucket slot
    #[arg(long, default_value_t = bucketd::config::MAX_NUM_BUCKETS)]
    max_buckets: usize,

    /// Create a memcached bucket named "default" at startup
    #[arg(long)]
    default_bucket: bool,

    /// Seconds between client-drain checks while deleting a bucket
    #[arg(long, default_value_t = 1)]
    deletion_poll_secs: u64,

    /// Log filter, e.g. "info" or "bucketd=debug"
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

impl Args {
    fn settings(&self) -> Settings {
        let mut settings = Settings::default()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_reqs_per_event(ReqsPerEvent {
                default: self.reqs_per_event,
                ..ReqsPerEvent::default()
            })
            .with_max_connections(self.max_connections)
            .with_max_buckets(self.max_buckets)
            .with_default_bucket(self.default_bucket)
            .with_deletion_poll(Duration::from_secs(self.deletion_poll_secs));
        if let Some(threads) = self.threads {
            settings = settings.with_threads(threads);
        }
        settings
    }
}

fn print_banner(settings: &Settings) {
    println!(
        r#"
bucketd v{} - Multi-Bucket Key-Value Cache Daemon
──────────────────────────────────────────────────────────────
Server started on {} with {} worker threads
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        bucketd::VERSION,
        settings.bind_address(),
        settings.threads
    );
}

/// Logs the connection dump whenever the process receives SIGUSR1.
#[cfg(unix)]
fn spawn_dump_handler(context: Arc<ServerContext>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Failed to install SIGUSR1 handler: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!(dump = %context.connections.dump_json(), "Connection dump");
        }
    });
}

#[cfg(not(unix))]
fn spawn_dump_handler(_context: Arc<ServerContext>) {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&args.log))
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .init();

    let settings = args.settings();
    let server = Server::bind(settings).await?;

    // Print the banner
    print_banner(&server.context().settings);
    info!("Listening on {}", server.local_addr()?);

    spawn_dump_handler(Arc::clone(server.context()));

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    server.serve(shutdown).await?;
    Ok(())
}
