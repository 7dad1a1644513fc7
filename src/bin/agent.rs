use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use healthwatch::checks::http::HttpChecker;
use healthwatch::checks::icmp::IcmpProber;
use healthwatch::config::read_config_file;
use healthwatch::registry::Registry;
use healthwatch::sinks::console::ConsoleSink;
use healthwatch::sinks::network::NetworkSink;
use tracing::{debug, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Transport timeout in seconds shared by the check implementations
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,
}

fn log_filter() -> filter::Targets {
    filter::Targets::new().with_targets(vec![
        ("healthwatch", LevelFilter::TRACE),
        ("healthwatch_agent", LevelFilter::TRACE),
    ])
}

fn init() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(log_filter())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let timeout = Duration::from_secs(args.timeout);

    let mut registry = Registry::new();

    let http_checker = HttpChecker::new(timeout);
    registry.register_check_constructor("http", http_checker.status_constructor());
    registry.register_check_constructor("http_content", http_checker.content_constructor());

    // opening the raw socket needs privilege; without it, icmp definitions
    // are reported as unknown and skipped instead of aborting the agent
    match IcmpProber::new(timeout) {
        Ok(prober) => registry.register_check_constructor("icmp", prober.constructor()),
        Err(e) => warn!("icmp checks unavailable: {e:#}"),
    }

    registry.register_sink_constructor("console", Box::new(ConsoleSink::from_args));
    registry.register_sink_constructor("file", Box::new(ConsoleSink::file_from_args));
    registry.register_sink_constructor("network", Box::new(NetworkSink::from_args));

    registry.register_from_definitions(&config.checks);

    let registry = Arc::new(registry);
    let stopper = Arc::clone(&registry);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("received interrupt, stopping health checks");
            stopper.stop_running();
        }
    });

    registry.start_running().await;

    Ok(())
}
