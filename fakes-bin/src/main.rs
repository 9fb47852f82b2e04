#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

use std::{net::IpAddr, path::PathBuf};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful,
    telemetry::tracing,
};

use clap::Parser;

use fakes::{
    FakeService, Fixture,
    utils::{self, telemetry::TelemetryConfig},
};

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI arguments for serving fake endpoints.
#[derive(Debug, Clone, Parser)]
#[command(name = "fakes-serve")]
#[command(bin_name = "fakes-serve")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// JSON fixture declaring the endpoints to serve
    #[arg(long, short = 'f', value_name = "FILE")]
    pub fixture: PathBuf,

    /// port to listen on (0 = ephemeral)
    #[arg(long, short = 'p', default_value_t = 0)]
    pub port: u16,

    /// ip to bind to
    #[arg(long, value_name = "IP", default_value = "127.0.0.1")]
    pub bind_ip: IpAddr,

    /// seed the chaos draws, making induced failures repeatable
    #[arg(long, value_name = "SEED")]
    pub chaos_seed: Option<u64>,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    utils::telemetry::init_tracing(&TelemetryConfig {
        verbose: args.verbose,
        pretty: args.pretty,
        output: args.output.clone(),
    })?;

    if let Err(err) = run_with_args(graceful::default_signal(), args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    Ok(())
}

/// Serves the fixture until the shutdown signal resolves,
/// failing in case the fake service was not used as declared.
async fn run_with_args<F>(shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future<Output: Send + 'static> + Send + 'static,
{
    let fixture = Fixture::try_load(&args.fixture).await?;
    let endpoints = fixture
        .into_endpoints()
        .context("resolve fixture endpoints")
        .with_context_debug_field("path", || args.fixture.clone())?;

    let mut service = FakeService::new()
        .with_port(args.port)
        .with_bind_ip(args.bind_ip)
        .try_with_endpoints(endpoints)?;
    if let Some(seed) = args.chaos_seed {
        service = service.with_chaos_seed(seed);
    }

    let fake = service.run().await?;
    tracing::info!(
        "{} serving {} fake endpoint(s) at {}",
        utils::env::project_name(),
        fake.call_counts().len(),
        fake.base_url()
    );

    shutdown_signal.await;
    tracing::info!("shutdown signal received: tidy up fake service");

    for (path, calls) in fake.call_counts() {
        tracing::info!(fake.endpoint = %path, fake.calls = calls, "fake endpoint usage");
    }

    fake.try_tidy_up().await?;
    Ok(())
}
