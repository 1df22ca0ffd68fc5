use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use std::net::SocketAddr;

/// Runtime configuration for the `agency-stream-server` binary.
///
/// Values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first if present). `BATCH_SIZE` and `WAIT_TIME` have no
/// defaults: the server refuses to start when either is missing or does not
/// parse.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "agency-stream-server",
    version,
    about = "A gRPC service streaming synthetic contract requests in batches"
)]
pub struct CliArgs {
    /// Number of records per batch when a request does not specify one.
    ///
    /// Environment variable: `BATCH_SIZE`
    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: usize,

    /// Delay in seconds between two batches of the same request. `0` disables
    /// pacing.
    ///
    /// Environment variable: `WAIT_TIME`
    #[arg(long, env = "WAIT_TIME")]
    pub wait_time: u64,

    /// Upper bound on the record count of a single generation request.
    /// Requests above it are skipped.
    ///
    /// Environment variable: `MAX_RECORDS_PER_REQUEST`
    #[arg(long, env = "MAX_RECORDS_PER_REQUEST", default_value_t = 1_000_000)]
    pub max_records_per_request: usize,

    /// Capacity of the response buffer between request tasks and the gRPC
    /// stream. Lower values make backpressure kick in sooner.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Seconds to wait for in-flight streams to drain on shutdown before they
    /// are cancelled.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub default_batch_size: usize,
    pub wait_time: Duration,
    pub max_records_per_request: usize,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub server_addr: SocketAddr,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.batch_size == 0 {
            bail!("BATCH_SIZE must be greater than 0");
        }

        if args.max_records_per_request == 0 {
            bail!("MAX_RECORDS_PER_REQUEST must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        let server_addr = args.server_addr.parse().with_context(|| {
            format!("SERVER_ADDR {:?} is not a socket address", args.server_addr)
        })?;

        Ok(Self {
            default_batch_size: args.batch_size,
            wait_time: Duration::from_secs(args.wait_time),
            max_records_per_request: args.max_records_per_request,
            stream_buffer_size: args.stream_buffer_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr,
        })
    }
}
