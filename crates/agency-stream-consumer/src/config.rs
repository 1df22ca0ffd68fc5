use crate::consumer::RunSettings;
use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tonic::transport::Endpoint;

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Runtime configuration for the `agency-stream-consumer` binary.
///
/// Values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first if present). `GENERATOR_ADDR` has no default: the
/// consumer refuses to start without it.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "agency-stream-consumer",
    version,
    about = "Streams synthetic contract requests from the generator and ingests the valid ones"
)]
pub struct CliArgs {
    /// URI of the batch generator, e.g. `http://127.0.0.1:50051`.
    ///
    /// Environment variable: `GENERATOR_ADDR`
    #[arg(long, env = "GENERATOR_ADDR")]
    pub generator_addr: String,

    /// Records requested per run.
    ///
    /// Environment variable: `COUNT_PER_REQUEST`
    #[arg(long, env = "COUNT_PER_REQUEST", default_value_t = 100)]
    pub count_per_request: u32,

    /// Records per batch. `0` lets the generator pick its default.
    ///
    /// Environment variable: `BATCH_SIZE`
    #[arg(long, env = "BATCH_SIZE", default_value_t = 10)]
    pub batch_size: u32,

    /// Counterparties `1..=N` the in-memory directory starts with.
    ///
    /// Environment variable: `SEED_COUNTERPARTIES`
    #[arg(long, env = "SEED_COUNTERPARTIES", default_value_t = 10)]
    pub seed_counterparties: u32,

    /// Real estates `101..=100+N` the in-memory directory starts with.
    ///
    /// Environment variable: `SEED_REAL_ESTATES`
    #[arg(long, env = "SEED_REAL_ESTATES", default_value_t = 10)]
    pub seed_real_estates: u32,

    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub endpoint: Endpoint,
    pub settings: RunSettings,
    pub seed_counterparties: i32,
    pub seed_real_estates: i32,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for ConsumerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.count_per_request == 0 {
            bail!("COUNT_PER_REQUEST must be greater than 0");
        }

        let endpoint = Endpoint::from_shared(args.generator_addr.clone()).with_context(|| {
            format!("GENERATOR_ADDR {:?} is not a valid URI", args.generator_addr)
        })?;

        let settings = RunSettings {
            count: i32::try_from(args.count_per_request).context("COUNT_PER_REQUEST is too large")?,
            batch_size: i32::try_from(args.batch_size).context("BATCH_SIZE is too large")?,
        };

        // Seeds end at 100 + N, which must still fit an id.
        let seed_counterparties =
            i32::try_from(args.seed_counterparties).context("SEED_COUNTERPARTIES is too large")?;
        let seed_real_estates = i32::try_from(args.seed_real_estates)
            .ok()
            .filter(|n| n.checked_add(100).is_some())
            .context("SEED_REAL_ESTATES is too large")?;

        Ok(Self {
            endpoint,
            settings,
            seed_counterparties,
            seed_real_estates,
            log_format: args.log_format,
        })
    }
}
