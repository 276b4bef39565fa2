//! # Controller
//!
//! The control plane of a pipeline:
//! * `setup` recreates the pipeline's topics per the declared partition
//!   map.
//! * `start` spawns the worker fleet, one process per replica, tracked by
//!   PID files.
//! * `stop` terminates the fleet gracefully, escalating to SIGKILL and
//!   falling back to a process-table scan.
//! * `signal` publishes START / STOP / HOLD / RESUME on the capture
//!   control topic.
mod config;
mod fleet;
mod setup;

use clap::{Parser, Subcommand};
use config::{PipelineConfig, SetupConfig};
use mcmot_common::init_tracing;
use mcmot_messages::{ControlMessage, Signal, control_topic};
use miette::IntoDiagnostic;
use rdkafka::{
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use std::{path::PathBuf, time::Duration};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(author, version = mcmot_common::version!(), about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recreate the pipeline's topics
    Setup {
        /// Path to the setup config JSON
        #[clap(long)]
        config: PathBuf,
    },

    /// Spawn the worker fleet
    Start {
        /// Path to the pipeline config JSON
        #[clap(long)]
        config: PathBuf,

        /// Directory PID files are written to
        #[clap(long, default_value = "pids")]
        pids_dir: PathBuf,

        /// Directory worker logs are written to
        #[clap(long, default_value = "logs")]
        logs_dir: PathBuf,
    },

    /// Terminate the worker fleet
    Stop {
        /// Name of the pipeline to stop
        #[clap(long)]
        pipeline: String,

        /// Directory the PID files live in
        #[clap(long, default_value = "pids")]
        pids_dir: PathBuf,

        /// Seconds to wait before force-killing
        #[clap(long, default_value = "5")]
        grace_secs: u64,
    },

    /// Publish a control signal to the capture stage
    Signal {
        /// Address of the Kafka broker
        #[clap(long)]
        broker: String,

        /// Name of the pipeline to signal
        #[clap(long)]
        pipeline: String,

        /// The signal to send
        #[clap(value_enum)]
        signal: Signal,

        /// How many times to replay a finite source (START only)
        #[clap(long)]
        loop_count: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    init_tracing();
    let args = Cli::parse();

    match args.command {
        Command::Setup { config } => {
            let config = SetupConfig::load(&config).into_diagnostic()?;
            setup::setup(&config).await.into_diagnostic()?;
            info!(pipeline = %config.pipeline, "topics ready");
        }
        Command::Start {
            config,
            pids_dir,
            logs_dir,
        } => {
            let config = PipelineConfig::load(&config).into_diagnostic()?;
            fleet::start(&config, &pids_dir, &logs_dir).into_diagnostic()?;
            info!(pipeline = %config.pipeline, "fleet started");
        }
        Command::Stop {
            pipeline,
            pids_dir,
            grace_secs,
        } => {
            fleet::stop(&pipeline, &pids_dir, Duration::from_secs(grace_secs))
                .into_diagnostic()?;
            info!(pipeline, "fleet stopped");
        }
        Command::Signal {
            broker,
            pipeline,
            signal,
            loop_count,
        } => {
            send_signal(&broker, &pipeline, signal, loop_count).await?;
        }
    }
    Ok(())
}

async fn send_signal(
    broker: &str,
    pipeline: &str,
    signal: Signal,
    loop_count: Option<u32>,
) -> miette::Result<()> {
    let producer: FutureProducer = mcmot_common::generate_kafka_client_config(broker, &None, &None)
        .create()
        .into_diagnostic()?;

    let message = ControlMessage {
        pipeline: pipeline.to_owned(),
        signal,
        loop_count,
    };
    let payload = message.to_payload().into_diagnostic()?;

    let topic = control_topic(pipeline);
    let record = FutureRecord::to(&topic)
        .key("control")
        .payload(&payload);
    producer
        .send(record, Timeout::After(Duration::from_secs(10)))
        .await
        .map_err(|(e, _)| e)
        .into_diagnostic()?;

    info!(pipeline, %signal, "control signal delivered");
    Ok(())
}
