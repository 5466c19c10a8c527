//! # A2A CLI Entry Point
//!
//! Main binary for the A2A message broker. Serves demo workers, sends
//! envelopes through a broker to HTTP workers and runs in-process load
//! simulations.
//!
//! ## Usage
//!
//! ```bash
//! # Serve a demo worker that fails every third request
//! a2a worker -n coach -b 127.0.0.1:9001 --fail-every 3
//!
//! # Send one envelope to a named worker (outputs raw JSON)
//! a2a call -w coach:coaching=http://127.0.0.1:9001/envelope --to coach -p '{"goal": "5k"}'
//!
//! # Route by capability instead of by name
//! a2a call -w coach:coaching=http://127.0.0.1:9001/envelope -c coaching
//!
//! # Fan out to several workers and print the aggregate
//! a2a fanout -w coach=http://127.0.0.1:9001/envelope -w hr=http://127.0.0.1:9002/envelope --deadline-ms 2000
//!
//! # Simulate a burst of traffic against in-process workers
//! a2a simulate --workers 4 --flaky 1 --requests 200
//! ```
//!
//! ## Worker Format
//!
//! Workers are given as `name[:cap,cap]=url`, where the URL must include
//! the `http://` prefix:
//! - ✅ `coach:coaching,nutrition=http://127.0.0.1:9001/envelope`
//! - ✅ `hr=http://127.0.0.1:9002/envelope`
//! - ❌ `hr=127.0.0.1:9002`
//!
//! Broker settings come from the `A2A_*` environment variables; the flags
//! below override them.

use a2a_broker::Broker;
use a2a_cli::simulate::SimulationOptions;
use a2a_cli::target::{start_broker, ConfigOverrides, WorkerTarget};
use a2a_cli::worker::DemoWorkerOptions;
use a2a_common::protocol::{Capability, Envelope, Priority, Recipient, WorkerId};
use anyhow::Result;
use argh::FromArgs;
use std::net::SocketAddr;
use std::time::Duration;

/// A2A message broker
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Worker(WorkerArgs),
    Call(CallArgs),
    Fanout(FanoutArgs),
    Simulate(SimulateArgs),
}

/// Serve a demo HTTP worker that echoes payloads
#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
struct WorkerArgs {
    /// worker name reported in replies
    #[argh(option, short = 'n', default = "\"demo\".into()")]
    name: String,

    /// bind address (default: 127.0.0.1:9001)
    #[argh(option, short = 'b', default = "\"127.0.0.1:9001\".into()")]
    bind: String,

    /// answer every Nth request with HTTP 503
    #[argh(option)]
    fail_every: Option<u64>,

    /// delay before each reply, in milliseconds
    #[argh(option)]
    delay_ms: Option<u64>,
}

/// Dispatch one envelope and print the JSON response
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
struct CallArgs {
    /// worker as name[:cap,cap]=url (can be repeated)
    #[argh(option, short = 'w', long = "worker")]
    workers: Vec<WorkerTarget>,

    /// send to this worker by name
    #[argh(option)]
    to: Option<String>,

    /// send to any worker with this capability
    #[argh(option, short = 'c')]
    capability: Option<Capability>,

    /// JSON payload (default: {})
    #[argh(option, short = 'p', default = "\"{}\".into()")]
    payload: String,

    /// priority: critical, high, normal or low
    #[argh(option, default = "Priority::Normal")]
    priority: Priority,

    /// time to live in milliseconds
    #[argh(option)]
    ttl_ms: Option<u64>,

    /// attempts per envelope, including the first
    #[argh(option)]
    max_attempts: Option<u32>,

    /// consecutive failures that open a worker's breaker
    #[argh(option)]
    failure_threshold: Option<u32>,

    /// breaker cool-down in milliseconds
    #[argh(option)]
    cool_down_ms: Option<u64>,
}

/// Dispatch to several workers and print the aggregate result
#[derive(FromArgs)]
#[argh(subcommand, name = "fanout")]
struct FanoutArgs {
    /// worker as name[:cap,cap]=url (can be repeated); each is a recipient
    #[argh(option, short = 'w', long = "worker")]
    workers: Vec<WorkerTarget>,

    /// JSON payload (default: {})
    #[argh(option, short = 'p', default = "\"{}\".into()")]
    payload: String,

    /// priority: critical, high, normal or low
    #[argh(option, default = "Priority::Normal")]
    priority: Priority,

    /// fan-out deadline in milliseconds
    #[argh(option)]
    deadline_ms: Option<u64>,

    /// attempts per envelope, including the first
    #[argh(option)]
    max_attempts: Option<u32>,
}

/// Run an in-process broker against simulated workers
#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
struct SimulateArgs {
    /// number of simulated workers (default: 3)
    #[argh(option, default = "3")]
    workers: usize,

    /// how many workers always fail (default: 1)
    #[argh(option, default = "1")]
    flaky: usize,

    /// number of envelopes to dispatch (default: 50)
    #[argh(option, short = 'r', default = "50")]
    requests: usize,

    /// latency of each simulated call in milliseconds (default: 5)
    #[argh(option, default = "5")]
    latency_ms: u64,

    /// attempts per envelope, including the first
    #[argh(option)]
    max_attempts: Option<u32>,

    /// consecutive failures that open a worker's breaker
    #[argh(option)]
    failure_threshold: Option<u32>,

    /// breaker cool-down in milliseconds
    #[argh(option)]
    cool_down_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and fanout print raw JSON for piping, so they stay quiet
    if !matches!(cli.command, Commands::Call(_) | Commands::Fanout(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Worker(args) => {
            let addr: SocketAddr = args
                .bind
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;
            let options = DemoWorkerOptions {
                fail_every: args.fail_every,
                delay: args.delay_ms.map(Duration::from_millis),
            };
            if let Some(every) = options.fail_every {
                tracing::info!("Failing every {} requests", every);
            }
            a2a_cli::worker::serve(addr, &args.name, options).await
        }
        Commands::Call(args) => run_call(args).await,
        Commands::Fanout(args) => run_fanout(args).await,
        Commands::Simulate(args) => {
            let overrides = ConfigOverrides {
                max_attempts: args.max_attempts,
                failure_threshold: args.failure_threshold,
                cool_down_ms: args.cool_down_ms,
                fan_out_deadline_ms: None,
            };
            let config = overrides.apply(a2a_broker::BrokerConfig::from_env()?)?;
            let options = SimulationOptions {
                workers: args.workers,
                flaky: args.flaky,
                requests: args.requests,
                latency: Duration::from_millis(args.latency_ms),
                ..Default::default()
            };
            let report = a2a_cli::simulate::run(config, options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn parse_payload(payload: &str) -> Result<serde_json::Value> {
    serde_json::from_str(payload).map_err(|e| anyhow::anyhow!("Invalid JSON in payload: {}", e))
}

/// Picks the recipient for `call`: `--to`, `--capability`, or the only
/// worker given.
fn call_recipient(args: &CallArgs) -> Result<Recipient> {
    match (&args.to, args.capability) {
        (Some(_), Some(_)) => Err(anyhow::anyhow!("Use either --to or --capability, not both")),
        (Some(name), None) => Ok(Recipient::Worker(WorkerId::new(name.as_str()))),
        (None, Some(capability)) => Ok(Recipient::Capability(capability)),
        (None, None) => match args.workers.as_slice() {
            [only] => Ok(Recipient::Worker(only.id.clone())),
            _ => Err(anyhow::anyhow!(
                "Several workers given; pick one with --to or --capability"
            )),
        },
    }
}

async fn run_call(args: CallArgs) -> Result<()> {
    let payload = parse_payload(&args.payload)?;
    let recipient = call_recipient(&args)?;

    let broker = start_broker(
        &args.workers,
        ConfigOverrides {
            max_attempts: args.max_attempts,
            failure_threshold: args.failure_threshold,
            cool_down_ms: args.cool_down_ms,
            fan_out_deadline_ms: None,
        },
    )?;

    let mut envelope = Envelope::new("a2a-cli", recipient, payload).with_priority(args.priority);
    if let Some(ms) = args.ttl_ms {
        envelope = envelope.with_ttl(Duration::from_millis(ms));
    }

    let response = broker.dispatch(envelope).await?;

    // Output raw JSON to stdout
    println!("{}", serde_json::to_string(&response)?);

    Ok(())
}

async fn run_fanout(args: FanoutArgs) -> Result<()> {
    let payload = parse_payload(&args.payload)?;
    let recipients: Vec<WorkerId> = args.workers.iter().map(|w| w.id.clone()).collect();

    let broker = start_broker(
        &args.workers,
        ConfigOverrides {
            max_attempts: args.max_attempts,
            ..Default::default()
        },
    )?;

    let template = Envelope::new("a2a-cli", Recipient::Workers(recipients.clone()), payload)
        .with_priority(args.priority);
    let result = broker
        .dispatch_all(template, recipients, args.deadline_ms.map(Duration::from_millis))
        .await?;

    println!("{}", serde_json::to_string(&result)?);

    Ok(())
}
