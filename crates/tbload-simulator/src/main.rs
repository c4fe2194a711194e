//! CLI entry point for the telemetry load generator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tbload_core::ConnectionMode;
use tbload_simulator::{
    config::TestPlan,
    orchestrator::Orchestrator,
    provision::{MemoryProvisioner, Provisioner, RestProvisioner},
    transport::{Connector, MemoryBroker, MqttConnector},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tbload-simulator")]
#[command(about = "Telemetry load generator and test lifecycle engine for IoT platforms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test plan
    Run {
        /// Test plan (YAML); defaults are used when omitted
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Connection mode: direct or gateway
        #[arg(short, long)]
        mode: Option<String>,

        /// First device index (inclusive)
        #[arg(long)]
        device_start: Option<u64>,

        /// Last device index (exclusive)
        #[arg(long)]
        device_end: Option<u64>,

        /// Number of gateways (gateway mode)
        #[arg(long)]
        gateways: Option<u64>,

        /// Aggregate publish rate in messages per second
        #[arg(short, long)]
        rate: Option<f64>,

        /// Run duration in seconds
        #[arg(short = 'D', long)]
        duration: Option<u64>,

        /// Alarm injections per second
        #[arg(short, long)]
        alarm_rate: Option<f64>,

        /// Use the in-memory broker and provisioner
        #[arg(long)]
        dry_run: bool,

        /// Output base for the report; writes <base>.md
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write <base>.json, or print JSON to stdout without --output
        #[arg(long)]
        json: bool,
    },

    /// Write a commented default test plan
    InitConfig {
        #[arg(short, long, default_value = "tbload.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { output } => {
            TestPlan::write_default(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!("Default test plan written to: {}", output.display());
            Ok(())
        }

        Commands::Run {
            plan,
            mode,
            device_start,
            device_end,
            gateways,
            rate,
            duration,
            alarm_rate,
            dry_run,
            output,
            json,
        } => {
            let mut plan = match plan {
                Some(path) => TestPlan::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => TestPlan::default(),
            };

            if let Some(mode) = mode {
                plan.mode = match mode.as_str() {
                    "direct" => ConnectionMode::Direct,
                    "gateway" => ConnectionMode::Gateway,
                    other => anyhow::bail!("Unknown mode '{}': expected direct or gateway", other),
                };
            }
            if let Some(start) = device_start {
                plan.devices.start = start;
            }
            if let Some(end) = device_end {
                plan.devices.end = end;
            }
            if let Some(count) = gateways {
                plan.gateways.end = plan.gateways.start + count;
            }
            if let Some(rate) = rate {
                plan.rate.target_per_sec = rate;
            }
            if let Some(duration) = duration {
                plan.duration_secs = duration;
            }
            if let Some(alarm_rate) = alarm_rate {
                plan.alarm_rate = alarm_rate;
            }
            plan.validate()?;

            let (connector, provisioner): (Arc<dyn Connector>, Arc<dyn Provisioner>) = if dry_run {
                info!("Dry run: using in-memory broker and provisioner");
                (
                    Arc::new(MemoryBroker::new().connector()),
                    Arc::new(MemoryProvisioner::new()),
                )
            } else {
                (
                    Arc::new(MqttConnector::new(plan.mqtt.clone())),
                    Arc::new(RestProvisioner::new(&plan.rest)?),
                )
            };

            let orchestrator = Orchestrator::new(plan, connector, provisioner);
            let cancel = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping run");
                    cancel.cancel();
                }
            });

            let report = orchestrator.run().await;

            // Print summary to console
            report.print_summary();

            match &output {
                Some(base) => {
                    let written = report
                        .save(base, json)
                        .with_context(|| format!("writing report to {}", base.display()))?;
                    for path in written {
                        info!("Report saved to: {}", path.display());
                    }
                }
                None if json => println!("{}", report.to_json()),
                None => {}
            }

            std::process::exit(report.exit_code());
        }
    }
}
