use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};

use doser::{ClientConfig, ControlLawKind, Doser, LinkState, Phase, logging};

/// Headless dispensing run: connect to the rig, walk a target sheet, record results
#[derive(Parser, Debug)]
#[command(name = "doser", version, long_about = None)]
struct Args {
    /// Path to the YAML configuration (created with defaults if missing)
    #[arg(short, long, default_value = "doser.yaml")]
    config: PathBuf,

    /// Target sheet to load (overrides files.targets)
    #[arg(short, long)]
    targets: Option<PathBuf>,

    /// Control channel as host:port (overrides configuration)
    #[arg(long)]
    control: Option<String>,

    /// Data channel as host:port (overrides configuration)
    #[arg(long)]
    data: Option<String>,

    /// Control law to use (overrides configuration)
    #[arg(long, value_parser = parse_law)]
    law: Option<ControlLawKind>,

    /// Results directory (overrides files.results_dir)
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "doser=trace" (overrides logging.level)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn parse_law(value: &str) -> Result<ControlLawKind, String> {
    match value {
        "deterministic" => Ok(ControlLawKind::Deterministic),
        "fuzzy" => Ok(ControlLawKind::Fuzzy),
        other => Err(format!("unknown control law '{other}', expected deterministic or fuzzy")),
    }
}

fn parse_endpoint(value: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) =
        value.rsplit_once(':').with_context(|| format!("'{value}' is not host:port"))?;
    let port = port.parse().with_context(|| format!("invalid port in '{value}'"))?;
    Ok((host.to_string(), port))
}

fn apply_overrides(config: &mut ClientConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(control) = &args.control {
        let (host, port) = parse_endpoint(control)?;
        config.set_control_endpoint(host, port);
    }
    if let Some(data) = &args.data {
        let (host, port) = parse_endpoint(data)?;
        config.set_data_endpoint(host, port);
    }
    if let Some(law) = args.law {
        config.control_law = law;
    }
    if let Some(dir) = &args.results_dir {
        config.files.results_dir = dir.clone();
    }
    if let Some(targets) = &args.targets {
        config.files.targets = Some(targets.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ClientConfig::load_or_create(&args.config);
    apply_overrides(&mut config, &args)?;
    logging::init(&config.logging);

    let Some(targets) = config.files.targets.clone() else {
        bail!("no target sheet given; pass --targets or set files.targets");
    };

    let doser = Doser::new(config).context("failed to set up the client")?;
    doser.connect_control().await.context("control channel unavailable")?;
    if let Err(e) = doser.connect_data().await {
        warn!("Data channel unavailable, telemetry will not be recorded: {}", e);
    }

    let rows = doser
        .load_targets(&targets)
        .await
        .with_context(|| format!("failed to load {}", targets.display()))?;
    info!(rows, sheet = %targets.display(), "Targets loaded");

    doser.start().await.context("run refused to start")?;

    let mut updates = doser.status_updates();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let phase = doser.stop().await?;
                info!(%phase, "Interrupted");
                break;
            }
            update = updates.next() => {
                let Some(status) = update else { break };
                info!(
                    phase = %status.phase,
                    row = status.row,
                    material = status.material.as_deref().unwrap_or("-"),
                    weight = status.last_weight,
                    amplitude = ?status.last_actuation.map(|a| a.amplitude),
                    angle = ?status.last_actuation.map(|a| a.angle),
                    control = ?status.control,
                    data = ?status.data,
                    "Status"
                );
                if status.phase == Phase::Completed {
                    info!("All targets processed");
                    break;
                }
                if status.control == LinkState::Disconnected {
                    let phase = doser.stop().await?;
                    warn!(%phase, "Control channel lost, run stopped");
                    break;
                }
            }
        }
    }

    doser.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_split_on_last_colon() {
        let (host, port) = parse_endpoint("192.168.1.20:1023").unwrap();
        assert_eq!((host.as_str(), port), ("192.168.1.20", 1023));
        assert!(parse_endpoint("localhost").is_err());
        assert!(parse_endpoint("localhost:99999").is_err());
    }

    #[test]
    fn overrides_replace_config_values() {
        let args = Args::parse_from([
            "doser",
            "--control",
            "10.0.0.5:2000",
            "--law",
            "fuzzy",
            "--targets",
            "batch.csv",
        ]);
        let mut config = ClientConfig::default();
        apply_overrides(&mut config, &args).unwrap();

        assert_eq!(config.communication.control.host, "10.0.0.5");
        assert_eq!(config.communication.control.port, 2000);
        assert_eq!(config.control_law, ControlLawKind::Fuzzy);
        assert_eq!(config.files.targets, Some(PathBuf::from("batch.csv")));
        assert!(parse_law("pid").is_err());
    }
}
