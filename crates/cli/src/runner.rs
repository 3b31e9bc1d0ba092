use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use boreas_alive::start_alive_detection;
use boreas_common::{AliveConfig, AliveTestSet, MemoryQueue, ScanRestrictions};
use boreas_target_resolver::TargetResolver;

use crate::args::AliveArgs;
use crate::output::print_report;

pub async fn run_alive(args: AliveArgs) -> Result<()> {
    let config = build_config(&args)?;
    let selector = config.selector();

    let targets = TargetResolver::new()
        .resolve_list(&args.targets, args.exclude.as_deref())
        .context("Failed to resolve targets")?;
    let total = targets.len();

    info!("Starting alive detection...");
    info!("Targets: {} host(s)", total);
    info!("Alive tests: {}", selector);
    if selector.has_tcp() {
        info!("TCP ping ports: {:?}", config.tcp_ports);
    }

    let restrictions = Arc::new(ScanRestrictions::new(config.max_scan_hosts));
    let queue = Arc::new(MemoryQueue::new());
    let targets = Arc::new(targets);

    let detection = start_alive_detection(
        targets.clone(),
        selector,
        restrictions.clone(),
        config,
        queue.clone(),
    )
    .context("Failed to start alive detection. Raw sockets need CAP_NET_RAW or root.")?;
    info!("Run id: {}", detection.run_id());

    let signal = detection.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing with partial results");
            signal.trigger();
        }
    });

    let report = detection.wait().await.context("Alive detection failed")?;
    print_report(&report, &targets, &restrictions, &args.output_format)?;
    Ok(())
}

/// Preset (or config file) first, then explicit flags on top.
fn build_config(args: &AliveArgs) -> Result<AliveConfig> {
    let mut config = match &args.config {
        Some(path) => AliveConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => match args.preset.as_str() {
            "fast" => AliveConfig::fast(),
            "stealth" => AliveConfig::stealth(),
            _ => AliveConfig::default(),
        },
    };

    if let Some(tests) = &args.tests {
        let selector: AliveTestSet = tests
            .parse()
            .with_context(|| format!("Invalid alive tests '{}'", tests))?;
        config = config.with_alive_test(selector);
    }
    if let Some(ports) = &args.ports {
        config = config.with_tcp_ports(parse_ports(ports)?);
    }
    if let Some(burst) = args.burst {
        config = config.with_burst(burst);
    }
    if let Some(ms) = args.burst_timeout_ms {
        config = config.with_burst_timeout(Duration::from_millis(ms));
    }
    if let Some(secs) = args.wait_secs {
        config = config.with_wait_for_replies(Duration::from_secs(secs));
    }
    if let Some(port) = args.filter_port {
        config = config.with_filter_port(port);
    }
    if args.max_hosts.is_some() {
        config = config.with_max_scan_hosts(args.max_hosts);
    }

    config.validate()?;
    Ok(config)
}

/// Parses a port string like "80,443,1000-1010" into a vector of u16 ports
fn parse_ports(ports_str: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();

    for part in ports_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('-') {
            let range: Vec<&str> = part.split('-').collect();
            if range.len() != 2 {
                return Err(anyhow!("Invalid port range: {}", part));
            }

            let start: u16 = range[0].parse().context(format!("Invalid start port: {}", range[0]))?;
            let end: u16 = range[1].parse().context(format!("Invalid end port: {}", range[1]))?;

            if start > end {
                return Err(anyhow!("Invalid range: start > end"));
            }

            ports.extend(start..=end);
        } else {
            let port: u16 = part.parse().context(format!("Invalid port: {}", part))?;
            ports.push(port);
        }
    }

    if ports.is_empty() {
        Err(anyhow!("No ports specified"))
    } else {
        Ok(ports)
    }
}
