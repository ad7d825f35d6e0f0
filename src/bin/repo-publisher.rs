use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use repo_publisher::publish::{last_run, recover};
use repo_publisher::{load_config, AptPublisher, PublishContext, RpmPublisher};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  repo-publisher apt <config.toml> <work_dir> [artifact...]\n  repo-publisher rpm <config.toml> <work_dir>\n  repo-publisher recover <work_dir>\n  repo-publisher last-run <work_dir>"
}

/// Filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_LOG_FILTER: &str = "info";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config, work_dir, artifacts @ ..] if cmd == "apt" => {
            publish_apt(Path::new(config), Path::new(work_dir), artifacts)
        }
        [cmd, config, work_dir] if cmd == "rpm" => {
            publish_rpm(Path::new(config), Path::new(work_dir))
        }
        [cmd, work_dir] if cmd == "recover" => {
            let report = recover(Path::new(work_dir))?;
            println!(
                "{} held artifact(s) will be merged by the next apt run; {} duplicate(s)",
                report.pending.len(),
                report.duplicates.len()
            );
            Ok(())
        }
        [cmd, work_dir] if cmd == "last-run" => show_last_run(Path::new(work_dir)),
        _ => bail!(usage()),
    }
}

fn publish_apt(config: &Path, work_dir: &Path, artifacts: &[String]) -> Result<()> {
    let config = load_config(config)?;
    let publisher = AptPublisher::from_config(&config)?;
    let ctx = PublishContext::new(work_dir)?
        .with_incoming(artifacts.iter().map(PathBuf::from).collect());
    let report = publisher.publish(&ctx)?;
    for codename in &report.codenames {
        info!(
            codename = %codename.codename,
            packages = codename.packages,
            architectures = %codename.architectures.join(","),
            "codename published"
        );
    }
    println!("{report}");
    Ok(())
}

fn publish_rpm(config: &Path, work_dir: &Path) -> Result<()> {
    let config = load_config(config)?;
    let publisher = RpmPublisher::from_config(&config)?;
    let report = publisher.publish(work_dir)?;
    println!("{report}");
    Ok(())
}

fn show_last_run(work_dir: &Path) -> Result<()> {
    let Some(manifest) = last_run(work_dir)? else {
        println!("no recorded run in '{}'", work_dir.display());
        return Ok(());
    };
    let json = serde_json::to_string_pretty(&manifest).context("serializing run manifest")?;
    println!("{json}");
    Ok(())
}
