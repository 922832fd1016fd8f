use anyhow::{Context as _, Result};
use std::{io::IsTerminal as _, sync::Arc};

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use nodeprobe::{
    config::{Cli, Command, Config},
    install,
    node::{self, Protocol},
    pipeline::{self, ProbeSettings},
    sources,
    xray,
};

/// Listen port shown by `inspect`; a real probe allocates a free one.
const INSPECT_LISTEN_PORT: u16 = 10808;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_probe(cli.config).await,
        Command::InstallEngine => install_engine(&cli.config).await,
        Command::Inspect(args) => inspect(&args.node),
    }
}

async fn run_probe(config: Config) -> Result<()> {
    let settings = ProbeSettings::from_config(&config);
    info!(
        version = nodeprobe::version::VERSION,
        engine = %settings.engine_bin.display(),
        work_root = %settings.work_root.display(),
        "nodeprobe starting"
    );

    // Fail early on an unusable work root instead of once per node.
    std::fs::create_dir_all(&settings.work_root)
        .with_context(|| format!("create work dir {}", settings.work_root.display()))?;

    let collected = sources::collect(&config.sources, config.fetch_timeout()).await;
    let prober = Arc::new(settings.xray_prober());
    pipeline::run(&settings, collected.nodes, prober).await?;
    Ok(())
}

async fn install_engine(config: &Config) -> Result<()> {
    let dest = config.engine_install_path();
    install::install_engine(install::RELEASE_BASE_URL, install::detect_cpu_arch(), &dest).await
}

fn inspect(raw: &str) -> Result<()> {
    let descriptor = node::decode(raw).context("decode node")?;
    let protocol = match &descriptor.protocol {
        Protocol::Bare { scheme: Some(scheme) } => scheme.as_str(),
        other => other.as_str(),
    };
    println!(
        "# {protocol} {}:{}{}",
        descriptor.host,
        descriptor.port,
        descriptor
            .name
            .as_deref()
            .map(|n| format!(" ({n})"))
            .unwrap_or_default()
    );

    let config = xray::synthesize(&descriptor, INSPECT_LISTEN_PORT).context("synthesize config")?;
    println!("{}", serde_json::to_string_pretty(config.as_json())?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .compact()
        .init();
}
