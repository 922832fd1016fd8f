use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::probe::DEFAULT_TARGET_URL;

pub const DEFAULT_SOURCES: &[&str] = &[
    "https://raw.githubusercontent.com/Pawdroid/Free-servers/main/sub",
    "https://raw.githubusercontent.com/free18/v2ray/main/v.txt",
    "https://raw.githubusercontent.com/Flikify/Free-Node/main/v2ray.txt",
    "https://raw.githubusercontent.com/free-nodes/v2rayfree/main/v2",
    "https://raw.githubusercontent.com/ripaojiedian/freenode/main/sub",
];

/// How the orchestrator decides that the engine's SOCKS listener is usable.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessMode {
    /// Connect to the listener every 50ms until it accepts, up to the ready timeout.
    Poll,
    /// Sleep for the ready timeout, then probe.
    Sleep,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "nodeprobe",
    about = "Measure proxy node latency through ephemeral Xray instances",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch sources, probe every node and write the ranked list (default).
    Run,

    /// Download the Xray release for this platform to --engine-bin.
    InstallEngine,

    /// Decode one node and print the engine config it would run with.
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    #[arg(value_name = "NODE")]
    pub node: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long = "engine-bin",
        global = true,
        env = "NODEPROBE_ENGINE_BIN",
        value_name = "PATH",
        default_value = "./xray"
    )]
    pub engine_bin: PathBuf,

    #[arg(
        long = "target-url",
        global = true,
        env = "NODEPROBE_TARGET_URL",
        value_name = "URL",
        default_value = DEFAULT_TARGET_URL
    )]
    pub target_url: String,

    #[arg(
        long,
        global = true,
        env = "NODEPROBE_CONCURRENCY",
        value_name = "N",
        default_value_t = 4,
        value_parser = clap::value_parser!(u64).range(1..=64)
    )]
    pub concurrency: u64,

    #[arg(
        long = "timeout-secs",
        global = true,
        env = "NODEPROBE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 8,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub timeout_secs: u64,

    #[arg(
        long = "ready-timeout-ms",
        global = true,
        env = "NODEPROBE_READY_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 800,
        value_parser = clap::value_parser!(u64).range(50..=10_000)
    )]
    pub ready_timeout_ms: u64,

    #[arg(
        long,
        global = true,
        env = "NODEPROBE_READINESS",
        value_name = "MODE",
        default_value = "poll",
        value_enum
    )]
    pub readiness: ReadinessMode,

    #[arg(
        long = "max-nodes",
        global = true,
        env = "NODEPROBE_MAX_NODES",
        value_name = "N",
        default_value_t = 20,
        value_parser = clap::value_parser!(u64).range(1..=1000)
    )]
    pub max_nodes: u64,

    #[arg(
        long,
        global = true,
        env = "NODEPROBE_OUTPUT",
        value_name = "PATH",
        default_value = "v2ray.txt"
    )]
    pub output: PathBuf,

    /// Parent directory for per-probe working directories (defaults to the system temp dir).
    #[arg(long = "work-dir", global = true, env = "NODEPROBE_WORK_DIR", value_name = "PATH")]
    pub work_dir: Option<PathBuf>,

    #[arg(
        long = "source",
        global = true,
        env = "NODEPROBE_SOURCES",
        value_name = "URL_OR_PATH",
        value_delimiter = ',',
        default_values_t = DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect::<Vec<_>>()
    )]
    pub sources: Vec<String>,

    #[arg(
        long = "fetch-timeout-secs",
        global = true,
        env = "NODEPROBE_FETCH_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 20,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub fetch_timeout_secs: u64,

    #[arg(
        long = "no-latency-annotation",
        global = true,
        env = "NODEPROBE_NO_LATENCY_ANNOTATION",
        action = clap::ArgAction::SetTrue
    )]
    pub no_latency_annotation: bool,
}

impl Config {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// The engine `run` launches. A bare name like `xray` means `./xray` once that file exists
    /// (where `install-engine` puts it), otherwise a `$PATH` lookup.
    pub fn engine_path(&self) -> PathBuf {
        let path = if is_bare_name(&self.engine_bin) {
            let local = Path::new(".").join(&self.engine_bin);
            if !local.is_file() {
                return self.engine_bin.clone();
            }
            local
        } else {
            self.engine_bin.clone()
        };
        // The engine starts inside its own working directory.
        std::path::absolute(&path).unwrap_or(path)
    }

    /// Install target for `install-engine`: a bare name lands in the working directory.
    pub fn engine_install_path(&self) -> PathBuf {
        if is_bare_name(&self.engine_bin) {
            Path::new(".").join(&self.engine_bin)
        } else {
            self.engine_bin.clone()
        }
    }

    /// Always absolute: the engine reads its config from inside its own working directory.
    pub fn work_root(&self) -> PathBuf {
        let root = self.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        std::path::absolute(&root).unwrap_or(root)
    }
}

fn is_bare_name(path: &Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["nodeprobe"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.engine_bin, PathBuf::from("./xray"));
        assert_eq!(cli.config.target_url, DEFAULT_TARGET_URL);
        assert_eq!(cli.config.concurrency, 4);
        assert_eq!(cli.config.timeout_secs, 8);
        assert_eq!(cli.config.ready_timeout_ms, 800);
        assert_eq!(cli.config.readiness, ReadinessMode::Poll);
        assert_eq!(cli.config.max_nodes, 20);
        assert_eq!(cli.config.output, PathBuf::from("v2ray.txt"));
        assert_eq!(cli.config.work_dir, None);
        assert_eq!(cli.config.sources.len(), DEFAULT_SOURCES.len());
        assert_eq!(cli.config.fetch_timeout_secs, 20);
        assert!(!cli.config.no_latency_annotation);
    }

    #[test]
    fn sources_accept_comma_delimited_and_repeated() {
        let cli = Cli::try_parse_from([
            "nodeprobe",
            "--source",
            "a.txt,https://example.com/sub",
            "--source",
            "b.txt",
        ])
        .unwrap();
        assert_eq!(
            cli.config.sources,
            vec!["a.txt", "https://example.com/sub", "b.txt"]
        );
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["nodeprobe", "inspect", "ss://x", "--readiness", "sleep"])
            .unwrap();
        match cli.command {
            Some(Command::Inspect(args)) => assert_eq!(args.node, "ss://x"),
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.config.readiness, ReadinessMode::Sleep);

        let cli = Cli::try_parse_from(["nodeprobe", "install-engine"]).unwrap();
        assert!(matches!(cli.command, Some(Command::InstallEngine)));
    }

    #[test]
    fn rejects_invalid_concurrency() {
        let err = Cli::try_parse_from(["nodeprobe", "--concurrency", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--concurrency"));
        assert!(msg.contains("1..=64"));
    }

    #[test]
    fn rejects_invalid_timeout_secs() {
        let err = Cli::try_parse_from(["nodeprobe", "--timeout-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--timeout-secs"));
        assert!(msg.contains("1..=120"));
    }

    #[test]
    fn rejects_invalid_ready_timeout_ms() {
        let err = Cli::try_parse_from(["nodeprobe", "--ready-timeout-ms", "10"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--ready-timeout-ms"));
        assert!(msg.contains("50..=10000"));
    }

    #[test]
    fn rejects_invalid_max_nodes() {
        let err = Cli::try_parse_from(["nodeprobe", "--max-nodes", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--max-nodes"));
        assert!(msg.contains("1..=1000"));
    }

    #[test]
    fn engine_paths_agree_between_install_and_run() {
        let cli = Cli::try_parse_from(["nodeprobe"]).unwrap();
        assert_eq!(cli.config.engine_install_path(), PathBuf::from("./xray"));
        assert_eq!(
            cli.config.engine_path(),
            std::env::current_dir().unwrap().join("xray")
        );

        let cli = Cli::try_parse_from(["nodeprobe", "--engine-bin", "/opt/xray/xray"]).unwrap();
        assert_eq!(cli.config.engine_install_path(), PathBuf::from("/opt/xray/xray"));
        assert_eq!(cli.config.engine_path(), PathBuf::from("/opt/xray/xray"));

        // No `./nodeprobe-no-such-engine` exists, so the bare name stays a PATH lookup.
        let cli =
            Cli::try_parse_from(["nodeprobe", "--engine-bin", "nodeprobe-no-such-engine"]).unwrap();
        assert_eq!(
            cli.config.engine_install_path(),
            PathBuf::from("./nodeprobe-no-such-engine")
        );
        assert_eq!(
            cli.config.engine_path(),
            PathBuf::from("nodeprobe-no-such-engine")
        );
    }

    #[test]
    fn durations_follow_flags() {
        let cli = Cli::try_parse_from([
            "nodeprobe",
            "--timeout-secs",
            "3",
            "--ready-timeout-ms",
            "250",
            "--work-dir",
            "/tmp/np",
        ])
        .unwrap();
        assert_eq!(cli.config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(cli.config.ready_timeout(), Duration::from_millis(250));
        assert_eq!(cli.config.work_root(), PathBuf::from("/tmp/np"));
    }
}
