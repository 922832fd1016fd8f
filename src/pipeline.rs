use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use tracing::{info, warn};

use crate::{
    config::{Config, ReadinessMode},
    probe::{ProbeFailure, ProbeOutcome, ProbeResult},
    rank::{WriteOutcome, rank, write_ranked},
    scheduler::{NodeProber, XrayProber, run_all},
    xray::EngineOptions,
};

const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a run needs, resolved once from the command line.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub engine_bin: PathBuf,
    pub work_root: PathBuf,
    pub target_url: String,
    pub concurrency: usize,
    pub probe_timeout: Duration,
    pub readiness: ReadinessMode,
    pub ready_timeout: Duration,
    pub max_nodes: usize,
    pub output: PathBuf,
    pub annotate_latency: bool,
}

impl ProbeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine_bin: config.engine_path(),
            work_root: config.work_root(),
            target_url: config.target_url.clone(),
            concurrency: usize::try_from(config.concurrency).unwrap_or(usize::MAX),
            probe_timeout: config.probe_timeout(),
            readiness: config.readiness,
            ready_timeout: config.ready_timeout(),
            max_nodes: usize::try_from(config.max_nodes).unwrap_or(usize::MAX),
            output: config.output.clone(),
            annotate_latency: !config.no_latency_annotation,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            engine_bin: self.engine_bin.clone(),
            work_root: self.work_root.clone(),
            readiness: self.readiness,
            ready_timeout: self.ready_timeout,
            stop_timeout: ENGINE_STOP_TIMEOUT,
        }
    }

    pub fn xray_prober(&self) -> XrayProber {
        XrayProber::new(self.engine_options(), &self.target_url, self.probe_timeout)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub ok: usize,
    pub decode_failed: usize,
    pub unsupported: usize,
    pub process_start_failed: usize,
    pub timed_out: usize,
    pub network_failed: usize,
    pub written: usize,
}

impl RunSummary {
    fn tally(results: &[ProbeResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match &result.outcome {
                ProbeOutcome::Success { .. } => summary.ok += 1,
                ProbeOutcome::Failure(ProbeFailure::Decode(_)) => summary.decode_failed += 1,
                ProbeOutcome::Failure(ProbeFailure::UnsupportedProtocol { .. }) => {
                    summary.unsupported += 1
                }
                ProbeOutcome::Failure(ProbeFailure::ProcessStart { .. }) => {
                    summary.process_start_failed += 1
                }
                ProbeOutcome::Failure(ProbeFailure::Timeout) => summary.timed_out += 1,
                ProbeOutcome::Failure(ProbeFailure::Network { .. }) => {
                    summary.network_failed += 1
                }
            }
        }
        summary
    }
}

/// Probes `nodes`, ranks the survivors and writes them to `settings.output`.
///
/// No nodes, or no successful probe, leaves the output file as it was.
pub async fn run(
    settings: &ProbeSettings,
    nodes: Vec<String>,
    prober: Arc<dyn NodeProber>,
) -> anyhow::Result<RunSummary> {
    if nodes.is_empty() {
        warn!("no nodes collected; nothing to probe");
        return Ok(RunSummary::default());
    }

    info!(
        nodes = nodes.len(),
        concurrency = settings.concurrency,
        "probing nodes"
    );
    let results = run_all(nodes, prober, settings.concurrency).await;
    let mut summary = RunSummary::tally(&results);

    let ranked = rank(&results, settings.max_nodes);
    match write_ranked(&settings.output, &ranked, settings.annotate_latency)
        .with_context(|| format!("write {}", settings.output.display()))?
    {
        WriteOutcome::Written(n) => {
            summary.written = n;
            info!(output = %settings.output.display(), written = n, "ranked nodes written");
        }
        WriteOutcome::SkippedEmpty => {
            warn!(
                output = %settings.output.display(),
                "no node passed the probe; output left untouched"
            );
        }
    }

    info!(
        total = summary.total,
        ok = summary.ok,
        decode_failed = summary.decode_failed,
        unsupported = summary.unsupported,
        process_start_failed = summary.process_start_failed,
        timed_out = summary.timed_out,
        network_failed = summary.network_failed,
        written = summary.written,
        "run finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ProbeFuture, ProbePlan};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct LatencyTable(HashMap<String, Result<u64, ProbeFailure>>);

    impl NodeProber for LatencyTable {
        fn probe(&self, plan: ProbePlan) -> ProbeFuture {
            let outcome = self
                .0
                .get(&plan.descriptor.host)
                .cloned()
                .unwrap_or(Err(ProbeFailure::Timeout));
            Box::pin(async move { outcome })
        }
    }

    fn table(entries: &[(&str, Result<u64, ProbeFailure>)]) -> Arc<dyn NodeProber> {
        Arc::new(LatencyTable(
            entries
                .iter()
                .map(|(host, r)| (host.to_string(), r.clone()))
                .collect(),
        ))
    }

    fn settings(output: PathBuf, max_nodes: usize) -> ProbeSettings {
        ProbeSettings {
            engine_bin: PathBuf::from("xray"),
            work_root: std::env::temp_dir(),
            target_url: crate::probe::DEFAULT_TARGET_URL.to_string(),
            concurrency: 4,
            probe_timeout: Duration::from_secs(1),
            readiness: ReadinessMode::Poll,
            ready_timeout: Duration::from_millis(100),
            max_nodes,
            output,
            annotate_latency: true,
        }
    }

    #[tokio::test]
    async fn ranks_truncates_and_annotates() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("v2ray.txt");
        let a = "trojan://pw@a.example:443#A";
        let b = "trojan://pw@b.example:443#B";
        let c = "trojan://pw@c.example:443#C";
        let d = "vmess://%%%not-base64";

        let summary = run(
            &settings(output.clone(), 2),
            vec![a.into(), b.into(), c.into(), d.into()],
            table(&[("a.example", Ok(50)), ("b.example", Ok(10)), ("c.example", Ok(30))]),
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                total: 4,
                ok: 3,
                decode_failed: 1,
                written: 2,
                ..RunSummary::default()
            }
        );

        let written = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("# generated at: "));
        assert_eq!(lines[1], format!("{b}  # latency: 10ms"));
        assert_eq!(lines[2], format!("{c}  # latency: 30ms"));
    }

    #[tokio::test]
    async fn zero_successes_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("v2ray.txt");

        let summary = run(
            &settings(output.clone(), 5),
            vec![
                "trojan://pw@a.example:443".into(),
                "trojan://pw@b.example:443".into(),
                "hysteria2://pw@h.example:443".into(),
            ],
            table(&[
                (
                    "a.example",
                    Err(ProbeFailure::ProcessStart {
                        message: "exited".into(),
                    }),
                ),
                (
                    "b.example",
                    Err(ProbeFailure::Network {
                        message: "refused".into(),
                    }),
                ),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(summary.written, 0);
        assert_eq!(summary.ok, 0);
        assert_eq!(summary.process_start_failed, 1);
        assert_eq!(summary.network_failed, 1);
        assert_eq!(summary.unsupported, 1);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("v2ray.txt");

        let summary = run(&settings(output.clone(), 5), Vec::new(), table(&[]))
            .await
            .unwrap();
        assert_eq!(summary, RunSummary::default());
        assert!(!output.exists());
    }

    #[test]
    fn settings_follow_config() {
        use clap::Parser as _;
        let cli = crate::config::Cli::try_parse_from([
            "nodeprobe",
            "--concurrency",
            "7",
            "--max-nodes",
            "3",
            "--no-latency-annotation",
        ])
        .unwrap();
        let settings = ProbeSettings::from_config(&cli.config);
        assert_eq!(settings.concurrency, 7);
        assert_eq!(settings.max_nodes, 3);
        assert!(!settings.annotate_latency);
        assert_eq!(settings.engine_options().stop_timeout, ENGINE_STOP_TIMEOUT);
    }
}
