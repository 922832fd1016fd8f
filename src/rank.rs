use std::{io, path::Path};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{probe::ProbeResult, util::write_atomic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedNode {
    pub raw: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedOutput {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<RankedNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    /// Nothing succeeded; any existing output file was left untouched.
    SkippedEmpty,
}

/// Keeps successful results, fastest first. Equal latencies keep discovery order.
pub fn rank(results: &[ProbeResult], max_nodes: usize) -> RankedOutput {
    rank_at(results, max_nodes, Utc::now())
}

pub fn rank_at(results: &[ProbeResult], max_nodes: usize, now: DateTime<Utc>) -> RankedOutput {
    let mut ok: Vec<(u64, usize, &str)> = results
        .iter()
        .filter_map(|r| r.latency_ms().map(|ms| (ms, r.index, r.raw.as_str())))
        .collect();
    ok.sort_by_key(|(ms, index, _)| (*ms, *index));
    ok.truncate(max_nodes);

    RankedOutput {
        generated_at: now,
        entries: ok
            .into_iter()
            .map(|(latency_ms, _, raw)| RankedNode {
                raw: raw.to_string(),
                latency_ms,
            })
            .collect(),
    }
}

impl RankedOutput {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self, annotate: bool) -> String {
        let mut out = format!(
            "# generated at: {}\n",
            self.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        for entry in &self.entries {
            out.push_str(&entry.raw);
            if annotate {
                out.push_str(&format!("  # latency: {}ms", entry.latency_ms));
            }
            out.push('\n');
        }
        out
    }
}

/// Replaces `path` with the rendered output. An empty output never touches the file.
pub fn write_ranked(path: &Path, output: &RankedOutput, annotate: bool) -> io::Result<WriteOutcome> {
    if output.is_empty() {
        return Ok(WriteOutcome::SkippedEmpty);
    }
    write_atomic(path, output.render(annotate).as_bytes())?;
    Ok(WriteOutcome::Written(output.entries.len()))
}
