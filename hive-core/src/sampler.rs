//! Per-agent instruction sampling
//!
//! Measures the instruction throughput of locally running agents by
//! attaching an external profiler to their PID for a fixed window. Both the
//! central controller and the outposts sample their own agents with this
//! module; results travel as serialized MIPS values keyed `agent-<name>`.

use std::collections::HashMap;
use std::path::Path;

use futures::future::join_all;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

use crate::serial;

/// Profiling window in seconds.
pub const SAMPLE_WINDOW_SECS: u64 = 10;

fn instructions_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([\d,.]+)\s+instructions\b").expect("instruction counter pattern")
    })
}

/// Extract the retired-instruction count from profiler output.
///
/// The counter may be printed with either `,` or `.` group separators
/// depending on the locale; both are stripped.
pub fn parse_instructions(output: &str) -> Option<u64> {
    for line in output.lines() {
        if let Some(caps) = instructions_re().captures(line) {
            let digits = caps[1].replace([',', '.'], "");
            if let Ok(count) = digits.parse() {
                return Some(count);
            }
        }
    }
    None
}

/// MIPS over the sampling window for a given instruction count.
pub fn mips_for(instructions: u64) -> f64 {
    (instructions as f64 / SAMPLE_WINDOW_SECS as f64) / 1_000_000.0
}

/// Sample every agent that has a live PID file under `var_dir`.
///
/// Returns `{"agent-<name>": serialized(mips)}`. Agents without a PID file
/// and profiler runs whose output cannot be parsed are logged and skipped;
/// the gather itself never fails.
pub async fn gather_agent_mips(
    agents: &[String],
    perf_path: &str,
    var_dir: &Path,
) -> HashMap<String, String> {
    let mut sampled = Vec::new();

    for agent in agents {
        let pid_file = var_dir.join(format!("{agent}.pid"));

        let pid = match tokio::fs::read_to_string(&pid_file).await {
            Ok(content) => content.trim().to_string(),
            Err(_) => {
                error!("no PID file found for agent {agent}");
                continue;
            }
        };

        sampled.push((agent.clone(), run_profiler(perf_path, pid)));
    }

    let mut info = HashMap::new();

    debug!("waiting for {} profiler processes to finish", sampled.len());
    let (names, runs): (Vec<_>, Vec<_>) = sampled.into_iter().unzip();

    for (agent, output) in names.into_iter().zip(join_all(runs).await) {
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("profiler failed for agent {agent}: {e}");
                continue;
            }
        };

        match parse_instructions(&output) {
            Some(instructions) => {
                let mips = mips_for(instructions);
                debug!("agent {agent}: {instructions} instructions, {mips} MIPS");
                info.insert(format!("agent-{agent}"), serial::serialize_f64(mips));
            }
            None => {
                warn!("did not find instruction count of agent {agent}");
                debug!("profiler output was: {output}");
            }
        }
    }

    info
}

/// Run one profiler window against a PID. The counter lands on stderr.
async fn run_profiler(perf_path: &str, pid: String) -> anyhow::Result<String> {
    let window = SAMPLE_WINDOW_SECS.to_string();
    let output = tokio::process::Command::new(perf_path)
        .args([
            "stat",
            "-e",
            "instructions",
            "-p",
            pid.as_str(),
            "sleep",
            window.as_str(),
        ])
        .output()
        .await?;

    Ok(String::from_utf8_lossy(&output.stderr).into_owned())
}
