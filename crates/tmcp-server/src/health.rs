//! Liveness and readiness probes.
//!
//! Liveness is a cheap process-internal check surfaced by `/healthz`.
//! Readiness runs a fixed probe set: a critical probe failing makes the
//! process non-ready; non-critical probes only annotate the report.

use serde::Serialize;
use sysinfo::System;
use tmcp_sandbox::Sandbox;

/// Memory usage fraction that degrades the probe to `warn`.
const MEMORY_WARN: f64 = 0.80;
/// Memory usage fraction that fails the probe.
const MEMORY_FAIL: f64 = 0.90;

/// Result state of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Probe passed.
    Ok,
    /// Probe passed but deserves attention.
    Warn,
    /// Probe failed.
    Fail,
}

/// One probe's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// Probe name (`filesystem`, `memory`, `cpu`, `toolRegistry`).
    pub name: &'static str,
    /// Whether a failure makes the process non-ready.
    pub critical: bool,
    /// Outcome.
    pub status: ProbeStatus,
    /// Human-readable detail.
    pub detail: String,
}

/// Aggregated readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    /// Whether every critical probe passed.
    pub ready: bool,
    /// Individual probe outcomes.
    pub probes: Vec<ProbeResult>,
}

/// Run the fixed probe set.
pub fn run_probes(sandbox: &Sandbox) -> ReadinessReport {
    let probes = vec![
        filesystem_probe(sandbox),
        memory_probe(),
        cpu_probe(),
        tool_registry_probe(),
    ];
    let ready = probes
        .iter()
        .all(|p| !p.critical || p.status != ProbeStatus::Fail);
    ReadinessReport { ready, probes }
}

/// Critical: the sandbox must be writable.
fn filesystem_probe(sandbox: &Sandbox) -> ProbeResult {
    let probe_path = sandbox.prefix().join(".readyz-probe");
    let outcome = std::fs::write(&probe_path, b"probe")
        .and_then(|()| std::fs::remove_file(&probe_path));
    match outcome {
        Ok(()) => ProbeResult {
            name: "filesystem",
            critical: true,
            status: ProbeStatus::Ok,
            detail: "sandbox writable".to_string(),
        },
        Err(e) => ProbeResult {
            name: "filesystem",
            critical: true,
            status: ProbeStatus::Fail,
            detail: format!("sandbox not writable: {e}"),
        },
    }
}

/// Non-critical: heap pressure thresholds at 80% warn / 90% fail.
fn memory_probe() -> ProbeResult {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return ProbeResult {
            name: "memory",
            critical: false,
            status: ProbeStatus::Warn,
            detail: "memory usage unavailable".to_string(),
        };
    }
    let fraction = sys.used_memory() as f64 / total as f64;
    let status = if fraction >= MEMORY_FAIL {
        ProbeStatus::Fail
    } else if fraction >= MEMORY_WARN {
        ProbeStatus::Warn
    } else {
        ProbeStatus::Ok
    };
    ProbeResult {
        name: "memory",
        critical: false,
        status,
        detail: format!("{:.0}% used", fraction * 100.0),
    }
}

/// Non-critical: one-minute load average against available cores.
fn cpu_probe() -> ProbeResult {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;
    let load = System::load_average().one;
    let status = if load > cores {
        ProbeStatus::Warn
    } else {
        ProbeStatus::Ok
    };
    ProbeResult {
        name: "cpu",
        critical: false,
        status,
        detail: format!("load {load:.2} over {cores:.0} cores"),
    }
}

/// Critical: at least one tool must be registered.
fn tool_registry_probe() -> ProbeResult {
    let count = tmcp_ops::tool_registry().len();
    ProbeResult {
        name: "toolRegistry",
        critical: true,
        status: if count > 0 {
            ProbeStatus::Ok
        } else {
            ProbeStatus::Fail
        },
        detail: format!("{count} tools registered"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn healthy_sandbox_is_ready() {
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(tmp.path()).unwrap();
        let report = run_probes(&sandbox);
        assert!(report.ready);
        assert_eq!(report.probes.len(), 4);

        let fs = report.probes.iter().find(|p| p.name == "filesystem").unwrap();
        assert!(fs.critical);
        assert_eq!(fs.status, ProbeStatus::Ok);

        let registry = report
            .probes
            .iter()
            .find(|p| p.name == "toolRegistry")
            .unwrap();
        assert_eq!(registry.status, ProbeStatus::Ok);
    }

    #[test]
    fn non_critical_failures_do_not_block_readiness() {
        let report = ReadinessReport {
            ready: true,
            probes: vec![ProbeResult {
                name: "memory",
                critical: false,
                status: ProbeStatus::Fail,
                detail: "synthetic".to_string(),
            }],
        };
        let ready = report
            .probes
            .iter()
            .all(|p| !p.critical || p.status != ProbeStatus::Fail);
        assert!(ready);
    }

    #[test]
    fn probe_status_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&ProbeStatus::Warn).unwrap(),
            "\"warn\""
        );
    }
}
