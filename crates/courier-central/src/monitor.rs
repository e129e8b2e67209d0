//! Host and process telemetry for `manage.monitor`.
//!
//! Collection itself belongs to the platform, not to routing, so the
//! broker talks to a [`TelemetryProbe`] trait object and ships whatever
//! comes back. The bundled [`SystemProbe`] is a best-effort `/proc` reader:
//! on hosts without `/proc` it reports `valid: false` with an error
//! message instead of failing the request.
//!
//! Probes may block (the bundled one samples CPU time twice); the runtime
//! always calls them from a blocking-friendly task.

use serde::Serialize;

/// Host-level telemetry, shipped at `monitor.os.*`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsTelemetry {
    /// Whether the remaining fields carry real data.
    pub valid: bool,
    /// Operating system family, e.g. `"Linux"` or `"OSX"`.
    pub os: String,
    /// Host name.
    pub host_name: String,
    /// Kernel name.
    pub kernel_name: String,
    /// Kernel version.
    pub kernel_version: String,
    /// CPU architecture.
    pub architecture: String,
    /// Total physical memory, bytes.
    pub total_memory: u64,
    /// Memory in use, bytes.
    pub used_memory: u64,
    /// Free memory, bytes.
    pub free_memory: u64,
    /// CPU busy share since the previous sample, percent.
    pub cpu_busy_pct: f64,
    /// CPU idle share since the previous sample, percent.
    pub cpu_idle_pct: f64,
    /// Why collection failed, when `valid` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Process-level telemetry, shipped at `monitor.process.*`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTelemetry {
    /// Resident memory of this process, bytes.
    pub used_bytes: u64,
    /// Memory still available to the process (host free memory), bytes.
    pub available_bytes: u64,
    /// Live threads in this process.
    pub threads: u64,
    /// CPUs available to this process.
    pub cpus: u64,
}

/// One telemetry sample.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Telemetry {
    /// Host-level readings.
    pub os: OsTelemetry,
    /// Process-level readings.
    pub process: ProcessTelemetry,
}

impl Telemetry {
    /// A sample that reports collection failure.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            os: OsTelemetry {
                valid: false,
                os: os_family(),
                architecture: std::env::consts::ARCH.to_string(),
                error_message: Some(reason.into()),
                ..OsTelemetry::default()
            },
            process: ProcessTelemetry::default(),
        }
    }
}

/// Source of telemetry samples.
pub trait TelemetryProbe: Send + Sync {
    /// Take one sample. May block briefly.
    fn collect(&self) -> Telemetry;
}

/// Best-effort probe backed by `/proc`.
pub struct SystemProbe;

impl TelemetryProbe for SystemProbe {
    fn collect(&self) -> Telemetry {
        match collect_proc() {
            Ok(sample) => sample,
            Err(reason) => Telemetry::invalid(reason),
        }
    }
}

fn os_family() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "OSX".to_string(),
        other => other.to_string(),
    }
}

fn read_trimmed(path: &str) -> Result<String, String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| format!("cannot read {path}: {e}"))
}

fn collect_proc() -> Result<Telemetry, String> {
    let meminfo = read_trimmed("/proc/meminfo")?;
    let (total, free, available) = parse_meminfo(&meminfo)?;

    let busy_pct = sample_cpu_busy()?;

    let os = OsTelemetry {
        valid: true,
        os: os_family(),
        host_name: read_trimmed("/etc/hostname")
            .or_else(|_| std::env::var("HOSTNAME").map_err(|e| e.to_string()))
            .unwrap_or_else(|_| "unknown".to_string()),
        kernel_name: read_trimmed("/proc/sys/kernel/ostype").unwrap_or_default(),
        kernel_version: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
        architecture: std::env::consts::ARCH.to_string(),
        total_memory: total,
        used_memory: total.saturating_sub(available),
        free_memory: free,
        cpu_busy_pct: busy_pct,
        cpu_idle_pct: 100.0 - busy_pct,
        error_message: None,
    };

    let process = ProcessTelemetry {
        used_bytes: resident_bytes().unwrap_or(0),
        available_bytes: available,
        threads: thread_count().unwrap_or(0),
        cpus: std::thread::available_parallelism().map_or(0, |n| n.get() as u64),
    };

    Ok(Telemetry { os, process })
}

/// `(MemTotal, MemFree, MemAvailable)` in bytes.
fn parse_meminfo(text: &str) -> Result<(u64, u64, u64), String> {
    let mut total = None;
    let mut free = None;
    let mut available = None;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or_default();
        let value: Option<u64> = parts.next().and_then(|v| v.parse().ok());
        match key {
            "MemTotal:" => total = value,
            "MemFree:" => free = value,
            "MemAvailable:" => available = value,
            _ => {}
        }
    }
    match (total, free) {
        (Some(total), Some(free)) => {
            let available = available.unwrap_or(free);
            // /proc/meminfo reports kilobytes.
            Ok((total * 1024, free * 1024, available * 1024))
        }
        _ => Err("MemTotal/MemFree missing from /proc/meminfo".to_string()),
    }
}

/// Busy percentage over a 100 ms sampling window.
fn sample_cpu_busy() -> Result<f64, String> {
    let first = parse_cpu_line(&read_trimmed("/proc/stat")?)?;
    std::thread::sleep(std::time::Duration::from_millis(100));
    let second = parse_cpu_line(&read_trimmed("/proc/stat")?)?;

    let total = second.0.saturating_sub(first.0);
    let idle = second.1.saturating_sub(first.1);
    if total == 0 {
        return Ok(0.0);
    }
    Ok(100.0 * total.saturating_sub(idle) as f64 / total as f64)
}

/// `(total_jiffies, idle_jiffies)` from the aggregate `cpu` line.
fn parse_cpu_line(stat: &str) -> Result<(u64, u64), String> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| "no aggregate cpu line in /proc/stat".to_string())?;
    let fields: Vec<u64> =
        line.split_whitespace().skip(1).filter_map(|v| v.parse().ok()).collect();
    if fields.len() < 4 {
        return Err("aggregate cpu line is too short".to_string());
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait when present.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok((total, idle))
}

fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

fn thread_count() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|l| l.starts_with("Threads:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parsing() {
        let text = "MemTotal:       16384 kB\nMemFree:        4096 kB\nMemAvailable:   8192 kB\nBuffers: 10 kB";
        let (total, free, available) = parse_meminfo(text).unwrap();
        assert_eq!(total, 16384 * 1024);
        assert_eq!(free, 4096 * 1024);
        assert_eq!(available, 8192 * 1024);
    }

    #[test]
    fn meminfo_without_available_falls_back_to_free() {
        let text = "MemTotal: 100 kB\nMemFree: 40 kB";
        let (_, free, available) = parse_meminfo(text).unwrap();
        assert_eq!(available, free);
    }

    #[test]
    fn meminfo_missing_fields_is_an_error() {
        assert!(parse_meminfo("Buffers: 10 kB").is_err());
    }

    #[test]
    fn cpu_line_parsing() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3 4";
        let (total, idle) = parse_cpu_line(stat).unwrap();
        assert_eq!(total, 1000);
        assert_eq!(idle, 850);
    }

    #[test]
    fn invalid_sample_carries_the_reason() {
        let sample = Telemetry::invalid("no /proc on this host");
        assert!(!sample.os.valid);
        assert_eq!(sample.os.error_message.as_deref(), Some("no /proc on this host"));
    }

    #[test]
    fn probe_never_panics() {
        let sample = SystemProbe.collect();
        if sample.os.valid {
            assert!(sample.os.total_memory > 0);
            assert!(sample.os.cpu_busy_pct >= 0.0 && sample.os.cpu_busy_pct <= 100.0);
        } else {
            assert!(sample.os.error_message.is_some());
        }
    }
}
