use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

/// `gpu_id` value recorded when an instance is given all-device visibility.
pub const GPU_AUTO: &str = "auto";

#[derive(Debug, Clone, Serialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    /// GPU compute utilization 0–100, if available.
    pub utilization_percent: Option<u64>,
}

/// User-facing knob for how a device is picked for a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPreference {
    Auto,
    Cpu,
    First,
    LeastUsed,
    Specific(u32),
}

impl GpuPreference {
    /// Parse the wire form: `auto`, `cpu`, `first`, `least_used`, or a
    /// bare device index.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(GpuPreference::Auto),
            "cpu" | "none" => Ok(GpuPreference::Cpu),
            "first" => Ok(GpuPreference::First),
            "least_used" => Ok(GpuPreference::LeastUsed),
            other => other
                .parse::<u32>()
                .map(GpuPreference::Specific)
                .map_err(|_| Error::validation(format!("unknown GPU selection {other:?}"))),
        }
    }
}

/// Outcome of GPU selection: what the container spec should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuSelection {
    /// No device access.
    Cpu,
    /// All devices visible (`NVIDIA_VISIBLE_DEVICES=all`).
    All,
    /// A single pinned device.
    Device(u32),
}

impl GpuSelection {
    /// The `gpu_id` value persisted on the instance record.
    pub fn gpu_id(&self) -> Option<String> {
        match self {
            GpuSelection::Cpu => None,
            GpuSelection::All => Some(GPU_AUTO.to_string()),
            GpuSelection::Device(i) => Some(i.to_string()),
        }
    }
}

/// Pick a device per policy. Pure so the policy is testable without
/// hardware: `devices` is the cached topology, `running_counts` the
/// Store-derived view keyed by `gpu_id` string.
pub fn select(
    preference: GpuPreference,
    devices: &[GpuDevice],
    running_counts: &HashMap<String, i64>,
) -> Result<GpuSelection> {
    if devices.is_empty() || preference == GpuPreference::Cpu {
        return Ok(GpuSelection::Cpu);
    }

    match preference {
        GpuPreference::Cpu => unreachable!("handled above"),
        GpuPreference::Specific(id) => {
            if devices.iter().any(|d| d.index == id) {
                Ok(GpuSelection::Device(id))
            } else {
                Err(Error::validation(format!("GPU {id} not present")))
            }
        }
        GpuPreference::First => {
            let lowest = devices.iter().map(|d| d.index).min().unwrap_or(0);
            Ok(GpuSelection::Device(lowest))
        }
        GpuPreference::LeastUsed => Ok(GpuSelection::Device(least_used(devices, running_counts))),
        GpuPreference::Auto => {
            if devices.len() == 1 {
                Ok(GpuSelection::Device(devices[0].index))
            } else {
                // Multiple devices: leave all of them visible so the engine
                // can shard across them; recorded as the `auto` sentinel.
                Ok(GpuSelection::All)
            }
        }
    }
}

/// Ascending by running-instance count, then descending by free memory,
/// then lowest index.
fn least_used(devices: &[GpuDevice], running_counts: &HashMap<String, i64>) -> u32 {
    let mut ranked: Vec<&GpuDevice> = devices.iter().collect();
    ranked.sort_by(|a, b| {
        let count_a = running_counts.get(&a.index.to_string()).copied().unwrap_or(0);
        let count_b = running_counts.get(&b.index.to_string()).copied().unwrap_or(0);
        count_a
            .cmp(&count_b)
            .then(b.free_mb.cmp(&a.free_mb))
            .then(a.index.cmp(&b.index))
    });
    ranked[0].index
}

/// Discovers local GPUs via nvidia-smi and caches the topology until an
/// explicit refresh. With no devices the inventory is in CPU-only mode.
#[derive(Debug, Clone, Default)]
pub struct GpuInventory {
    cache: Arc<RwLock<Option<Vec<GpuDevice>>>>,
}

impl GpuInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached topology, discovering on first use.
    pub async fn devices(&self) -> Vec<GpuDevice> {
        if let Some(cached) = self.cache.read().await.clone() {
            return cached;
        }
        self.refresh().await
    }

    /// Re-run discovery and replace the cache.
    pub async fn refresh(&self) -> Vec<GpuDevice> {
        let devices = query_nvidia_smi().await;
        if devices.is_empty() {
            info!("No GPUs detected — CPU-only mode");
        } else {
            info!(count = devices.len(), "Discovered GPUs");
        }
        *self.cache.write().await = Some(devices.clone());
        devices
    }

    pub async fn cpu_only(&self) -> bool {
        self.devices().await.is_empty()
    }
}

/// Query all NVIDIA GPUs via nvidia-smi. Returns an empty vec when the tool
/// is missing, fails, or exceeds its budget.
async fn query_nvidia_smi() -> Vec<GpuDevice> {
    let command = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.used,memory.free,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output();

    let output = match tokio::time::timeout(NVIDIA_SMI_TIMEOUT, command).await {
        Ok(Ok(o)) if o.status.success() => o,
        Ok(_) => return vec![],
        Err(_) => {
            warn!("nvidia-smi query exceeded its time budget");
            return vec![];
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_nvidia_smi(&stdout)
}

fn parse_nvidia_smi(stdout: &str) -> Vec<GpuDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 5 {
                return None;
            }
            Some(GpuDevice {
                index: parts[0].parse().ok()?,
                name: parts[1].to_string(),
                total_mb: parts[2].parse().ok()?,
                used_mb: parts[3].parse().ok()?,
                free_mb: parts[4].parse().ok()?,
                utilization_percent: parts.get(5).and_then(|s| s.parse().ok()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: u32, free_mb: u64) -> GpuDevice {
        GpuDevice {
            index,
            name: format!("GPU-{index}"),
            total_mb: 24_000,
            used_mb: 24_000 - free_mb,
            free_mb,
            utilization_percent: Some(0),
        }
    }

    fn counts(pairs: &[(u32, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(i, c)| (i.to_string(), *c)).collect()
    }

    // -- preference parsing --------------------------------------------------

    #[test]
    fn parse_known_preferences() {
        assert_eq!(GpuPreference::parse("auto").unwrap(), GpuPreference::Auto);
        assert_eq!(GpuPreference::parse("").unwrap(), GpuPreference::Auto);
        assert_eq!(GpuPreference::parse("cpu").unwrap(), GpuPreference::Cpu);
        assert_eq!(GpuPreference::parse("first").unwrap(), GpuPreference::First);
        assert_eq!(
            GpuPreference::parse("least_used").unwrap(),
            GpuPreference::LeastUsed
        );
        assert_eq!(
            GpuPreference::parse("1").unwrap(),
            GpuPreference::Specific(1)
        );
    }

    #[test]
    fn parse_garbage_is_validation_error() {
        assert!(matches!(
            GpuPreference::parse("fastest").unwrap_err(),
            Error::Validation(_)
        ));
    }

    // -- selection policy ----------------------------------------------------

    #[test]
    fn no_devices_always_cpu() {
        for pref in [
            GpuPreference::Auto,
            GpuPreference::First,
            GpuPreference::LeastUsed,
            GpuPreference::Specific(3),
        ] {
            assert_eq!(select(pref, &[], &counts(&[])).unwrap(), GpuSelection::Cpu);
        }
    }

    #[test]
    fn cpu_preference_ignores_devices() {
        let devices = [device(0, 100)];
        assert_eq!(
            select(GpuPreference::Cpu, &devices, &counts(&[])).unwrap(),
            GpuSelection::Cpu
        );
    }

    #[test]
    fn specific_present_is_picked() {
        let devices = [device(0, 100), device(1, 200)];
        assert_eq!(
            select(GpuPreference::Specific(1), &devices, &counts(&[])).unwrap(),
            GpuSelection::Device(1)
        );
    }

    #[test]
    fn specific_absent_fails_before_side_effects() {
        let devices = [device(0, 100)];
        assert!(matches!(
            select(GpuPreference::Specific(7), &devices, &counts(&[])).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn first_picks_lowest_index() {
        let devices = [device(1, 100), device(0, 50)];
        assert_eq!(
            select(GpuPreference::First, &devices, &counts(&[])).unwrap(),
            GpuSelection::Device(0)
        );
    }

    #[test]
    fn least_used_prefers_fewest_running() {
        let devices = [device(0, 100), device(1, 100)];
        assert_eq!(
            select(GpuPreference::LeastUsed, &devices, &counts(&[(0, 2), (1, 1)])).unwrap(),
            GpuSelection::Device(1)
        );
    }

    #[test]
    fn least_used_ties_break_on_free_memory() {
        let devices = [device(0, 100), device(1, 500)];
        assert_eq!(
            select(GpuPreference::LeastUsed, &devices, &counts(&[])).unwrap(),
            GpuSelection::Device(1)
        );
    }

    #[test]
    fn least_used_final_tie_breaks_on_lowest_index() {
        let devices = [device(1, 100), device(0, 100)];
        assert_eq!(
            select(GpuPreference::LeastUsed, &devices, &counts(&[])).unwrap(),
            GpuSelection::Device(0)
        );
    }

    #[test]
    fn auto_with_single_device_pins_it() {
        let devices = [device(0, 100)];
        assert_eq!(
            select(GpuPreference::Auto, &devices, &counts(&[])).unwrap(),
            GpuSelection::Device(0)
        );
    }

    #[test]
    fn auto_with_multiple_devices_selects_all() {
        let devices = [device(0, 100), device(1, 100)];
        let selection = select(GpuPreference::Auto, &devices, &counts(&[])).unwrap();
        assert_eq!(selection, GpuSelection::All);
        assert_eq!(selection.gpu_id().as_deref(), Some(GPU_AUTO));
    }

    // -- nvidia-smi parsing --------------------------------------------------

    #[test]
    fn parse_nvidia_smi_output() {
        let out = "0, NVIDIA A100-SXM4-40GB, 40960, 1024, 39936, 3\n\
                   1, NVIDIA A100-SXM4-40GB, 40960, 0, 40960, 0\n";
        let devices = parse_nvidia_smi(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].free_mb, 39936);
        assert_eq!(devices[1].utilization_percent, Some(0));
    }

    #[test]
    fn parse_nvidia_smi_skips_malformed_lines() {
        let out = "garbage\n0, GPU, 100, 10, 90, 1\n";
        assert_eq!(parse_nvidia_smi(out).len(), 1);
    }

    #[test]
    fn parse_nvidia_smi_empty() {
        assert!(parse_nvidia_smi("").is_empty());
    }
}
