//! Typed shapes of QMP replies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key/value device description passed to `device_add`.
pub type DeviceMap = HashMap<String, String>;

/// Arbitrary backend object description (`blockdev-add`, `netdev_add`,
/// `chardev-add`).
pub type ObjectMap = serde_json::Map<String, serde_json::Value>;

// =========================================================================
// Run state
// =========================================================================

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatusInfo {
    pub status: String,
}

/// `query-version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub qemu: VersionTriple,
    #[serde(default)]
    pub package: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

// =========================================================================
// CPUs and memory
// =========================================================================

/// Topology properties of a CPU slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CpuInstanceProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub die_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u32>,
}

/// One entry of `query-cpus-fast`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cpu {
    #[serde(default)]
    pub cpu_index: u32,
    #[serde(default)]
    pub qom_path: String,
    /// Host thread backing the vCPU
    pub thread_id: i64,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub props: CpuInstanceProperties,
}

/// One entry of `query-hotpluggable-cpus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HotpluggableCpu {
    #[serde(rename = "type")]
    pub cpu_type: String,
    pub vcpus_count: u32,
    /// Set when the slot is populated
    #[serde(default)]
    pub qom_path: Option<String>,
    #[serde(default)]
    pub props: CpuInstanceProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct MemorySizeSummary {
    pub base_memory: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BalloonInfo {
    pub actual: i64,
}

// =========================================================================
// Character devices and file descriptors
// =========================================================================

/// One entry of `query-chardev`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChardevInfo {
    pub label: String,
    /// Backend description, e.g. `pty:/dev/pts/3`
    pub filename: String,
    #[serde(default)]
    pub frontend_open: bool,
}

/// A descriptor inside an fd set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdsetFdInfo {
    pub fd: i32,
    #[serde(default)]
    pub opaque: String,
}

/// One entry of `query-fdsets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdsetInfo {
    #[serde(rename = "fdset-id")]
    pub id: i32,
    #[serde(default)]
    pub fds: Vec<FdsetFdInfo>,
}

/// Reply of `add-fd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFdInfo {
    #[serde(rename = "fdset-id")]
    pub id: i32,
    pub fd: i32,
}

// =========================================================================
// PCI and block statistics
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciClassInfo {
    pub class: u32,
    #[serde(rename = "desc", default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciBridge {
    #[serde(default)]
    pub devices: Vec<PciDevice>,
}

/// A device on a PCI bus, with anything behind it if it is a bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevice {
    #[serde(rename = "qdev_id", default)]
    pub dev_id: String,
    pub bus: u32,
    pub slot: u32,
    pub function: u32,
    #[serde(default)]
    pub devices: Vec<PciDevice>,
    #[serde(rename = "class_info", default)]
    pub class: PciClassInfo,
    #[serde(rename = "pci_bridge", default)]
    pub bridge: PciBridge,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PciBus {
    #[serde(default)]
    pub devices: Vec<PciDevice>,
}

/// I/O counters of a block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    #[serde(rename = "wr_bytes")]
    pub bytes_written: u64,
    #[serde(rename = "wr_operations")]
    pub writes_completed: u64,
    #[serde(rename = "rd_bytes")]
    pub bytes_read: u64,
    #[serde(rename = "rd_operations")]
    pub reads_completed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BlockStatsEntry {
    pub stats: BlockStats,
    #[serde(default)]
    pub qdev: String,
}

/// SEV capabilities of the host (AMD x86 only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SevCapabilities {
    /// Platform Diffie-Hellman key (base64)
    pub pdh: String,
    /// PDH certificate chain (base64)
    pub cert_chain: String,
    /// Unique ID of CPU0 (base64)
    #[serde(rename = "cpu0-id", default)]
    pub cpu0_id: String,
    /// C-bit location in page table entries
    #[serde(rename = "cbitpos")]
    pub cbit_pos: u32,
    pub reduced_phys_bits: u32,
}

// =========================================================================
// Long-running jobs
// =========================================================================

/// Migration status string QEMU reports once the stream is done.
pub const MIGRATION_COMPLETED: &str = "completed";

/// Migration status string QEMU reports on failure.
pub const MIGRATION_FAILED: &str = "failed";

/// Reply of `query-migrate`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MigrationInfo {
    /// Absent before any migration was started
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_desc: Option<String>,
}

/// One entry of `query-block-jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockJobInfo {
    /// Job id (equal to the device node name for jobs started here)
    pub device: String,
    #[serde(rename = "type", default)]
    pub job_type: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub len: u64,
}

/// Observed state of a long-running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Still working; carries the raw status QEMU reported
    Running(String),
    /// Mirror/commit reached the synchronisation point
    Ready,
    Completed,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl From<&MigrationInfo> for JobState {
    fn from(info: &MigrationInfo) -> Self {
        match info.status.as_deref() {
            Some(MIGRATION_COMPLETED) => Self::Completed,
            Some(MIGRATION_FAILED) => Self::Failed(
                info.error_desc
                    .clone()
                    .unwrap_or_else(|| "migration failed".to_string()),
            ),
            Some(other) => Self::Running(other.to_string()),
            None => Self::Running("none".to_string()),
        }
    }
}

impl From<&BlockJobInfo> for JobState {
    fn from(job: &BlockJobInfo) -> Self {
        match job.error.as_deref() {
            Some(error) if !error.is_empty() => Self::Failed(error.to_string()),
            _ if job.ready => Self::Ready,
            _ if job.status == "concluded" => Self::Completed,
            _ => Self::Running(job.status.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cpu_decoding() {
        let cpus: Vec<Cpu> = serde_json::from_value(json!([
            {"cpu-index": 0, "qom-path": "/machine/unattached/device[0]", "thread-id": 4242,
             "target": "x86_64", "props": {"core-id": 0, "socket-id": 0, "thread-id": 0}},
            {"cpu-index": 1, "thread-id": 4243, "props": {}}
        ]))
        .unwrap();

        assert_eq!(cpus[0].thread_id, 4242);
        assert_eq!(cpus[0].props.core_id, Some(0));
        assert_eq!(cpus[1].cpu_index, 1);
        assert_eq!(cpus[1].props, CpuInstanceProperties::default());
    }

    #[test]
    fn test_migration_states() {
        let info = |status: &str| MigrationInfo {
            status: Some(status.to_string()),
            error_desc: None,
        };

        assert_eq!(JobState::from(&info("active")), JobState::Running("active".to_string()));
        assert_eq!(JobState::from(&info("completed")), JobState::Completed);
        assert!(matches!(JobState::from(&info("failed")), JobState::Failed(_)));
        assert!(!JobState::from(&MigrationInfo::default()).is_terminal());
    }

    #[test]
    fn test_block_job_states() {
        let job: BlockJobInfo = serde_json::from_value(json!({
            "device": "disk0", "type": "commit", "ready": true, "status": "ready",
            "offset": 10, "len": 10
        }))
        .unwrap();
        assert_eq!(JobState::from(&job), JobState::Ready);

        let failed = BlockJobInfo {
            device: "disk0".to_string(),
            error: Some("No space left on device".to_string()),
            ..BlockJobInfo::default()
        };
        assert_eq!(
            JobState::from(&failed),
            JobState::Failed("No space left on device".to_string())
        );
    }

    #[test]
    fn test_pci_tree_decoding() {
        let bus: PciBus = serde_json::from_value(json!({
            "devices": [{
                "qdev_id": "qemu_pcie1", "bus": 0, "slot": 1, "function": 0,
                "class_info": {"class": 1540, "desc": "PCI bridge"},
                "pci_bridge": {"devices": [
                    {"qdev_id": "dev-disk0", "bus": 1, "slot": 0, "function": 0,
                     "class_info": {"class": 256}}
                ]}
            }]
        }))
        .unwrap();

        assert_eq!(bus.devices[0].class.description, "PCI bridge");
        assert_eq!(bus.devices[0].bridge.devices[0].dev_id, "dev-disk0");
    }
}
