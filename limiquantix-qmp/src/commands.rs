//! Typed command wrappers.
//!
//! Adds are two-phase where a backend object is involved: the backend
//! (`blockdev-add`, `netdev_add`) goes in first, and is removed again if
//! the frontend `device_add` fails. Removes treat "not found" as success,
//! since they are routinely called to clean up after partial failures.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use tracing::{debug, warn};

use crate::error::{QmpError, Result};
use crate::monitor::Monitor;
use crate::types::{
    AddFdInfo, BalloonInfo, BlockStats, BlockStatsEntry, Cpu, DeviceMap, FdsetInfo,
    HotpluggableCpu, MemorySizeSummary, ObjectMap, PciBus, PciDevice, SevCapabilities,
};

/// Permission prefix of the `add-fd` opaque string.
fn fdset_opaque(name: &str, readonly: bool) -> String {
    let permissions = if readonly { "rdonly" } else { "rdwr" };
    format!("{}:{}", permissions, name)
}

/// Name part of an `add-fd` opaque string (tolerates a missing prefix).
fn fdset_name(opaque: &str) -> &str {
    opaque.split_once(':').map_or(opaque, |(_, name)| name)
}

impl Monitor {
    // =========================================================================
    // CPUs
    // =========================================================================

    pub async fn query_cpus(&self) -> Result<Vec<Cpu>> {
        self.run("query-cpus-fast", None).await
    }

    pub async fn query_hotpluggable_cpus(&self) -> Result<Vec<HotpluggableCpu>> {
        self.run("query-hotpluggable-cpus", None).await
    }

    /// Host thread ids backing each vCPU, for pinning.
    pub async fn get_cpus(&self) -> Result<Vec<i64>> {
        let cpus = self.query_cpus().await?;
        Ok(cpus.into_iter().map(|cpu| cpu.thread_id).collect())
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Size of the base memory in bytes.
    pub async fn get_memory_size_bytes(&self) -> Result<i64> {
        let summary: MemorySizeSummary = self.run("query-memory-size-summary", None).await?;
        Ok(summary.base_memory)
    }

    /// Memory currently available to the guest, balloon included.
    pub async fn get_memory_balloon_size_bytes(&self) -> Result<i64> {
        let balloon: BalloonInfo = self.run("query-balloon", None).await?;
        Ok(balloon.actual)
    }

    /// Request a new balloon target. The guest converges asynchronously.
    pub async fn set_memory_balloon_size_bytes(&self, size_bytes: i64) -> Result<()> {
        self.run_unit("balloon", Some(json!({ "value": size_bytes }))).await
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// `device_add`. An empty description is a no-op.
    pub async fn add_device(&self, device: &DeviceMap) -> Result<()> {
        if device.is_empty() {
            return Ok(());
        }

        self.run_unit("device_add", Some(json!(device))).await
    }

    /// `device_del`; a missing device is not an error.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        if device_id.is_empty() {
            return Ok(());
        }

        match self.run_unit("device_del", Some(json!({ "id": device_id }))).await {
            Err(e) if e.is_not_found() => {
                debug!(device_id, "Device already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Add a block node and the device using it.
    pub async fn add_block_device(&self, blockdev: &ObjectMap, device: &DeviceMap) -> Result<()> {
        let node_name = blockdev
            .get("node-name")
            .and_then(Value::as_str)
            .ok_or_else(|| QmpError::InvalidArgument("Device node name must be a string".to_string()))?
            .to_string();

        self.run_unit("blockdev-add", Some(Value::Object(blockdev.clone())))
            .await?;

        if let Err(e) = self.add_device(device).await {
            warn!(node_name = %node_name, error = %e, "Failed adding device, removing block node");
            if let Err(revert) = self.remove_block_device(&node_name).await {
                warn!(node_name = %node_name, error = %revert, "Failed removing block node");
            }
            return Err(e);
        }

        Ok(())
    }

    /// `blockdev-del`; a missing node is not an error.
    pub async fn remove_block_device(&self, node_name: &str) -> Result<()> {
        if node_name.is_empty() {
            return Ok(());
        }

        match self.run_unit("blockdev-del", Some(json!({ "node-name": node_name }))).await {
            Err(QmpError::Protocol { desc, .. }) if desc.contains("is in use") => {
                Err(QmpError::BlockDeviceInUse(desc))
            }
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// `chardev-add`. An empty description is a no-op.
    pub async fn add_char_device(&self, chardev: &ObjectMap) -> Result<()> {
        if chardev.is_empty() {
            return Ok(());
        }

        self.run_unit("chardev-add", Some(Value::Object(chardev.clone()))).await
    }

    /// `chardev-remove`; a missing chardev is not an error.
    pub async fn remove_char_device(&self, chardev_id: &str) -> Result<()> {
        if chardev_id.is_empty() {
            return Ok(());
        }

        match self.run_unit("chardev-remove", Some(json!({ "id": chardev_id }))).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Add a network backend (optional) and the NIC device using it.
    pub async fn add_nic(&self, netdev: Option<&ObjectMap>, device: &DeviceMap) -> Result<()> {
        let netdev_id = match netdev {
            Some(netdev) => {
                self.run_unit("netdev_add", Some(Value::Object(netdev.clone())))
                    .await?;
                netdev.get("id").cloned()
            }
            None => None,
        };

        if let Err(e) = self.add_device(device).await {
            if let Some(id) = netdev_id {
                warn!(netdev = %id, error = %e, "Failed adding NIC device, removing netdev");
                if let Err(revert) = self.run_unit("netdev_del", Some(json!({ "id": id }))).await {
                    warn!(error = %revert, "Failed removing netdev");
                }
            }
            return Err(e);
        }

        Ok(())
    }

    /// `netdev_del`. Not all NICs have a netdev, so a missing one is fine.
    pub async fn remove_nic(&self, netdev_id: &str) -> Result<()> {
        if netdev_id.is_empty() {
            return Ok(());
        }

        match self.run_unit("netdev_del", Some(json!({ "id": netdev_id }))).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    // =========================================================================
    // File descriptors
    // =========================================================================

    /// Hand `file` to QEMU under `name` (`getfd`).
    pub async fn send_file(&self, name: &str, file: &impl AsRawFd) -> Result<()> {
        self.run_with_fd::<Value>("getfd", json!({ "fdname": name }), file.as_raw_fd())
            .await
            .map(|_| ())
    }

    /// Release a descriptor previously sent with [`Monitor::send_file`].
    pub async fn close_file(&self, name: &str) -> Result<()> {
        self.run_unit("closefd", Some(json!({ "fdname": name }))).await
    }

    /// Add `file` to a new fd set, tagged with `name` and its access mode.
    pub async fn send_file_with_fdset(
        &self,
        name: &str,
        file: &impl AsRawFd,
        readonly: bool,
    ) -> Result<AddFdInfo> {
        let arguments = json!({ "opaque": fdset_opaque(name, readonly) });
        self.run_with_fd("add-fd", arguments, file.as_raw_fd()).await
    }

    /// Remove every fd set holding a descriptor tagged `name`.
    pub async fn remove_fd_from_fdset(&self, name: &str) -> Result<()> {
        let fdsets: Vec<FdsetInfo> = self.run("query-fdsets", None).await?;

        for fdset in fdsets {
            if fdset.fds.iter().any(|fd| fdset_name(&fd.opaque) == name) {
                self.run_unit("remove-fd", Some(json!({ "fdset-id": fdset.id })))
                    .await?;
            }
        }

        Ok(())
    }

    // =========================================================================
    // Misc
    // =========================================================================

    /// Configure what QEMU does on reboot/shutdown/panic/watchdog.
    pub async fn set_action(&self, actions: &HashMap<String, String>) -> Result<()> {
        self.run_unit("set-action", Some(json!(actions))).await
    }

    /// Devices on the root PCI bus (bridges carry their own children).
    pub async fn query_pci(&self) -> Result<Vec<PciDevice>> {
        let buses: Vec<PciBus> = self.run("query-pci", None).await?;
        Ok(buses.into_iter().next().map(|bus| bus.devices).unwrap_or_default())
    }

    /// Block I/O counters keyed by qdev id.
    pub async fn get_block_stats(&self) -> Result<HashMap<String, BlockStats>> {
        let entries: Vec<BlockStatsEntry> = self.run("query-blockstats", None).await?;
        Ok(entries.into_iter().map(|entry| (entry.qdev, entry.stats)).collect())
    }

    /// Add a base64 secret object. An existing object with that id is kept.
    pub async fn add_secret(&self, id: &str, secret: &str) -> Result<()> {
        let arguments = json!({
            "qom-type": "secret",
            "id": id,
            "data": secret,
            "format": "base64",
        });

        match self.run_unit("object-add", Some(arguments)).await {
            Err(e) if e.is_duplicate() => Ok(()),
            other => other,
        }
    }

    pub async fn sev_capabilities(&self) -> Result<SevCapabilities> {
        self.run("query-sev-capabilities", None).await
    }

    /// Eject removable media from device `id`.
    pub async fn eject(&self, id: &str) -> Result<()> {
        self.run_unit("eject", Some(json!({ "id": id }))).await
    }

    /// Apply I/O limits to a disk. Zero means unlimited.
    pub async fn set_block_throttle(
        &self,
        id: &str,
        bytes_read: u64,
        bytes_write: u64,
        iops_read: u64,
        iops_write: u64,
    ) -> Result<()> {
        let arguments = json!({
            "id": id,
            "bps": 0,
            "bps_rd": bytes_read,
            "bps_wr": bytes_write,
            "iops": 0,
            "iops_rd": iops_read,
            "iops_wr": iops_write,
        });

        self.run_unit("block_set_io_throttle", Some(arguments)).await
    }

    // =========================================================================
    // NBD export
    // =========================================================================

    /// Start QEMU's NBD server on a fresh abstract socket and connect to it.
    #[cfg(target_os = "linux")]
    pub async fn nbd_server_start(&self) -> Result<tokio::net::UnixStream> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixStream};

        let name = format!("limiquantix-nbd-{}", uuid::Uuid::new_v4());
        let arguments = json!({
            "addr": {
                "type": "unix",
                "data": { "path": name, "abstract": true },
            },
            "max-connections": 1,
        });

        self.run_unit("nbd-server-start", Some(arguments)).await?;

        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let stream = UnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        debug!(address = %name, "Connected to NBD server");

        Ok(tokio::net::UnixStream::from_std(stream)?)
    }

    pub async fn nbd_server_stop(&self) -> Result<()> {
        self.run_unit("nbd-server-stop", None).await
    }

    /// Export a block node, writable, through the NBD server.
    pub async fn nbd_block_export_add(&self, node_name: &str) -> Result<()> {
        let arguments = json!({
            "id": node_name,
            "type": "nbd",
            "node-name": node_name,
            "writable": true,
        });

        self.run_unit("block-export-add", Some(arguments)).await
    }
}
