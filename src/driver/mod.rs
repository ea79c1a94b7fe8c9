//! Hypervisor drivers.
//!
//! The provisioning pipeline only talks to [`Driver`]; the libvirt/KVM
//! implementation lives in [`kvm`].

mod command;
pub mod kvm;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

pub use command::{CommandOutput, CommandRunner, HostCommandRunner};
pub use kvm::KvmDriver;

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("instance name {0:?} cannot be used as a file name")]
    InvalidName(String),
    #[error("disk {} already exists", .0.display())]
    DiskExists(PathBuf),
    #[error("{program} exited with {}: {}", .code.map_or_else(|| "a signal".to_string(), |c| c.to_string()), .stderr.trim())]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where the guest's NIC attaches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkTarget {
    /// The hypervisor's default NAT network.
    #[default]
    Nat,
    Bridge(String),
}

impl NetworkTarget {
    /// A blank name (or `default`) means NAT.
    pub fn from_bridge(bridge: Option<&str>) -> Self {
        match bridge.map(str::trim) {
            None | Some("") | Some("default") => NetworkTarget::Nat,
            Some(name) => NetworkTarget::Bridge(name.to_string()),
        }
    }
}

/// Everything needed to define and boot an instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk: PathBuf,
    pub seed: PathBuf,
    pub network: NetworkTarget,
}

/// Opaque cloud-init documents handed to the driver.
#[derive(Debug, Clone)]
pub struct SeedPayload {
    pub user_data: String,
    pub meta_data: String,
}

/// Live view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDescriptor {
    pub id: String,
    pub name: String,
    pub status: String,
    pub address: Option<String>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Create a copy-on-write disk for `name` backed by `backing`. Fails with
    /// [`DriverError::DiskExists`] if the instance already has one.
    async fn create_disk(&self, name: &str, backing: &Path, size_gib: u32) -> Result<PathBuf, DriverError>;

    /// Package `payload` into a seed artifact the guest reads at first boot.
    async fn create_seed(&self, name: &str, payload: &SeedPayload) -> Result<PathBuf, DriverError>;

    async fn create_vm(&self, config: &VmConfig) -> Result<(), DriverError>;

    /// Best effort removal of the instance and its files. An id that is
    /// already gone is not an error.
    async fn delete_vm(&self, id: &str) -> Result<(), DriverError>;

    async fn start_vm(&self, id: &str) -> Result<(), DriverError>;

    async fn stop_vm(&self, id: &str) -> Result<(), DriverError>;

    async fn reboot_vm(&self, id: &str) -> Result<(), DriverError>;

    /// Change the persistent vCPU and memory allocation. Takes effect the
    /// next time the instance boots.
    async fn resize_vm(&self, id: &str, vcpus: u32, memory_mib: u64) -> Result<(), DriverError>;

    /// Define, start and autostart a hypervisor network bridged onto the
    /// host interface `host_interface`.
    async fn create_bridge_network(&self, network: &str, host_interface: &str) -> Result<(), DriverError>;

    async fn list_vms(&self) -> Result<Vec<String>, DriverError>;

    async fn vm_info(&self, id: &str) -> Result<InstanceDescriptor, DriverError>;
}
