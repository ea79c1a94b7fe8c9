use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CommandOutput, CommandRunner, Driver, DriverError, HostCommandRunner, InstanceDescriptor, NetworkTarget,
    SeedPayload, VmConfig,
};
use crate::config::{KvmSettings, Settings};

const QEMU_IMG: &str = "qemu-img";
const CLOUD_LOCALDS: &str = "cloud-localds";
const VIRSH: &str = "virsh";

/// libvirt/KVM driver built on `qemu-img`, `cloud-localds` and `virsh`.
pub struct KvmDriver {
    runner: Arc<dyn CommandRunner>,
    disk_dir: PathBuf,
    seed_dir: PathBuf,
    emulator: String,
    graphics_listen: String,
}

impl KvmDriver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        disk_dir: impl Into<PathBuf>,
        seed_dir: impl Into<PathBuf>,
        kvm: &KvmSettings,
    ) -> Self {
        Self {
            runner,
            disk_dir: disk_dir.into(),
            seed_dir: seed_dir.into(),
            emulator: kvm.emulator.clone(),
            graphics_listen: kvm.graphics_listen.clone(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(HostCommandRunner),
            &settings.disk_dir,
            &settings.seed_dir,
            &settings.kvm,
        )
    }

    fn disk_path(&self, name: &str) -> Result<PathBuf, DriverError> {
        Ok(self.disk_dir.join(format!("{}.qcow2", file_stem(name)?)))
    }

    fn seed_path(&self, name: &str) -> Result<PathBuf, DriverError> {
        Ok(self.seed_dir.join(format!("{}-cidata.iso", file_stem(name)?)))
    }

    fn user_data_path(&self, name: &str) -> Result<PathBuf, DriverError> {
        Ok(self.seed_dir.join(format!("{}-user.yaml", file_stem(name)?)))
    }

    fn meta_data_path(&self, name: &str) -> Result<PathBuf, DriverError> {
        Ok(self.seed_dir.join(format!("{}-meta.yaml", file_stem(name)?)))
    }

    /// Run a tool and fail on a non-zero exit.
    async fn exec(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<CommandOutput, DriverError> {
        let output = self
            .runner
            .run(program, args, stdin)
            .await
            .map_err(|source| DriverError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if output.success() {
            Ok(output)
        } else {
            Err(DriverError::CommandFailed {
                program: program.to_string(),
                code: output.code,
                stderr: if output.stderr.trim().is_empty() {
                    output.stdout
                } else {
                    output.stderr
                },
            })
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<CommandOutput, DriverError> {
        self.exec(VIRSH, args, None).await
    }

    fn domain_xml(&self, config: &VmConfig) -> String {
        let interface = match &config.network {
            NetworkTarget::Nat => {
                "<interface type='network'><source network='default'/><model type='virtio'/></interface>".to_string()
            }
            NetworkTarget::Bridge(bridge) => format!(
                "<interface type='bridge'><source bridge='{}'/><model type='virtio'/></interface>",
                escape_xml(bridge)
            ),
        };

        format!(
            "<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{vcpus}</vcpu>
  <os><type arch='x86_64'>hvm</type><boot dev='hd'/></os>
  <features><acpi/><apic/></features>
  <devices>
    <emulator>{emulator}</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    {interface}
    <serial type='pty'><target port='0'/></serial>
    <console type='pty'><target type='serial' port='0'/></console>
    <graphics type='vnc' port='-1' autoport='yes' listen='{listen}'/>
  </devices>
</domain>
",
            name = escape_xml(&config.name),
            memory_kib = config.memory_mib * 1024,
            vcpus = config.vcpus,
            emulator = escape_xml(&self.emulator),
            disk = escape_xml(&config.disk.to_string_lossy()),
            seed = escape_xml(&config.seed.to_string_lossy()),
            listen = escape_xml(&self.graphics_listen),
        )
    }
}

#[async_trait]
impl Driver for KvmDriver {
    fn name(&self) -> &str {
        "kvm-libvirt"
    }

    async fn create_disk(&self, name: &str, backing: &Path, size_gib: u32) -> Result<PathBuf, DriverError> {
        let disk = self.disk_path(name)?;
        if disk.exists() {
            return Err(DriverError::DiskExists(disk));
        }
        create_dir(&self.disk_dir)?;

        let backing = backing.to_string_lossy();
        let target = disk.to_string_lossy();
        let size = format!("{size_gib}G");
        self.exec(
            QEMU_IMG,
            &["create", "-f", "qcow2", "-F", "qcow2", "-b", &backing, &target, &size],
            None,
        )
        .await?;

        tracing::info!(instance = name, disk = %disk.display(), size = %size, "disk created");
        Ok(disk)
    }

    async fn create_seed(&self, name: &str, payload: &SeedPayload) -> Result<PathBuf, DriverError> {
        let iso = self.seed_path(name)?;
        let user_path = self.user_data_path(name)?;
        let meta_path = self.meta_data_path(name)?;
        create_dir(&self.seed_dir)?;

        write_file(&user_path, &payload.user_data)?;
        write_file(&meta_path, &payload.meta_data)?;

        let iso_arg = iso.to_string_lossy();
        let user_arg = user_path.to_string_lossy();
        let meta_arg = meta_path.to_string_lossy();
        let packaged = self.exec(CLOUD_LOCALDS, &[&iso_arg, &user_arg, &meta_arg], None).await;

        // The YAML copies hold plaintext passwords.
        for leftover in [&user_path, &meta_path] {
            remove_quietly(leftover);
        }
        packaged?;

        tracing::info!(instance = name, seed = %iso.display(), "seed image created");
        Ok(iso)
    }

    async fn create_vm(&self, config: &VmConfig) -> Result<(), DriverError> {
        let xml = self.domain_xml(config);
        self.exec(VIRSH, &["define", "/dev/stdin"], Some(xml.as_str())).await?;
        self.virsh(&["start", &config.name]).await?;

        tracing::info!(instance = %config.name, vcpus = config.vcpus, memory_mib = config.memory_mib, "instance started");
        Ok(())
    }

    async fn delete_vm(&self, id: &str) -> Result<(), DriverError> {
        let files = [
            self.disk_path(id)?,
            self.seed_path(id)?,
            self.user_data_path(id)?,
            self.meta_data_path(id)?,
        ];

        if let Err(err) = self.virsh(&["destroy", id]).await {
            tracing::debug!(instance = id, error = %err, "force stop skipped");
        }

        let undefine = match self.virsh(&["undefine", id]).await {
            Ok(_) => Ok(()),
            Err(err) if is_missing_domain(&err) => {
                tracing::debug!(instance = id, "domain already undefined");
                Ok(())
            }
            Err(err) => Err(err),
        };

        for path in &files {
            remove_quietly(path);
        }

        match undefine {
            Ok(()) => {
                tracing::info!(instance = id, "instance deleted");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(instance = id, error = %err, "undefine failed");
                Err(err)
            }
        }
    }

    async fn start_vm(&self, id: &str) -> Result<(), DriverError> {
        self.virsh(&["start", id]).await.map(|_| ())
    }

    async fn stop_vm(&self, id: &str) -> Result<(), DriverError> {
        self.virsh(&["destroy", id]).await.map(|_| ())
    }

    async fn reboot_vm(&self, id: &str) -> Result<(), DriverError> {
        self.virsh(&["reboot", id]).await.map(|_| ())
    }

    async fn resize_vm(&self, id: &str, vcpus: u32, memory_mib: u64) -> Result<(), DriverError> {
        let memory_kib = memory_mib.saturating_mul(1024).to_string();
        let vcpus_arg = vcpus.to_string();

        self.virsh(&["setmem", id, &memory_kib, "--config"]).await?;
        // The ceiling has to move before the current count can exceed it.
        self.virsh(&["setvcpus", id, &vcpus_arg, "--config", "--maximum"]).await?;
        self.virsh(&["setvcpus", id, &vcpus_arg, "--config"]).await?;

        tracing::info!(instance = id, vcpus, memory_mib, "instance resized, effective after next boot");
        Ok(())
    }

    async fn create_bridge_network(&self, network: &str, host_interface: &str) -> Result<(), DriverError> {
        let xml = format!(
            "<network>
  <name>{}</name>
  <forward mode='bridge'>
    <interface dev='{}'/>
  </forward>
</network>
",
            escape_xml(network),
            escape_xml(host_interface)
        );

        self.exec(VIRSH, &["net-define", "/dev/stdin"], Some(xml.as_str())).await?;
        self.virsh(&["net-start", network]).await?;
        self.virsh(&["net-autostart", network]).await?;

        tracing::info!(network, host_interface, "bridge network created");
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<String>, DriverError> {
        let output = self.virsh(&["list", "--all", "--name"]).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn vm_info(&self, id: &str) -> Result<InstanceDescriptor, DriverError> {
        let state = self.virsh(&["domstate", id]).await?;

        let address = match self.virsh(&["domifaddr", id, "--source", "lease"]).await {
            Ok(out) => parse_ipv4(&out.stdout),
            Err(err) => {
                tracing::debug!(instance = id, error = %err, "no address lease");
                None
            }
        };

        Ok(InstanceDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            status: state.stdout.trim().to_string(),
            address,
        })
    }
}

/// Instance names become file names under the disk and seed directories.
fn file_stem(name: &str) -> Result<&str, DriverError> {
    if name.is_empty() || name.contains(['/', '\\', '\0']) || name.contains("..") {
        Err(DriverError::InvalidName(name.to_string()))
    } else {
        Ok(name)
    }
}

fn is_missing_domain(err: &DriverError) -> bool {
    match err {
        DriverError::CommandFailed { stderr, .. } => {
            let stderr = stderr.to_ascii_lowercase();
            stderr.contains("domain not found") || stderr.contains("failed to get domain")
        }
        _ => false,
    }
}

/// First IPv4 address in `virsh domifaddr` output, without the prefix length.
fn parse_ipv4(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "ipv4" {
            let addr = tokens.next()?;
            return addr.split('/').next().map(str::to_string);
        }
    }
    None
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn create_dir(path: &Path) -> Result<(), DriverError> {
    fs::create_dir_all(path).map_err(|source| DriverError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &str) -> Result<(), DriverError> {
    fs::write(path, contents).map_err(|source| DriverError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove file"),
    }
}
