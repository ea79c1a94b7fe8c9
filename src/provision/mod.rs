//! Provisioning orchestrator.
//!
//! `create_server` runs plan lookup, image resolution, disk creation, guest
//! configuration and launch strictly in that order. Nothing is retried and
//! nothing is rolled back; a failure reports the stage it happened in.

mod error;
pub mod plans;
mod request;
pub mod seed;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::Instrument;

pub use error::{ProvisionError, Stage, StageCause};
pub use plans::Plan;
pub use request::ProvisionRequest;
use request::{validate_bridge, validate_instance_id};

use crate::driver::{Driver, InstanceDescriptor, VmConfig};
use crate::registry::ImageRegistry;
use seed::GuestConfig;

/// What a successful `create_server` produced.
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub name: String,
    pub image: String,
    pub plan: Plan,
    pub disk: PathBuf,
    pub seed: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Stop,
    Reboot,
    Delete,
}

impl FromStr for LifecycleAction {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(LifecycleAction::Start),
            "stop" => Ok(LifecycleAction::Stop),
            "reboot" | "restart" => Ok(LifecycleAction::Reboot),
            "delete" | "destroy" => Ok(LifecycleAction::Delete),
            _ => Err(ProvisionError::UnknownAction(s.to_string())),
        }
    }
}

pub struct Provisioner {
    registry: Arc<ImageRegistry>,
    driver: Arc<dyn Driver>,
}

impl Provisioner {
    pub fn new(registry: Arc<ImageRegistry>, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub async fn create_server(&self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        request.validate()?;
        let plan = plans::select(&request.plan);

        let span = tracing::info_span!(
            "create_server",
            instance = %request.name,
            image = %request.image,
            plan = plan.name
        );
        self.run_pipeline(request, plan).instrument(span).await
    }

    async fn run_pipeline(&self, request: &ProvisionRequest, plan: Plan) -> Result<Provisioned, ProvisionError> {
        let image = self
            .registry
            .resolve(&request.image)
            .await
            .map_err(ProvisionError::at(Stage::Image))?;

        let disk = self
            .driver
            .create_disk(&request.name, image.local_path(), plan.disk_gib)
            .await
            .map_err(ProvisionError::at(Stage::Disk))?;

        let payload = seed::render(&GuestConfig {
            hostname: &request.name,
            root_password: &request.password,
            user: request
                .secondary_user()
                .map(|user| (user, request.secondary_password())),
            allow_root_login: request.root_login_allowed(),
        });
        let seed = self
            .driver
            .create_seed(&request.name, &payload)
            .await
            .map_err(ProvisionError::at(Stage::Configuration))?;

        self.driver
            .create_vm(&VmConfig {
                name: request.name.clone(),
                vcpus: plan.vcpus,
                memory_mib: plan.memory_mib,
                disk: disk.clone(),
                seed: seed.clone(),
                network: request.network(),
            })
            .await
            .map_err(ProvisionError::at(Stage::Launch))?;

        tracing::info!("server created");
        Ok(Provisioned {
            name: request.name.clone(),
            image: request.image.clone(),
            plan,
            disk,
            seed,
        })
    }

    /// Parse `action` and apply it to instance `id`.
    pub async fn perform_action(&self, id: &str, action: &str) -> Result<(), ProvisionError> {
        let action: LifecycleAction = action.parse()?;
        validate_instance_id(id)?;
        tracing::info!(instance = id, action = ?action, "lifecycle action");

        match action {
            LifecycleAction::Start => self.driver.start_vm(id).await?,
            LifecycleAction::Stop => self.driver.stop_vm(id).await?,
            LifecycleAction::Reboot => self.driver.reboot_vm(id).await?,
            LifecycleAction::Delete => self.driver.delete_vm(id).await?,
        }
        Ok(())
    }

    /// Change an instance's vCPU and memory allocation. The new size applies
    /// from its next boot.
    pub async fn resize_server(&self, id: &str, vcpus: u32, memory_mib: u64) -> Result<(), ProvisionError> {
        validate_instance_id(id)?;
        if vcpus == 0 || memory_mib == 0 {
            return Err(ProvisionError::InvalidRequest(
                "vcpus and memory must both be greater than zero".to_string(),
            ));
        }

        tracing::info!(instance = id, vcpus, memory_mib, "resizing instance");
        self.driver.resize_vm(id, vcpus, memory_mib).await?;
        Ok(())
    }

    /// Create a persistent hypervisor network bridged onto `host_interface`.
    pub async fn create_bridge_network(&self, network: &str, host_interface: &str) -> Result<(), ProvisionError> {
        validate_bridge(network, host_interface)?;
        self.driver.create_bridge_network(network, host_interface).await?;
        Ok(())
    }

    /// Inspect every instance the driver knows about. Instances that fail
    /// inspection are left out.
    pub async fn list_servers(&self) -> Result<Vec<InstanceDescriptor>, ProvisionError> {
        let ids = self.driver.list_vms().await?;
        let inspected = join_all(ids.iter().map(|id| self.driver.vm_info(id))).await;

        Ok(ids
            .iter()
            .zip(inspected)
            .filter_map(|(id, info)| match info {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!(instance = %id, error = %err, "skipping instance");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;
    use crate::driver::{DriverError, SeedPayload};
    use crate::registry::RegistryError;
    use crate::test_support::unreachable_base;

    /// Records calls; fails the operations named in `failing`.
    #[derive(Default)]
    struct FakeDriver {
        calls: Mutex<Vec<String>>,
        seeds: Mutex<Vec<SeedPayload>>,
        failing: HashSet<&'static str>,
    }

    impl FakeDriver {
        fn failing(ops: &[&'static str]) -> Self {
            Self {
                failing: ops.iter().copied().collect(),
                ..Self::default()
            }
        }

        fn record(&self, op: &'static str, detail: String) -> Result<(), DriverError> {
            self.calls.lock().push(format!("{op} {detail}"));
            if self.failing.contains(op) {
                Err(DriverError::CommandFailed {
                    program: op.to_string(),
                    code: Some(1),
                    stderr: format!("{op} exploded"),
                })
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Driver for FakeDriver {
        fn name(&self) -> &str {
            "fake"
        }

        async fn create_disk(&self, name: &str, backing: &Path, size_gib: u32) -> Result<PathBuf, DriverError> {
            self.record("create_disk", format!("{name} {} {size_gib}", backing.display()))?;
            Ok(PathBuf::from(format!("/vms/{name}.qcow2")))
        }

        async fn create_seed(&self, name: &str, payload: &SeedPayload) -> Result<PathBuf, DriverError> {
            self.record("create_seed", name.to_string())?;
            self.seeds.lock().push(payload.clone());
            Ok(PathBuf::from(format!("/configs/{name}-cidata.iso")))
        }

        async fn create_vm(&self, config: &VmConfig) -> Result<(), DriverError> {
            self.record(
                "create_vm",
                format!("{} {} {} {:?}", config.name, config.vcpus, config.memory_mib, config.network),
            )
        }

        async fn delete_vm(&self, id: &str) -> Result<(), DriverError> {
            self.record("delete_vm", id.to_string())
        }

        async fn start_vm(&self, id: &str) -> Result<(), DriverError> {
            self.record("start_vm", id.to_string())
        }

        async fn stop_vm(&self, id: &str) -> Result<(), DriverError> {
            self.record("stop_vm", id.to_string())
        }

        async fn reboot_vm(&self, id: &str) -> Result<(), DriverError> {
            self.record("reboot_vm", id.to_string())
        }

        async fn resize_vm(&self, id: &str, vcpus: u32, memory_mib: u64) -> Result<(), DriverError> {
            self.record("resize_vm", format!("{id} {vcpus} {memory_mib}"))
        }

        async fn create_bridge_network(&self, network: &str, host_interface: &str) -> Result<(), DriverError> {
            self.record("create_bridge_network", format!("{network} {host_interface}"))
        }

        async fn list_vms(&self) -> Result<Vec<String>, DriverError> {
            self.record("list_vms", String::new())?;
            Ok(vec!["web-1".to_string(), "ghost".to_string(), "db-1".to_string()])
        }

        async fn vm_info(&self, id: &str) -> Result<InstanceDescriptor, DriverError> {
            if id == "ghost" {
                return Err(DriverError::CommandFailed {
                    program: "virsh".to_string(),
                    code: Some(1),
                    stderr: "domain not found".to_string(),
                });
            }
            Ok(InstanceDescriptor {
                id: id.to_string(),
                name: id.to_string(),
                status: "running".to_string(),
                address: None,
            })
        }
    }

    /// Registry with `ubuntu-24.04` registered and its artifact already on
    /// disk, so resolving it needs no network.
    fn registry(dir: &TempDir) -> Arc<ImageRegistry> {
        let registry = ImageRegistry::open(dir.path().join("images.json"), dir.path().join("cache")).unwrap();
        let entry = registry
            .register("ubuntu-24.04", &format!("{}/noble.img", unreachable_base()), None)
            .unwrap();
        fs::write(entry.local_path(), b"base image").unwrap();
        Arc::new(registry)
    }

    fn request(json: &str) -> ProvisionRequest {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn creates_in_stage_order() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let backing = registry.get("ubuntu-24.04").unwrap().local_path().display().to_string();
        let driver = Arc::new(FakeDriver::default());
        let provisioner = Provisioner::new(registry, Arc::clone(&driver) as Arc<dyn Driver>);

        let created = provisioner
            .create_server(&request(
                r#"{"name":"web-1","image":"ubuntu-24.04","plan":"professional","password":"r00t","bridgeInterface":"br0"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(created.plan.name, "Professional");
        assert_eq!(created.disk, PathBuf::from("/vms/web-1.qcow2"));
        assert_eq!(
            driver.calls(),
            vec![
                format!("create_disk web-1 {backing} 20"),
                "create_seed web-1".to_string(),
                "create_vm web-1 2 4096 Bridge(\"br0\")".to_string(),
            ]
        );
        let seeds = driver.seeds.lock();
        assert!(seeds[0].user_data.contains("hostname: web-1"));
        assert!(seeds[0].user_data.contains("PermitRootLogin yes"));
    }

    #[tokio::test]
    async fn unregistered_image_aborts_before_any_side_effect() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::default());
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        let err = provisioner
            .create_server(&request(r#"{"name":"desk-1","image":"windows-11","password":"r00t"}"#))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Image));
        assert!(matches!(
            err,
            ProvisionError::Stage {
                source: StageCause::Registry(RegistryError::NotRegistered(_)),
                ..
            }
        ));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_plan_falls_back_to_starter() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::default());
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        let created = provisioner
            .create_server(&request(
                r#"{"name":"web-1","image":"ubuntu-24.04","plan":"Mega","password":"r00t","username":"deploy"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(created.plan, plans::DEFAULT_PLAN);
        assert!(driver.calls()[2].starts_with("create_vm web-1 1 2048 Nat"));
        assert!(driver.seeds.lock()[0].user_data.contains("PermitRootLogin no"));
    }

    #[tokio::test]
    async fn disk_failure_stops_the_pipeline() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::failing(&["create_disk"]));
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        let err = provisioner
            .create_server(&request(r#"{"name":"web-1","image":"ubuntu-24.04","password":"r00t"}"#))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Disk));
        assert_eq!(driver.calls().len(), 1);
    }

    #[tokio::test]
    async fn seed_failure_is_a_configuration_stage_failure() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::failing(&["create_seed"]));
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        let err = provisioner
            .create_server(&request(r#"{"name":"web-1","image":"ubuntu-24.04","password":"r00t"}"#))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Configuration));
        assert!(err.to_string().starts_with("configuration stage failed"));
        let calls = driver.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls.iter().any(|c| c.starts_with("create_vm")));
    }

    #[tokio::test]
    async fn launch_failure_leaves_earlier_artifacts() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::failing(&["create_vm"]));
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        let err = provisioner
            .create_server(&request(r#"{"name":"web-1","image":"ubuntu-24.04","password":"r00t"}"#))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Launch));
        assert!(err.to_string().starts_with("launch stage failed"));
        let calls = driver.calls();
        assert_eq!(calls.len(), 3);
        assert!(!calls.iter().any(|c| c.starts_with("delete_vm")));
    }

    #[tokio::test]
    async fn invalid_request_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::default());
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        let err = provisioner
            .create_server(&request(r#"{"name":"bad name","image":"ubuntu-24.04","password":"r00t"}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::InvalidRequest(_)));
        assert_eq!(err.stage(), None);
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn actions_delegate_to_driver() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::failing(&["reboot_vm"]));
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        provisioner.perform_action("web-1", "START").await.unwrap();
        provisioner.perform_action("web-1", "stop").await.unwrap();
        provisioner.perform_action("web-1", "delete").await.unwrap();
        let reboot = provisioner.perform_action("web-1", "reboot").await.unwrap_err();
        let unknown = provisioner.perform_action("web-1", "hibernate").await.unwrap_err();

        assert!(matches!(reboot, ProvisionError::Driver(DriverError::CommandFailed { .. })));
        assert!(matches!(unknown, ProvisionError::UnknownAction(a) if a == "hibernate"));
        assert_eq!(
            driver.calls(),
            vec!["start_vm web-1", "stop_vm web-1", "delete_vm web-1", "reboot_vm web-1"]
        );
    }

    #[tokio::test]
    async fn path_like_ids_never_reach_the_driver() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::default());
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        let delete = provisioner
            .perform_action("../../cache/ubuntu-24.04", "delete")
            .await
            .unwrap_err();
        let resize = provisioner.resize_server("../web-1", 2, 4096).await.unwrap_err();

        assert!(matches!(delete, ProvisionError::InvalidRequest(_)));
        assert!(matches!(resize, ProvisionError::InvalidRequest(_)));
        assert!(driver.calls().is_empty());
        assert!(dir.path().join("cache/ubuntu-24.04.qcow2").exists());
    }

    #[tokio::test]
    async fn resize_and_bridge_delegate_after_validation() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::default());
        let provisioner = Provisioner::new(registry(&dir), Arc::clone(&driver) as Arc<dyn Driver>);

        provisioner.resize_server("web-1", 4, 8192).await.unwrap();
        provisioner.create_bridge_network("host-bridge", "eth0").await.unwrap();
        let zero = provisioner.resize_server("web-1", 0, 8192).await.unwrap_err();
        let bad_nic = provisioner.create_bridge_network("host-bridge", "").await.unwrap_err();

        assert!(matches!(zero, ProvisionError::InvalidRequest(_)));
        assert!(matches!(bad_nic, ProvisionError::InvalidRequest(_)));
        assert_eq!(
            driver.calls(),
            vec!["resize_vm web-1 4 8192", "create_bridge_network host-bridge eth0"]
        );
    }

    #[tokio::test]
    async fn listing_omits_instances_that_fail_inspection() {
        let dir = TempDir::new().unwrap();
        let provisioner = Provisioner::new(registry(&dir), Arc::new(FakeDriver::default()));

        let servers = provisioner.list_servers().await.unwrap();

        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["web-1", "db-1"]);
    }
}
