use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vps_manager::catalog::{CatalogEntry, CatalogService};
use vps_manager::config::{CONFIG_ENV, Settings};
use vps_manager::driver::KvmDriver;
use vps_manager::helpers::choose_one;
use vps_manager::provision::{ProvisionRequest, Provisioner};
use vps_manager::registry::ImageRegistry;
use vps_manager::server::{self, AppState};

#[derive(Parser)]
#[command(name = "vps-manager", version, about = "Discover cloud images and provision KVM servers")]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the image catalog
    Catalog {
        /// Probe the mirrors even if the cache is fresh
        #[arg(long)]
        refresh: bool,
    },
    /// Pick a catalog image interactively and register it
    Pick {
        /// Download it right away
        #[arg(long)]
        pull: bool,
    },
    /// Register (or re-register) an image under a logical name
    Register {
        name: String,
        url: String,
        #[arg(long)]
        checksum: Option<String>,
    },
    /// Download a registered image unless it is already local
    Pull { name: String },
    /// List registered images
    Images,
    /// Create a server
    Create {
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "Starter")]
        plan: String,
        /// Secondary sudo user; omit for a root-only server
        #[arg(long)]
        username: Option<String>,
        #[arg(long, env = "VPS_ROOT_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, env = "VPS_USER_PASSWORD", hide_env_values = true)]
        user_password: Option<String>,
        #[arg(long)]
        allow_root_login: Option<bool>,
        /// Attach to this host bridge instead of the default NAT network
        #[arg(long)]
        bridge: Option<String>,
    },
    /// List servers
    List,
    /// Start, stop, reboot or delete a server
    Action { id: String, action: String },
    /// Change a server's vCPUs and memory (applies on next boot)
    Resize {
        id: String,
        #[arg(long)]
        vcpus: u32,
        #[arg(long)]
        memory_mib: u64,
    },
    /// Create a libvirt network bridged onto a host interface
    Bridge {
        /// libvirt network name
        name: String,
        host_interface: String,
    },
    /// Run the HTTP control plane
    Serve {
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Command::Catalog { refresh } => {
            let catalog = catalog_service(&settings)?;
            let entries = if refresh {
                catalog.refresh().await
            } else {
                catalog.load().await
            };
            print_catalog(&entries);
        }
        Command::Pick { pull } => {
            let catalog = catalog_service(&settings)?;
            let entries = catalog.load().await;
            let chosen = pick_entry(&entries)?;

            let registry = image_registry(&settings)?;
            let entry = registry.register(&chosen.logical_name(), chosen.download_url(), None)?;
            println!("registered {} -> {}", entry.name(), entry.url());
            if pull {
                let entry = registry.resolve(entry.name()).await?;
                println!("{} is {} at {}", entry.name(), entry.status(), entry.local_path().display());
            }
        }
        Command::Register { name, url, checksum } => {
            let entry = image_registry(&settings)?.register(&name, &url, checksum.as_deref())?;
            println!("registered {} -> {}", entry.name(), entry.url());
        }
        Command::Pull { name } => {
            let entry = image_registry(&settings)?.resolve(&name).await?;
            println!("{} is {} at {}", entry.name(), entry.status(), entry.local_path().display());
        }
        Command::Images => {
            for entry in image_registry(&settings)?.entries() {
                println!(
                    "{:<24} {:<12} {:<60} {}",
                    entry.name(),
                    entry.status(),
                    entry.url(),
                    entry.local_path().display()
                );
            }
        }
        Command::Create {
            name,
            image,
            plan,
            username,
            password,
            user_password,
            allow_root_login,
            bridge,
        } => {
            let request = ProvisionRequest {
                name,
                image,
                plan,
                username,
                password,
                user_password,
                allow_root_login,
                bridge_interface: bridge,
            };
            let created = provisioner(&settings)?.create_server(&request).await?;
            println!(
                "created {} ({}: {} vCPU, {} MiB, {} GiB)",
                created.name, created.plan.name, created.plan.vcpus, created.plan.memory_mib, created.plan.disk_gib
            );
        }
        Command::List => {
            for vm in provisioner(&settings)?.list_servers().await? {
                println!(
                    "{:<24} {:<12} {}",
                    vm.name,
                    vm.status,
                    vm.address.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Action { id, action } => {
            provisioner(&settings)?.perform_action(&id, &action).await?;
            println!("{action} {id}: ok");
        }
        Command::Resize { id, vcpus, memory_mib } => {
            provisioner(&settings)?.resize_server(&id, vcpus, memory_mib).await?;
            println!("resized {id} to {vcpus} vCPU, {memory_mib} MiB (applies on next boot)");
        }
        Command::Bridge { name, host_interface } => {
            provisioner(&settings)?
                .create_bridge_network(&name, &host_interface)
                .await?;
            println!("network {name} bridged onto {host_interface}");
        }
        Command::Serve { listen } => {
            let registry = image_registry(&settings)?;
            let driver = Arc::new(KvmDriver::from_settings(&settings));
            let provisioner = Arc::new(Provisioner::new(Arc::clone(&registry), driver));
            let state = AppState::new(catalog_service(&settings)?, registry, provisioner);
            server::serve(listen.unwrap_or(settings.listen), state)
                .await
                .context("control plane stopped")?;
        }
    }

    Ok(())
}

fn catalog_service(settings: &Settings) -> Result<Arc<CatalogService>> {
    Ok(Arc::new(
        CatalogService::from_settings(settings).context("building catalog service")?,
    ))
}

fn image_registry(settings: &Settings) -> Result<Arc<ImageRegistry>> {
    let registry = ImageRegistry::from_settings(settings)
        .with_context(|| format!("opening image registry {}", settings.registry_path().display()))?;
    Ok(Arc::new(registry))
}

fn provisioner(settings: &Settings) -> Result<Provisioner> {
    let driver = Arc::new(KvmDriver::from_settings(settings));
    Ok(Provisioner::new(image_registry(settings)?, driver))
}

fn catalog_label(entry: &CatalogEntry) -> String {
    format!(
        "{} [{}]{}",
        entry.display_name(),
        entry.logical_name(),
        if entry.is_lts() { " LTS" } else { "" }
    )
}

fn print_catalog(entries: &[CatalogEntry]) {
    if entries.is_empty() {
        println!("no images found (mirrors unreachable?)");
        return;
    }
    for entry in entries {
        println!("{:<44} {}", catalog_label(entry), entry.download_url());
    }
}

fn pick_entry(entries: &[CatalogEntry]) -> Result<&CatalogEntry> {
    let labels: Vec<String> = entries.iter().map(catalog_label).collect();
    let choice = choose_one("Select image", labels.clone())?;
    match labels.iter().position(|label| *label == choice) {
        Some(idx) => Ok(&entries[idx]),
        None => bail!("selection '{choice}' is not in the catalog"),
    }
}
