//! HTTP control plane.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::catalog::{CatalogEntry, CatalogService};
use crate::driver::{DriverError, InstanceDescriptor};
use crate::notify::{Notifier, ReleaseNotification};
use crate::provision::{ProvisionError, ProvisionRequest, Provisioner, StageCause};
use crate::registry::{ImageRegistry, RegistryEntry, RegistryError};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogService>,
    pub registry: Arc<ImageRegistry>,
    pub provisioner: Arc<Provisioner>,
    pub notifier: Notifier,
}

impl AppState {
    pub fn new(catalog: Arc<CatalogService>, registry: Arc<ImageRegistry>, provisioner: Arc<Provisioner>) -> Self {
        let notifier = Notifier::new(Arc::clone(&registry));
        Self {
            catalog,
            registry,
            provisioner,
            notifier,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), error = %self.message, "request failed");
        }
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

fn registry_status(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::InvalidName(_) | RegistryError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
        RegistryError::NotRegistered(_) => StatusCode::NOT_FOUND,
        RegistryError::DownloadFailed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self::new(registry_status(&err), err.to_string())
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let status = match &err {
            ProvisionError::InvalidRequest(_)
            | ProvisionError::UnknownAction(_)
            | ProvisionError::Driver(DriverError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            ProvisionError::Stage {
                source: StageCause::Registry(cause),
                ..
            } => registry_status(cause),
            ProvisionError::Stage {
                source: StageCause::Driver(DriverError::DiskExists(_)),
                ..
            } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub action: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub id: String,
    pub vcpus: u32,
    pub memory_mib: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub name: String,
    pub host_interface: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/api/vms", get(list_servers).post(create_server))
        .route("/api/vms/action", post(perform_action))
        .route("/api/vms/resize", post(resize_server))
        .route("/api/networks", post(create_bridge_network))
        .route("/api/catalog", get(catalog))
        .route("/api/images", get(images))
        .with_state(state)
}

pub async fn serve(listen: SocketAddr, state: AppState) -> io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "control plane listening");
    axum::serve(listener, router(state)).await
}

async fn webhook(
    State(state): State<AppState>,
    Json(notification): Json<ReleaseNotification>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let pending = state.notifier.accept(&notification)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "image": pending.entry.name() })),
    ))
}

async fn list_servers(State(state): State<AppState>) -> ApiResult<Json<Vec<InstanceDescriptor>>> {
    Ok(Json(state.provisioner.list_servers().await?))
}

async fn create_server(
    State(state): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let created = state.provisioner.create_server(&request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "created", "id": created.name, "plan": created.plan.name })),
    ))
}

async fn perform_action(State(state): State<AppState>, Json(request): Json<ActionRequest>) -> ApiResult<Json<Value>> {
    state.provisioner.perform_action(&request.id, &request.action).await?;
    Ok(Json(json!({ "status": "ok", "id": request.id })))
}

async fn resize_server(State(state): State<AppState>, Json(request): Json<ResizeRequest>) -> ApiResult<Json<Value>> {
    state
        .provisioner
        .resize_server(&request.id, request.vcpus, request.memory_mib)
        .await?;
    Ok(Json(json!({
        "status": "resized",
        "id": request.id,
        "vcpus": request.vcpus,
        "memoryMib": request.memory_mib,
    })))
}

async fn create_bridge_network(
    State(state): State<AppState>,
    Json(request): Json<BridgeRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state
        .provisioner
        .create_bridge_network(&request.name, &request.host_interface)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "created", "network": request.name })),
    ))
}

async fn catalog(State(state): State<AppState>) -> Json<Vec<CatalogEntry>> {
    Json(state.catalog.load().await.as_ref().clone())
}

async fn images(State(state): State<AppState>) -> Json<Vec<RegistryEntry>> {
    Json(state.registry.entries())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::KvmSettings;
    use crate::driver::KvmDriver;
    use crate::registry::ImageStatus;
    use crate::repositories::Prober;
    use crate::test_support::{SilentRunner, serve as serve_router, unreachable_base};

    async fn start(dir: &TempDir) -> (String, AppState) {
        let registry = Arc::new(ImageRegistry::open(dir.path().join("images.json"), dir.path().join("cache")).unwrap());
        let prober = Prober::new(Duration::from_millis(200), Duration::from_millis(200)).unwrap();
        let catalog = Arc::new(CatalogService::new(
            Vec::new(),
            prober,
            dir.path().join("catalog.json"),
            Duration::from_secs(3600),
        ));
        let driver = KvmDriver::new(
            Arc::new(SilentRunner),
            dir.path().join("vms"),
            dir.path().join("configs"),
            &KvmSettings::default(),
        );
        let provisioner = Arc::new(Provisioner::new(Arc::clone(&registry), Arc::new(driver)));
        let state = AppState::new(catalog, registry, provisioner);
        (serve_router(router(state.clone())).await, state)
    }

    #[tokio::test]
    async fn webhook_registers_release() {
        let dir = TempDir::new().unwrap();
        let (base, state) = start(&dir).await;

        let res = reqwest::Client::new()
            .post(format!("{base}/webhook"))
            .json(&json!({
                "distro": "Ubuntu",
                "version": "24.04",
                "url": format!("{}/noble.img", unreachable_base()),
            }))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), reqwest::StatusCode::ACCEPTED);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["image"], "ubuntu-24.04");
        let entry = state.registry.get("ubuntu-24.04").unwrap();
        assert_ne!(entry.status(), ImageStatus::Ready);
    }

    #[tokio::test]
    async fn webhook_rejects_bad_url() {
        let dir = TempDir::new().unwrap();
        let (base, _) = start(&dir).await;

        let res = reqwest::Client::new()
            .post(format!("{base}/webhook"))
            .json(&json!({ "id": "custom", "url": "ftp://mirror/custom.qcow2" }))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_with_unregistered_image_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (base, _) = start(&dir).await;

        let res = reqwest::Client::new()
            .post(format!("{base}/api/vms"))
            .json(&json!({ "name": "desk-1", "image": "windows-11", "password": "r00t" }))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = res.json().await.unwrap();
        assert!(body["error"]["message"].as_str().unwrap().starts_with("image stage failed"));
        assert!(!dir.path().join("vms/desk-1.qcow2").exists());
    }

    #[tokio::test]
    async fn unknown_action_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let (base, _) = start(&dir).await;

        let res = reqwest::Client::new()
            .post(format!("{base}/api/vms/action"))
            .json(&json!({ "id": "web-1", "action": "hibernate" }))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn path_like_action_id_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let (base, _) = start(&dir).await;
        let victim = dir.path().join("cache/ubuntu-24.04.qcow2");
        std::fs::write(&victim, b"base image").unwrap();

        let res = reqwest::Client::new()
            .post(format!("{base}/api/vms/action"))
            .json(&json!({ "id": "../cache/ubuntu-24.04", "action": "delete" }))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn resize_and_network_routes() {
        let dir = TempDir::new().unwrap();
        let (base, _) = start(&dir).await;
        let client = reqwest::Client::new();

        let resized = client
            .post(format!("{base}/api/vms/resize"))
            .json(&json!({ "id": "web-1", "vcpus": 4, "memoryMib": 8192 }))
            .send()
            .await
            .unwrap();
        let network = client
            .post(format!("{base}/api/networks"))
            .json(&json!({ "name": "host-bridge", "hostInterface": "eth0" }))
            .send()
            .await
            .unwrap();
        let zero = client
            .post(format!("{base}/api/vms/resize"))
            .json(&json!({ "id": "web-1", "vcpus": 0, "memoryMib": 8192 }))
            .send()
            .await
            .unwrap();

        assert_eq!(resized.status(), reqwest::StatusCode::OK);
        assert_eq!(network.status(), reqwest::StatusCode::CREATED);
        assert_eq!(zero.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listings_are_json_arrays() {
        let dir = TempDir::new().unwrap();
        let (base, _) = start(&dir).await;
        let client = reqwest::Client::new();

        let vms: Value = client.get(format!("{base}/api/vms")).send().await.unwrap().json().await.unwrap();
        let catalog: Value = client.get(format!("{base}/api/catalog")).send().await.unwrap().json().await.unwrap();
        let images: Value = client.get(format!("{base}/api/images")).send().await.unwrap().json().await.unwrap();

        assert_eq!(vms, json!([]));
        assert_eq!(catalog, json!([]));
        assert_eq!(images, json!([]));
    }
}
