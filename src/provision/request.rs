use std::fmt;

use serde::{Deserialize, Serialize};

use super::ProvisionError;
use crate::driver::NetworkTarget;

const MAX_HOSTNAME_LEN: usize = 63;
const MAX_INTERFACE_LEN: usize = 15;

/// Order for a new instance, as accepted by the control plane.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub name: String,
    /// Logical image name, e.g. `ubuntu-24.04`.
    pub image: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Root password.
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_root_login: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_interface: Option<String>,
}

impl ProvisionRequest {
    /// The secondary account, if one was asked for. `root` means none.
    pub fn secondary_user(&self) -> Option<&str> {
        self.username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != "root")
    }

    /// Password for the secondary account; the root password when omitted.
    pub fn secondary_password(&self) -> &str {
        self.user_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.password)
    }

    /// Root SSH login defaults to allowed only for root-only instances.
    pub fn root_login_allowed(&self) -> bool {
        self.allow_root_login.unwrap_or(self.secondary_user().is_none())
    }

    pub fn network(&self) -> NetworkTarget {
        NetworkTarget::from_bridge(self.bridge_interface.as_deref())
    }

    pub(crate) fn validate(&self) -> Result<(), ProvisionError> {
        let invalid = |msg: String| Err(ProvisionError::InvalidRequest(msg));

        validate_instance_id(&self.name)?;
        if self.image.trim().is_empty() {
            return invalid("image is required".to_string());
        }
        if self.password.is_empty() {
            return invalid("password is required".to_string());
        }
        if let Some(user) = self.secondary_user()
            && !is_username(user)
        {
            return invalid(format!("username {user:?} is not a valid login name"));
        }
        if [Some(self.password.as_str()), self.user_password.as_deref()]
            .into_iter()
            .flatten()
            .any(|p| p.contains(['\n', '\r']))
        {
            return invalid("passwords must be a single line".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("plan", &self.plan)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_password", &self.user_password.as_ref().map(|_| "<redacted>"))
            .field("allow_root_login", &self.allow_root_login)
            .field("bridge_interface", &self.bridge_interface)
            .finish()
    }
}

/// Instance ids are the names given at creation, so they follow the same
/// hostname rule.
pub(crate) fn validate_instance_id(id: &str) -> Result<(), ProvisionError> {
    if is_hostname(id) {
        Ok(())
    } else {
        Err(ProvisionError::InvalidRequest(format!(
            "instance name {id:?} must be 1-{MAX_HOSTNAME_LEN} letters, digits or '-', not starting or ending with '-'"
        )))
    }
}

/// A libvirt network name plus the host NIC it bridges onto.
pub(crate) fn validate_bridge(network: &str, host_interface: &str) -> Result<(), ProvisionError> {
    if !is_hostname(network) {
        return Err(ProvisionError::InvalidRequest(format!(
            "network name {network:?} must be letters, digits or '-'"
        )));
    }
    let interface_ok = !host_interface.is_empty()
        && host_interface.len() <= MAX_INTERFACE_LEN
        && host_interface
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !interface_ok {
        return Err(ProvisionError::InvalidRequest(format!(
            "host interface {host_interface:?} is not a valid interface name"
        )));
    }
    Ok(())
}

fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_HOSTNAME_LEN
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_username(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && name.len() <= 32
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
}
