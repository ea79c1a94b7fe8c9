use std::fmt;

use crate::driver::DriverError;
use crate::registry::RegistryError;

/// Steps of the creation pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Image,
    Disk,
    Configuration,
    Launch,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Image => "image",
            Stage::Disk => "disk",
            Stage::Configuration => "configuration",
            Stage::Launch => "launch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StageCause {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A creation step failed; earlier steps' side effects are left in place.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageCause,
    },
    #[error("unknown action '{0}' (expected start, stop, reboot or delete)")]
    UnknownAction(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl ProvisionError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ProvisionError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn at<E: Into<StageCause>>(stage: Stage) -> impl FnOnce(E) -> Self {
        move |err| ProvisionError::Stage {
            stage,
            source: err.into(),
        }
    }
}
