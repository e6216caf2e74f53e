//! Deployment error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use envgrid_backend::BackendError;
use envgrid_engine::EngineError;

/// Where in a deployment a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStage {
    Validation,
    Build,
    Pull,
    Create,
    Start,
    Connect,
}

impl DeployStage {
    /// Classify a replica construction failure.
    pub fn of(err: &BackendError) -> Self {
        match err {
            BackendError::Engine(engine) => match engine {
                EngineError::Connection { .. } => DeployStage::Connect,
                EngineError::ImageNotFound(_) => DeployStage::Pull,
                EngineError::Start(_) => DeployStage::Start,
                EngineError::Build(_) => DeployStage::Build,
                EngineError::Container(_) | EngineError::Api { .. } | EngineError::Io(_) => {
                    DeployStage::Create
                }
            },
            BackendError::Backend { .. } => DeployStage::Connect,
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployStage::Validation => "validation",
            DeployStage::Build => "build",
            DeployStage::Pull => "pull",
            DeployStage::Create => "create",
            DeployStage::Start => "start",
            DeployStage::Connect => "connect",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while deploying or looking up backends.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Self-contradictory request. Raised before any daemon I/O.
    #[error("invalid deployment: {0}")]
    Validation(String),

    /// A replica (or the image build) failed; successful siblings were cleaned up.
    #[error("deployment {name} failed during {stage}{}: {source}", rollback_note(.rolled_back))]
    Failed {
        name: String,
        stage: DeployStage,
        /// Replicas that had come up and were cleaned up again.
        rolled_back: usize,
        #[source]
        source: BackendError,
    },

    #[error("backend already registered: {0}")]
    AlreadyRegistered(String),

    /// A replica container already belongs to another live deployment.
    #[error("replica {replica} is already owned by {owner}")]
    ReplicaInUse { replica: String, owner: String },

    #[error("backend not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

fn rollback_note(rolled_back: &usize) -> String {
    match rolled_back {
        0 => String::new(),
        n => format!(" (rolled back {n} replica(s))"),
    }
}

impl DeployError {
    /// Stage a deployment failed at, if it failed as a deployment.
    pub fn stage(&self) -> Option<DeployStage> {
        match self {
            DeployError::Validation(_) => Some(DeployStage::Validation),
            DeployError::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_classification() {
        let pull: BackendError = EngineError::ImageNotFound("x:1".into()).into();
        let start: BackendError = EngineError::Start("sbx-0".into()).into();
        let create: BackendError = EngineError::Container("sbx-0".into()).into();
        assert_eq!(DeployStage::of(&pull), DeployStage::Pull);
        assert_eq!(DeployStage::of(&start), DeployStage::Start);
        assert_eq!(DeployStage::of(&create), DeployStage::Create);
        assert_eq!(DeployStage::of(&BackendError::new("refused")), DeployStage::Connect);
    }

    #[test]
    fn failure_message_names_stage_and_rollback() {
        let err = DeployError::Failed {
            name: "sbx".to_string(),
            stage: DeployStage::Create,
            rolled_back: 2,
            source: EngineError::Container("failed to create sbx-2".into()).into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("deployment sbx failed during create (rolled back 2 replica(s))"));
        assert_eq!(err.stage(), Some(DeployStage::Create));
    }
}
