use crate::cluster::ClusterError;
use crate::graph::CycleError;
use crate::patterns::LoadError;
use thiserror::Error;

/// Process exit codes reserved per failure class.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const CONFIGURATION: i32 = 10;
    pub const CONNECTIVITY: i32 = 20;
    pub const CYCLE: i32 = 30;
}

/// Top-level error for controller operations.
///
/// Per-event failures (step failures, verification timeouts) are reported as
/// [`crate::executor::Outcome`] values rather than through this type, so one
/// bad recovery never unwinds the watch loop.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] LoadError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("manifest error in {path}: {details}")]
    Manifest { path: String, details: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Exit code for the CLI surface.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => exit_code::CONFIGURATION,
            Error::Cluster(err) if err.is_connectivity() => exit_code::CONNECTIVITY,
            Error::Cycle(_) => exit_code::CYCLE,
            _ => exit_code::GENERIC,
        }
    }

    /// Short category used in structured logs.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration_error",
            Error::Cluster(_) => "cluster_error",
            Error::Cycle(_) => "cycle_detected",
            Error::Manifest { .. } => "manifest_error",
            Error::Io(_) | Error::Serialization(_) => "system_error",
            Error::Other(_) => "generic_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKey;

    #[test]
    fn exit_codes_follow_failure_class() {
        let config = Error::Configuration(LoadError::Parse {
            details: "bad yaml".to_string(),
        });
        assert_eq!(config.exit_code(), exit_code::CONFIGURATION);
        assert_eq!(config.category(), "configuration_error");

        let connectivity = Error::Cluster(ClusterError::Connectivity("refused".to_string()));
        assert_eq!(connectivity.exit_code(), exit_code::CONNECTIVITY);

        let api = Error::Cluster(ClusterError::Api {
            code: 403,
            message: "forbidden".to_string(),
        });
        assert_eq!(api.exit_code(), exit_code::GENERIC);

        let x = ResourceKey::new("Kustomization", "flux-system", "x");
        let cycle = Error::Cycle(CycleError {
            path: vec![x.clone(), x],
        });
        assert_eq!(cycle.exit_code(), exit_code::CYCLE);
    }
}
