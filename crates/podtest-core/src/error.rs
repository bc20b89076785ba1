use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} is not a defined repository name")]
    UnknownRepoName(String),

    #[error("{0} is not a defined token name")]
    UnknownTokenName(String),

    #[error("{0} is not a defined artifact name")]
    UnknownArtifactName(String),

    #[error("main container name must be specified")]
    MainContainerUnspecified,

    #[error("main container {0} is not declared in containers")]
    MainContainerNotFound(String),

    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("failed to collect dynamic keys: {0}")]
    DynamicKeys(String),

    #[error("command exited with status {exit_code}")]
    CommandFailed { exit_code: i32, output: Vec<u8> },

    #[error("failed to copy {src} to {dst}: {reason}")]
    Copy {
        src: String,
        dst: String,
        reason: String,
    },

    #[error("timed out after {0:?} while staging files into the pod")]
    PreInitTimeout(Duration),

    #[error("repository clone failed: {0}")]
    Clone(String),

    #[error("token issuance failed: {0}")]
    Token(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors caused by a malformed or self-contradictory job spec.
    /// The CLI maps these to their own exit code.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownRepoName(_)
                | Error::UnknownTokenName(_)
                | Error::UnknownArtifactName(_)
                | Error::MainContainerUnspecified
                | Error::MainContainerNotFound(_)
                | Error::InvalidStrategy(_)
        )
    }
}
