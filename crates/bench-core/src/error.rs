use thiserror::Error;

/// Task-level failure taxonomy. Raised inside one task's lifecycle and
/// carried through `anyhow::Error` up to the scheduler boundary.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("setup error: {0}")]
    Setup(String),
    #[error("isolation error: {0}")]
    Isolation(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("verification error: {0}")]
    Verification(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Setup,
    Isolation,
    Protocol,
    Verification,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Isolation => "isolation",
            Self::Protocol => "protocol",
            Self::Verification => "verification",
        }
    }
}

impl BenchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Setup(_) => ErrorKind::Setup,
            Self::Isolation(_) => ErrorKind::Isolation,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Verification(_) => ErrorKind::Verification,
        }
    }

    /// Finds the first `BenchError` in an error chain.
    pub fn classify(err: &anyhow::Error) -> Option<ErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<BenchError>())
            .map(BenchError::kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_kind_under_context() {
        let err = Err::<(), _>(BenchError::Isolation("image missing".to_string()))
            .context("task topic-repo-test-x")
            .expect_err("should fail");
        assert_eq!(BenchError::classify(&err), Some(ErrorKind::Isolation));
        assert!(format!("{:#}", err).contains("image missing"));
    }

    #[test]
    fn classify_plain_errors_as_none() {
        let err = anyhow::anyhow!("io failure");
        assert_eq!(BenchError::classify(&err), None);
    }
}
