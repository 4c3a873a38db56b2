use std::fmt;

/// Failure modes of a duplication request. A successful request is the
/// `Ok(())` side of [`DuplicationResult`]; diagnostics name it
/// "Succeeded" (see [`result_name`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicationError {
    /// The process is running in a session without access to the
    /// interactive desktop (session 0). Reported only before the first
    /// successful duplication; once a capture has succeeded, later
    /// failures surface as [`InitializationFailed`](Self::InitializationFailed).
    UnsupportedSession,

    /// The caller's frame buffer could not be sized to the requested
    /// capture area. Controller state is untouched.
    FramePreparationFailed,

    /// The duplication stack could not be (re)initialized, typically
    /// because the display mode is changing. The next call retries from
    /// scratch.
    InitializationFailed,

    /// Initialization succeeded but the underlying duplication call
    /// failed. The controller tears down its adapter state; the next
    /// call rebuilds it.
    DuplicationFailed,

    /// The requested monitor id is not smaller than the current screen
    /// count. No teardown happens; the caller should correct the id.
    InvalidMonitorId,
}

pub type DuplicationResult<T> = Result<T, DuplicationError>;

impl DuplicationError {
    /// Whether the same call may succeed if simply repeated. Errors that
    /// require a caller-side fix (a larger frame, a valid monitor id) or
    /// a different session are not retryable.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::InitializationFailed | Self::DuplicationFailed
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedSession => "Unsupported session",
            Self::FramePreparationFailed => "Frame preparation failed",
            Self::InitializationFailed => "Initialization failed",
            Self::DuplicationFailed => "Duplication failed",
            Self::InvalidMonitorId => "Invalid monitor id",
        }
    }
}

/// Diagnostic name for a duplication outcome, covering the success case.
pub fn result_name(result: &DuplicationResult<()>) -> &'static str {
    match result {
        Ok(()) => "Succeeded",
        Err(error) => error.as_str(),
    }
}

impl fmt::Display for DuplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedSession => {
                write!(f, "process session has no access to the interactive desktop")
            }
            Self::FramePreparationFailed => {
                write!(f, "caller frame could not be sized for the capture area")
            }
            Self::InitializationFailed => {
                write!(f, "desktop duplication could not be initialized")
            }
            Self::DuplicationFailed => write!(f, "desktop duplication call failed"),
            Self::InvalidMonitorId => write!(f, "monitor id is out of range"),
        }
    }
}

impl std::error::Error for DuplicationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_name_covers_success_and_all_errors() {
        assert_eq!(result_name(&Ok(())), "Succeeded");
        assert_eq!(
            result_name(&Err(DuplicationError::UnsupportedSession)),
            "Unsupported session"
        );
        assert_eq!(
            result_name(&Err(DuplicationError::FramePreparationFailed)),
            "Frame preparation failed"
        );
        assert_eq!(
            result_name(&Err(DuplicationError::InitializationFailed)),
            "Initialization failed"
        );
        assert_eq!(
            result_name(&Err(DuplicationError::DuplicationFailed)),
            "Duplication failed"
        );
        assert_eq!(
            result_name(&Err(DuplicationError::InvalidMonitorId)),
            "Invalid monitor id"
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(DuplicationError::InitializationFailed.is_retryable());
        assert!(DuplicationError::DuplicationFailed.is_retryable());
        assert!(!DuplicationError::UnsupportedSession.is_retryable());
        assert!(!DuplicationError::FramePreparationFailed.is_retryable());
        assert!(!DuplicationError::InvalidMonitorId.is_retryable());
    }
}
