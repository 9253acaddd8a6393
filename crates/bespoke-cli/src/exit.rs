//! Documented exit codes and the error type that maps onto them.

/// Exit code: success.
pub const SUCCESS: i32 = 0;
/// Exit code: user error (invalid flags or schema).
pub const USER_ERROR: i32 = 2;
/// Exit code: coordinator unreachable.
pub const UNREACHABLE: i32 = 3;
/// Exit code: the submission errored.
pub const SUBMISSION_ERRORED: i32 = 4;
/// Exit code: the submission was cancelled.
pub const SUBMISSION_CANCELLED: i32 = 5;

/// Command failure carrying its exit code.
#[derive(Debug)]
pub enum CliError {
    /// Invalid flags, unreadable input, or a schema rejection (exit 2).
    User(String),
    /// The coordinator could not be reached (exit 3).
    Unreachable(String),
    /// The watched or retrieved submission errored (exit 4).
    SubmissionErrored,
    /// The watched or retrieved submission was cancelled (exit 5).
    SubmissionCancelled,
    /// Any other failure (exit 1).
    Other(anyhow::Error),
}

impl CliError {
    /// The process exit code for this failure.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::User(_) => USER_ERROR,
            Self::Unreachable(_) => UNREACHABLE,
            Self::SubmissionErrored => SUBMISSION_ERRORED,
            Self::SubmissionCancelled => SUBMISSION_CANCELLED,
            Self::Other(_) => 1,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(message) => write!(f, "{message}"),
            Self::Unreachable(message) => {
                write!(f, "coordinator unreachable: {message}")
            }
            Self::SubmissionErrored => write!(f, "submission errored"),
            Self::SubmissionCancelled => write!(f, "submission cancelled"),
            Self::Other(error) => write!(f, "{error}"),
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value)
    }
}

/// Command result type.
pub type CliResult = Result<(), CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_documentation() {
        assert_eq!(CliError::User("bad flag".into()).code(), 2);
        assert_eq!(CliError::Unreachable("refused".into()).code(), 3);
        assert_eq!(CliError::SubmissionErrored.code(), 4);
        assert_eq!(CliError::SubmissionCancelled.code(), 5);
    }
}
