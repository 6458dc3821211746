use thiserror::Error;

/// Everything that can go wrong while watching the portal.
///
/// Every error is classified at the point of origin into one of three
/// [`ErrorKind`]s and handled at the orchestrator boundary — no error leaves a
/// component unclassified.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// The portal rejected the configured username/password. Retrying will
    /// not change the outcome and risks an account lockout.
    #[error("portal rejected the configured credentials")]
    Auth,

    /// The portal presented a security question with no stored answer. The
    /// operator has to add the Q/A pair to credential.json.
    #[error("no stored answer matches security question: {0:?}")]
    UnknownSecurityQuestion(String),

    /// Every captcha guess in a login attempt was rejected. The whole login
    /// flow restarts from scratch after backoff.
    #[error("captcha rejected {0} times, abandoning this login attempt")]
    CaptchaExhausted(u32),

    /// The captcha solver endpoint could not produce a guess.
    #[error("captcha solver unavailable: {0}")]
    SolverUnavailable(String),

    /// The calendar response did not have the expected shape.
    #[error("calendar response did not parse: {0}")]
    Parse(String),

    /// A logged-out indicator showed up during what should have been an
    /// authenticated operation.
    #[error("session expired mid-operation")]
    SessionExpired,

    /// Page driver failure — navigation, element lookup, evaluation.
    #[error("page driver: {0}")]
    Driver(String),

    /// Outbound notification failure. Logged by the dispatcher, never retried.
    #[error("notifier: {0}")]
    Notify(String),

    /// Operator-requested shutdown observed at a safe suspension point.
    #[error("shutdown requested")]
    Interrupted,
}

/// Handling class for a [`SentinelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operator-correctable; the loop terminates and the error is surfaced
    /// verbatim.
    Fatal,
    /// Reset to a safe state and retry after backoff; never crashes.
    Transient,
    /// Force re-authentication on the next cycle; escalates to fatal only
    /// when it recurs beyond a threshold.
    SessionExpiry,
}

impl SentinelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SentinelError::Auth | SentinelError::UnknownSecurityQuestion(_) => ErrorKind::Fatal,
            SentinelError::SessionExpired => ErrorKind::SessionExpiry,
            SentinelError::CaptchaExhausted(_)
            | SentinelError::SolverUnavailable(_)
            | SentinelError::Parse(_)
            | SentinelError::Driver(_)
            | SentinelError::Notify(_)
            | SentinelError::Interrupted => ErrorKind::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Distinct process exit codes so supervisors can tell operator-correctable
    /// failures apart from crashes. 0 is reserved for graceful shutdown.
    pub fn exit_code(&self) -> i32 {
        match self {
            SentinelError::Auth => 10,
            SentinelError::UnknownSecurityQuestion(_) => 11,
            _ => 1,
        }
    }
}
