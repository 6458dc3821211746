//! Login/session state machine.
//!
//! The portal's implicit workflow — credentials, maybe a security question,
//! maybe a captcha, maybe a waiting room — is reconstructed as an explicit
//! finite-state machine. Every transition is driven by the [`PageMarker`]
//! the driver reports, never inferred ad hoc from page content, so each one
//! is independently testable with a scripted driver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::driver::{
    PageDriver, PageMarker, CAPTCHA_IMAGE, CAPTCHA_RESPONSE_FIELD, CONTINUE_BUTTON,
    PASSWORD_FIELD, SIGN_IN_FIELD,
};
use crate::captcha::CaptchaSolver;
use crate::core::types::Credential;
use crate::core::SentinelError;

/// Where the login sub-flow currently stands. Exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    CredentialsSubmitted,
    SecurityQuestionPending,
    CaptchaPending,
    WaitingRoom,
    Authenticated,
    /// Terminal for the cycle; the next cycle starts over from `LoggedOut`.
    SessionExpired,
}

/// The one mutable record of the browser session, threaded through the
/// orchestrator. The profile directory is what makes the identity durable:
/// reusing it lets a still-valid server-side cookie skip the login flow.
#[derive(Debug)]
pub struct SessionHandle {
    pub profile_dir: PathBuf,
    pub state: LoginState,
    pub last_auth: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Consecutive mid-flight expiries; reset by a successful poll.
    pub expiry_events: u32,
}

impl SessionHandle {
    pub fn new(profile_dir: PathBuf) -> Self {
        Self {
            profile_dir,
            state: LoginState::LoggedOut,
            last_auth: None,
            consecutive_failures: 0,
            expiry_events: 0,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == LoginState::Authenticated
    }

    /// Force re-authentication on the next cycle.
    pub fn expire(&mut self) {
        self.state = LoginState::SessionExpired;
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub appointment_url: String,
    /// Captcha guesses per login attempt before `CaptchaExhausted`.
    pub captcha_max_attempts: u32,
    /// Upper bound on any single waiting-room sleep.
    pub waiting_room_max: Duration,
    /// Marker observations allowed per `ensure_authenticated` call (waiting
    /// room excluded) before the flow is declared stuck.
    pub step_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            appointment_url: "https://www.usvisascheduling.com/schedule/?reschedule=true"
                .to_string(),
            captcha_max_attempts: 5,
            waiting_room_max: Duration::from_secs(60),
            step_budget: 24,
        }
    }
}

pub struct SessionMachine {
    driver: Arc<dyn PageDriver>,
    solver: Arc<dyn CaptchaSolver>,
    credential: Credential,
    cfg: SessionConfig,
    shutdown: watch::Receiver<bool>,
}

impl SessionMachine {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        solver: Arc<dyn CaptchaSolver>,
        credential: Credential,
        cfg: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            driver,
            solver,
            credential,
            cfg,
            shutdown,
        }
    }

    /// Drive the login flow until the session is authenticated.
    ///
    /// Starts with a lightweight probe of the appointment page: when the
    /// persisted profile still carries a valid session cookie the first
    /// marker is already `Authenticated` and the whole flow is skipped.
    pub async fn ensure_authenticated(
        &self,
        handle: &mut SessionHandle,
    ) -> Result<(), SentinelError> {
        if handle.is_authenticated() {
            return Ok(());
        }
        if handle.state == LoginState::SessionExpired {
            handle.state = LoginState::LoggedOut;
        }

        self.driver.navigate(&self.cfg.appointment_url).await?;

        let mut steps = 0u32;
        loop {
            let marker = self.driver.read_marker().await?;
            match marker {
                PageMarker::Authenticated => {
                    handle.state = LoginState::Authenticated;
                    handle.last_auth = Some(Utc::now());
                    handle.consecutive_failures = 0;
                    info!("session authenticated");
                    return Ok(());
                }
                PageMarker::WaitingRoom { estimate } => {
                    // Exiting the waiting room is a precondition for every
                    // other action, so this is the one place the machine
                    // sleeps itself instead of deferring to the orchestrator.
                    handle.state = LoginState::WaitingRoom;
                    self.wait_out_waiting_room(estimate).await?;
                    continue; // waiting-room laps don't consume step budget
                }
                PageMarker::LoginForm => {
                    self.submit_credentials(handle).await?;
                }
                PageMarker::InvalidCredentials => {
                    handle.state = LoginState::LoggedOut;
                    handle.consecutive_failures = handle.consecutive_failures.saturating_add(1);
                    return Err(SentinelError::Auth);
                }
                PageMarker::SecurityQuestion { question, field } => {
                    self.answer_security_question(handle, &question, &field)
                        .await?;
                }
                PageMarker::Captcha => {
                    self.solve_captcha(handle).await?;
                }
                PageMarker::Unknown(url) => {
                    handle.state = LoginState::LoggedOut;
                    return Err(SentinelError::Driver(format!("unrecognized page: {url}")));
                }
            }

            steps += 1;
            if steps >= self.cfg.step_budget {
                handle.state = LoginState::LoggedOut;
                return Err(SentinelError::Driver(format!(
                    "login flow did not settle within {} steps",
                    self.cfg.step_budget
                )));
            }
        }
    }

    async fn submit_credentials(&self, handle: &mut SessionHandle) -> Result<(), SentinelError> {
        info!("submitting credentials for {}", self.credential.username);
        self.driver
            .fill(SIGN_IN_FIELD, &self.credential.username)
            .await?;
        self.driver
            .fill(PASSWORD_FIELD, &self.credential.password)
            .await?;
        self.driver.click(CONTINUE_BUTTON).await?;
        handle.state = LoginState::CredentialsSubmitted;
        Ok(())
    }

    /// Fill the presented security question from the stored Q/A pairs.
    /// An unmatched question is fatal — only the operator can supply the
    /// missing answer.
    async fn answer_security_question(
        &self,
        handle: &mut SessionHandle,
        question: &str,
        field: &str,
    ) -> Result<(), SentinelError> {
        handle.state = LoginState::SecurityQuestionPending;
        let answer = self
            .credential
            .answer_for(question)
            .ok_or_else(|| SentinelError::UnknownSecurityQuestion(question.to_string()))?;
        info!("answering security question: {question:?}");
        self.driver.fill(field, answer).await?;
        self.driver.click(CONTINUE_BUTTON).await?;
        Ok(())
    }

    /// Bounded captcha loop: capture a fresh challenge each attempt, submit
    /// the solver's guess, and check whether the portal moved on. A solver
    /// outage burns the attempt rather than aborting the count, so a hostile
    /// or broken challenge can never loop forever.
    async fn solve_captcha(&self, handle: &mut SessionHandle) -> Result<(), SentinelError> {
        handle.state = LoginState::CaptchaPending;
        let max = self.cfg.captcha_max_attempts;

        for attempt in 1..=max {
            let image = self.driver.capture_region(CAPTCHA_IMAGE).await?;
            let guess = match self.solver.solve(&image).await {
                Ok(g) => g,
                Err(e) => {
                    warn!("captcha solve failed (attempt {attempt}/{max}): {e}");
                    continue;
                }
            };
            info!("submitting captcha guess (attempt {attempt}/{max})");
            self.driver.fill(CAPTCHA_RESPONSE_FIELD, &guess).await?;
            self.driver.click(CONTINUE_BUTTON).await?;

            match self.driver.read_marker().await? {
                PageMarker::Captcha => {
                    warn!("captcha guess rejected (attempt {attempt}/{max})");
                }
                _ => return Ok(()), // moved on; outer loop re-reads the marker
            }
        }

        handle.state = LoginState::LoggedOut;
        Err(SentinelError::CaptchaExhausted(max))
    }

    /// Sleep out the waiting room: the lesser of the advertised estimate and
    /// the configured maximum, re-checking for shutdown — this and the loop
    /// boundary are the only legal cancellation points.
    async fn wait_out_waiting_room(
        &self,
        estimate: Option<Duration>,
    ) -> Result<(), SentinelError> {
        let wait = estimate
            .unwrap_or(self.cfg.waiting_room_max)
            .min(self.cfg.waiting_room_max);
        info!("waiting room detected, sleeping {}s", wait.as_secs());

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(SentinelError::Interrupted);
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = shutdown.changed() => Err(SentinelError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted driver: returns queued markers in order and records actions.
    #[derive(Default)]
    struct ScriptedDriver {
        markers: Mutex<VecDeque<PageMarker>>,
        fills: Mutex<Vec<(String, String)>>,
        clicks: Mutex<Vec<String>>,
        captures: AtomicU32,
    }

    impl ScriptedDriver {
        fn with_markers(markers: Vec<PageMarker>) -> Arc<Self> {
            Arc::new(Self {
                markers: Mutex::new(markers.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl PageDriver for ScriptedDriver {
        async fn navigate(&self, _url: &str) -> Result<(), SentinelError> {
            Ok(())
        }
        async fn read_marker(&self) -> Result<PageMarker, SentinelError> {
            let mut q = self.markers.lock().unwrap();
            q.pop_front()
                .ok_or_else(|| SentinelError::Driver("marker script exhausted".into()))
        }
        async fn fill(&self, field: &str, value: &str) -> Result<(), SentinelError> {
            self.fills
                .lock()
                .unwrap()
                .push((field.to_string(), value.to_string()));
            Ok(())
        }
        async fn click(&self, element: &str) -> Result<(), SentinelError> {
            self.clicks.lock().unwrap().push(element.to_string());
            Ok(())
        }
        async fn capture_region(&self, _selector: &str) -> Result<Vec<u8>, SentinelError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }
        async fn fetch_calendar(&self) -> Result<String, SentinelError> {
            Ok(r#"{"ScheduleDays": []}"#.into())
        }
    }

    struct FixedSolver(Result<&'static str, ()>);

    #[async_trait]
    impl CaptchaSolver for FixedSolver {
        async fn solve(&self, _image: &[u8]) -> Result<String, SentinelError> {
            match self.0 {
                Ok(s) => Ok(s.to_string()),
                Err(()) => Err(SentinelError::SolverUnavailable("down".into())),
            }
        }
    }

    fn machine(
        driver: Arc<ScriptedDriver>,
        solver: Arc<dyn CaptchaSolver>,
    ) -> (SessionMachine, SessionHandle) {
        let credential = Credential {
            username: "traveler".into(),
            password: "s3cret".into(),
            security_questions: vec![crate::core::types::SecurityQuestion {
                question: "What city were you born in?".into(),
                answer: "Lima".into(),
            }],
        };
        let (_tx, rx) = watch::channel(false);
        let m = SessionMachine::new(
            driver,
            solver,
            credential,
            SessionConfig {
                waiting_room_max: Duration::from_millis(10),
                ..SessionConfig::default()
            },
            rx,
        );
        let h = SessionHandle::new(PathBuf::from("/tmp/profile"));
        (m, h)
    }

    #[tokio::test]
    async fn valid_persisted_session_skips_login_entirely() {
        let driver = ScriptedDriver::with_markers(vec![PageMarker::Authenticated]);
        let (m, mut h) = machine(driver.clone(), Arc::new(FixedSolver(Ok("ABCDE"))));
        m.ensure_authenticated(&mut h).await.unwrap();
        assert!(h.is_authenticated());
        assert!(h.last_auth.is_some());
        assert!(driver.fills.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_login_flow_reaches_authenticated() {
        let driver = ScriptedDriver::with_markers(vec![
            PageMarker::LoginForm,
            PageMarker::SecurityQuestion {
                question: "Q1: What city were you born in?".into(),
                field: "#kba1_response".into(),
            },
            PageMarker::Authenticated,
        ]);
        let (m, mut h) = machine(driver.clone(), Arc::new(FixedSolver(Ok("ABCDE"))));
        m.ensure_authenticated(&mut h).await.unwrap();
        assert!(h.is_authenticated());

        let fills = driver.fills.lock().unwrap();
        assert!(fills.contains(&(SIGN_IN_FIELD.into(), "traveler".into())));
        assert!(fills.contains(&(PASSWORD_FIELD.into(), "s3cret".into())));
        assert!(fills.contains(&("#kba1_response".into(), "Lima".into())));
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal_and_not_retried() {
        let driver = ScriptedDriver::with_markers(vec![
            PageMarker::LoginForm,
            PageMarker::InvalidCredentials,
        ]);
        let (m, mut h) = machine(driver.clone(), Arc::new(FixedSolver(Ok("ABCDE"))));
        let err = m.ensure_authenticated(&mut h).await.unwrap_err();
        assert!(matches!(err, SentinelError::Auth));
        assert_eq!(h.state, LoginState::LoggedOut);
        // Exactly one credential submission.
        assert_eq!(
            driver
                .clicks
                .lock()
                .unwrap()
                .iter()
                .filter(|c| *c == CONTINUE_BUTTON)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn unknown_security_question_is_fatal() {
        let driver = ScriptedDriver::with_markers(vec![PageMarker::SecurityQuestion {
            question: "Name of your first pet?".into(),
            field: "#kba1_response".into(),
        }]);
        let (m, mut h) = machine(driver, Arc::new(FixedSolver(Ok("ABCDE"))));
        let err = m.ensure_authenticated(&mut h).await.unwrap_err();
        match err {
            SentinelError::UnknownSecurityQuestion(q) => {
                assert_eq!(q, "Name of your first pet?")
            }
            other => panic!("expected UnknownSecurityQuestion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn captcha_exhaustion_after_exact_bound_resets_to_logged_out() {
        // Solver always errors, so no guess is ever submitted: each attempt
        // captures once and burns one of the five tries.
        let driver = ScriptedDriver::with_markers(vec![PageMarker::Captcha]);
        let (m, mut h) = machine(driver.clone(), Arc::new(FixedSolver(Err(()))));
        let err = m.ensure_authenticated(&mut h).await.unwrap_err();
        assert!(matches!(err, SentinelError::CaptchaExhausted(5)));
        assert_eq!(h.state, LoginState::LoggedOut);
        assert_eq!(driver.captures.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn rejected_captcha_guesses_retry_with_fresh_images_then_exhaust() {
        // One initial Captcha marker + five post-submit re-reads that all
        // still show the captcha.
        let driver = ScriptedDriver::with_markers(vec![PageMarker::Captcha; 6]);
        let (m, mut h) = machine(driver.clone(), Arc::new(FixedSolver(Ok("WRONG"))));
        let err = m.ensure_authenticated(&mut h).await.unwrap_err();
        assert!(matches!(err, SentinelError::CaptchaExhausted(5)));
        assert_eq!(driver.captures.load(Ordering::SeqCst), 5);
        assert_eq!(
            driver
                .fills
                .lock()
                .unwrap()
                .iter()
                .filter(|(f, _)| f == CAPTCHA_RESPONSE_FIELD)
                .count(),
            5
        );
    }

    #[tokio::test]
    async fn captcha_accepted_mid_flow_continues_to_authenticated() {
        let driver = ScriptedDriver::with_markers(vec![
            PageMarker::Captcha,
            PageMarker::Authenticated, // post-submit re-read: moved on
            PageMarker::Authenticated, // outer loop settles
        ]);
        let (m, mut h) = machine(driver, Arc::new(FixedSolver(Ok("XJ4QJ"))));
        m.ensure_authenticated(&mut h).await.unwrap();
        assert!(h.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_room_sleeps_then_rechecks() {
        let driver = ScriptedDriver::with_markers(vec![
            PageMarker::WaitingRoom {
                estimate: Some(Duration::from_millis(5)),
            },
            PageMarker::WaitingRoom { estimate: None },
            PageMarker::Authenticated,
        ]);
        let (m, mut h) = machine(driver, Arc::new(FixedSolver(Ok("ABCDE"))));
        m.ensure_authenticated(&mut h).await.unwrap();
        assert!(h.is_authenticated());
    }

    #[tokio::test]
    async fn stuck_flow_exhausts_step_budget_as_transient() {
        let driver =
            ScriptedDriver::with_markers(vec![PageMarker::LoginForm; 64]);
        let (m, mut h) = machine(driver, Arc::new(FixedSolver(Ok("ABCDE"))));
        let err = m.ensure_authenticated(&mut h).await.unwrap_err();
        assert!(matches!(err, SentinelError::Driver(_)));
        assert!(!err.is_fatal());
        assert_eq!(h.state, LoginState::LoggedOut);
    }
}
