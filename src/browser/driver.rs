//! The page-driver seam between the session state machine and the real
//! browser.
//!
//! [`PageDriver`] is the only surface the core logic sees; [`CdpDriver`] is
//! the chromiumoxide implementation. Tests substitute scripted drivers.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::SentinelError;

// Portal element ids. The login pages are Azure B2C; the ids are stable
// across deployments.
pub const SIGN_IN_FIELD: &str = "#signInName";
pub const PASSWORD_FIELD: &str = "#password";
pub const CONTINUE_BUTTON: &str = "#continue";
pub const CAPTCHA_IMAGE: &str = "#captchaImage";
pub const CAPTCHA_RESPONSE_FIELD: &str = "#extension_atlasCaptchaResponse";

/// Availability endpoint polled once authenticated.
pub const CALENDAR_PATH: &str =
    "/custom-actions/?route=/api/v1/schedule-group/get-family-consular-schedule-days";

/// Background image the waiting-room holding page sets inline on `<body>`.
const WAITING_ROOM_BG: &str = "waiting_room_background_en-US.png";

/// Classified observation of whatever page the portal is currently showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageMarker {
    /// Username/password form is present.
    LoginForm,
    /// The page-level error banner says the credentials were rejected.
    InvalidCredentials,
    /// A security-question input is rendered and still empty.
    SecurityQuestion { question: String, field: String },
    /// Captcha challenge image plus response input are present.
    Captcha,
    /// Anti-load holding page, with the advertised wait when one is shown.
    WaitingRoom { estimate: Option<Duration> },
    /// Back on the scheduling site with no login surface in sight.
    Authenticated,
    /// None of the known markers matched.
    Unknown(String),
}

/// Opaque browser-automation capability consumed by the core.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SentinelError>;
    async fn read_marker(&self) -> Result<PageMarker, SentinelError>;
    async fn fill(&self, field: &str, value: &str) -> Result<(), SentinelError>;
    async fn click(&self, element: &str) -> Result<(), SentinelError>;
    /// Screenshot of a single element, PNG bytes.
    async fn capture_region(&self, selector: &str) -> Result<Vec<u8>, SentinelError>;
    /// Raw body of the schedule-days endpoint, fetched with the page's own
    /// session cookies.
    async fn fetch_calendar(&self) -> Result<String, SentinelError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// CDP implementation
// ─────────────────────────────────────────────────────────────────────────────

/// What the in-page classifier script reports back.
#[derive(Debug, Deserialize)]
struct PageProbe {
    url: String,
    waiting_room: bool,
    wait_estimate: Option<String>,
    page_error: Option<String>,
    kba_question: Option<String>,
    kba_field: Option<String>,
    captcha: bool,
    login_form: bool,
}

pub struct CdpDriver {
    page: Page,
    /// Hostname of the scheduling site proper; being here without a login
    /// surface means the session is live.
    portal_host: String,
}

impl CdpDriver {
    pub fn new(page: Page, portal_host: impl Into<String>) -> Self {
        Self {
            page,
            portal_host: portal_host.into(),
        }
    }

    fn drv(e: impl std::fmt::Display) -> SentinelError {
        SentinelError::Driver(e.to_string())
    }

    /// Evaluate an expression, awaiting any returned promise, and
    /// deserialize the value.
    async fn eval<T: serde::de::DeserializeOwned>(&self, expr: &str) -> Result<T, SentinelError> {
        let params = EvaluateParams::builder()
            .expression(expr)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(Self::drv)?;
        let result = self.page.evaluate(params).await.map_err(Self::drv)?;
        result.into_value::<T>().map_err(Self::drv)
    }

    /// One round-trip that gathers every marker signal; classification
    /// happens in Rust so it stays unit-testable.
    async fn probe(&self) -> Result<PageProbe, SentinelError> {
        const PROBE_JS: &str = r#"
        (() => {
            const style = (document.body && document.body.getAttribute('style')) || '';
            const text = (sel) => {
                const el = document.querySelector(sel);
                const t = el ? (el.textContent || '').trim() : '';
                return t.length ? t : null;
            };
            const has = (sel) => !!document.querySelector(sel);
            let kba_question = null, kba_field = null;
            for (const n of ['1', '2', '3']) {
                const input = document.querySelector('#kba' + n + '_response');
                if (!input || input.value) continue;
                const label = document.querySelector('label[for="kba' + n + '_response"]');
                kba_field = '#kba' + n + '_response';
                kba_question = label ? (label.textContent || '').trim() : '';
                break;
            }
            return JSON.stringify({
                url: location.href,
                waiting_room: style.includes('waiting_room_background_en-US.png'),
                wait_estimate: text('#waitTime') || text('#defaultCountdown'),
                page_error: text('.error.pageLevel'),
                kba_question,
                kba_field,
                captcha: has('#captchaImage') && has('#extension_atlasCaptchaResponse'),
                login_form: has('#signInName') && has('#password'),
            });
        })()
        "#;
        let raw: String = self.eval(PROBE_JS).await?;
        serde_json::from_str(&raw).map_err(Self::drv)
    }
}

/// Decision table turning a raw page probe into a [`PageMarker`]. Order
/// matters: the waiting room overlays everything, and a credential-rejection
/// banner sits on top of the login form it belongs to.
fn classify(portal_host: &str, probe: PageProbe) -> PageMarker {
    if probe.waiting_room {
        return PageMarker::WaitingRoom {
            estimate: probe.wait_estimate.as_deref().and_then(parse_wait_estimate),
        };
    }
    if let Some(err) = &probe.page_error {
        let lower = err.to_lowercase();
        if lower.contains("username or password")
            || lower.contains("invalid")
            || lower.contains("incorrect")
        {
            return PageMarker::InvalidCredentials;
        }
    }
    if let (Some(question), Some(field)) = (probe.kba_question, probe.kba_field) {
        return PageMarker::SecurityQuestion { question, field };
    }
    if probe.captcha {
        return PageMarker::Captcha;
    }
    if probe.login_form || probe.url.contains("b2clogin.com") {
        return PageMarker::LoginForm;
    }
    if probe.url.contains(portal_host) {
        return PageMarker::Authenticated;
    }
    PageMarker::Unknown(probe.url)
}

/// Parse a waiting-room countdown like `"120"`, `"90 seconds"` or `"2 min"`
/// into a duration. Unrecognized text is treated as no estimate.
fn parse_wait_estimate(text: &str) -> Option<Duration> {
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    let n: u64 = digits.parse().ok()?;
    let lower = text.to_lowercase();
    if lower.contains("min") {
        Some(Duration::from_secs(n * 60))
    } else {
        Some(Duration::from_secs(n))
    }
}

#[async_trait]
impl PageDriver for CdpDriver {
    async fn navigate(&self, url: &str) -> Result<(), SentinelError> {
        debug!("navigate: {url}");
        self.page.goto(url).await.map_err(Self::drv)?;
        self.page.wait_for_navigation().await.map_err(Self::drv)?;
        Ok(())
    }

    async fn read_marker(&self) -> Result<PageMarker, SentinelError> {
        let probe = self.probe().await?;
        let marker = classify(&self.portal_host, probe);
        debug!("page marker: {marker:?}");
        Ok(marker)
    }

    async fn fill(&self, field: &str, value: &str) -> Result<(), SentinelError> {
        let el = self.page.find_element(field).await.map_err(Self::drv)?;
        // Clear any prefilled value so repeated submits don't concatenate.
        let clear = format!(
            "(() => {{ const el = document.querySelector('{field}'); if (el) el.value = ''; }})()"
        );
        if let Err(e) = self.eval::<serde_json::Value>(&clear).await {
            warn!("could not clear {field} before fill: {e}");
        }
        el.click().await.map_err(Self::drv)?;
        el.type_str(value).await.map_err(Self::drv)?;
        Ok(())
    }

    async fn click(&self, element: &str) -> Result<(), SentinelError> {
        let el = self.page.find_element(element).await.map_err(Self::drv)?;
        el.click().await.map_err(Self::drv)?;
        Ok(())
    }

    async fn capture_region(&self, selector: &str) -> Result<Vec<u8>, SentinelError> {
        // The challenge image swaps in asynchronously; a gif src is the
        // placeholder, so give it a few beats to become real.
        const LOAD_ATTEMPTS: u32 = 5;
        for attempt in 1..=LOAD_ATTEMPTS {
            let el = self.page.find_element(selector).await.map_err(Self::drv)?;
            let src = el.attribute("src").await.map_err(Self::drv)?;
            match src {
                Some(s) if !s.starts_with("data:image/gif") && !s.is_empty() => {
                    return el
                        .screenshot(CaptureScreenshotFormat::Png)
                        .await
                        .map_err(Self::drv);
                }
                _ => {
                    debug!("{selector} not loaded yet (attempt {attempt}/{LOAD_ATTEMPTS})");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Err(SentinelError::Driver(format!(
            "{selector} never finished loading"
        )))
    }

    async fn fetch_calendar(&self) -> Result<String, SentinelError> {
        let expr = format!(
            r#"
            (async () => {{
                const res = await fetch('{CALENDAR_PATH}', {{ credentials: 'include' }});
                return await res.text();
            }})()
            "#
        );
        self.eval(&expr).await
    }
}
