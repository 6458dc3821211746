use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

use slot_sentinel::browser::driver::CdpDriver;
use slot_sentinel::captcha::VisionSolver;
use slot_sentinel::{
    browser, config, Dispatcher, Orchestrator, PollPacer, SentinelError, SessionConfig,
    SessionHandle, SessionMachine, SlotPoller,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            e.downcast_ref::<SentinelError>()
                .map(SentinelError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    info!("starting slot-sentinel v{}", env!("CARGO_PKG_VERSION"));

    let credentials = config::load_credentials()?;
    let cfg = config::load_config()?;
    let criteria = cfg.filter.clone().into_criteria();
    info!(
        "watching for slots from {} to {}",
        criteria.earliest,
        criteria
            .latest
            .map(|d| d.to_string())
            .unwrap_or_else(|| "open-ended".into())
    );

    let appointment_url = cfg.tuning.resolve_appointment_url();
    let portal_host = Url::parse(&appointment_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .ok_or_else(|| anyhow!("appointment_url is not a valid URL: {appointment_url}"))?;

    // Persistent profile: a still-valid session cookie lets the first probe
    // land directly on Authenticated.
    let profile_dir = config::profile_dir();
    let exe = browser::find_chrome_executable().ok_or_else(|| {
        anyhow!("no Chromium-family browser found; install Chrome/Chromium or set CHROME_EXECUTABLE")
    })?;
    info!(
        "launching {} with profile {}",
        exe,
        profile_dir.display()
    );
    let (mut browser, handler_task) =
        browser::launch_session(&exe, &profile_dir, cfg.tuning.resolve_headless()).await?;
    let page = browser
        .new_page("about:blank")
        .await
        .context("could not open browser tab")?;

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;

    let driver = Arc::new(CdpDriver::new(page, portal_host));
    let solver = Arc::new(VisionSolver::new(http_client.clone(), &cfg.solver));

    let bot_token = credentials
        .resolve_bot_token()
        .ok_or_else(|| anyhow!("telegram_bot_token missing from credential.json and env"))?;
    let chat_id = credentials
        .resolve_chat_id()
        .ok_or_else(|| anyhow!("telegram_chat_id missing from credential.json and env"))?;
    let notifier = Arc::new(slot_sentinel::notify::TelegramNotifier::new(
        http_client,
        &bot_token,
        chat_id,
    )?);

    // Shutdown flag flipped by ctrl-c / SIGTERM, observed only at loop
    // boundaries and waiting-room re-checks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let session_cfg = SessionConfig {
        appointment_url,
        captcha_max_attempts: cfg.tuning.resolve_captcha_max_attempts(),
        waiting_room_max: cfg.tuning.resolve_waiting_room_max(),
        ..SessionConfig::default()
    };
    let machine = SessionMachine::new(
        driver.clone(),
        solver,
        credentials.credential.clone(),
        session_cfg,
        shutdown_rx.clone(),
    );
    let poller = SlotPoller::new(driver);
    let dispatcher = Dispatcher::new(notifier);
    let pacer = PollPacer::new(
        cfg.tuning.resolve_base_poll(),
        cfg.tuning.resolve_max_poll(),
    );
    let handle = SessionHandle::new(profile_dir);

    let mut orchestrator = Orchestrator::new(
        machine,
        poller,
        dispatcher,
        criteria,
        pacer,
        handle,
        cfg.tuning.resolve_expiry_escalation(),
        shutdown_rx,
    );
    let result = orchestrator.run().await;

    if let Err(e) = browser.close().await {
        warn!("browser close error (non-fatal): {e}");
    }
    handler_task.abort();

    result.map_err(Into::into)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
