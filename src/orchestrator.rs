//! The top-level watch loop: ensure authenticated → poll → filter →
//! dispatch → adaptive sleep → repeat, until a fatal error or shutdown.
//!
//! All error classification funnels here. Transient failures back the poll
//! interval off geometrically; session expiry forces re-authentication and
//! escalates only when it keeps recurring; fatal errors announce themselves
//! and stop the loop.

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::core::types::FilterCriteria;
use crate::core::{ErrorKind, SentinelError};
use crate::notify::Dispatcher;
use crate::pacing::PollPacer;
use crate::poll::{filter_slots, SlotPoller};
use crate::session::{SessionHandle, SessionMachine};

pub struct Orchestrator {
    machine: SessionMachine,
    poller: SlotPoller,
    dispatcher: Dispatcher,
    criteria: FilterCriteria,
    pacer: PollPacer,
    handle: SessionHandle,
    /// Consecutive session expiries tolerated before escalating to fatal.
    expiry_escalation: u32,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: SessionMachine,
        poller: SlotPoller,
        dispatcher: Dispatcher,
        criteria: FilterCriteria,
        pacer: PollPacer,
        handle: SessionHandle,
        expiry_escalation: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            machine,
            poller,
            dispatcher,
            criteria,
            pacer,
            handle,
            expiry_escalation,
            shutdown,
        }
    }

    /// Run until fatal error or operator shutdown. `Ok(())` means graceful
    /// shutdown; `Err` carries the fatal error for the exit code.
    pub async fn run(&mut self) -> Result<(), SentinelError> {
        loop {
            if *self.shutdown.borrow() {
                info!("shutdown requested, stopping");
                return Ok(());
            }

            match self.cycle().await {
                Ok(alerts) => {
                    self.pacer.record_success();
                    if alerts > 0 {
                        info!("cycle complete: {alerts} new alert(s)");
                    }
                }
                Err(SentinelError::Interrupted) => {
                    info!("shutdown requested mid-wait, stopping");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!("fatal: {e}");
                    self.dispatcher.announce_fatal(&e).await;
                    return Err(e);
                }
                Err(e) => match e.kind() {
                    ErrorKind::SessionExpiry => {
                        self.handle.expiry_events = self.handle.expiry_events.saturating_add(1);
                        warn!(
                            "session expired mid-flight ({}/{})",
                            self.handle.expiry_events, self.expiry_escalation
                        );
                        if self.handle.expiry_events >= self.expiry_escalation {
                            let fatal = SentinelError::Auth;
                            error!(
                                "session expired {} consecutive times — treating as credential/lockout problem",
                                self.handle.expiry_events
                            );
                            self.dispatcher.announce_fatal(&fatal).await;
                            return Err(fatal);
                        }
                        self.handle.expire();
                        // Re-auth is routine recovery, not a failure to back
                        // off from.
                    }
                    _ => {
                        self.handle.consecutive_failures =
                            self.handle.consecutive_failures.saturating_add(1);
                        self.pacer.record_failure();
                        warn!(
                            "transient failure (backoff now {}s): {e}",
                            self.pacer.current_interval().as_secs()
                        );
                    }
                },
            }

            let delay = self.pacer.jittered_interval();
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One full pass. Returns the number of fresh alerts dispatched.
    async fn cycle(&mut self) -> Result<usize, SentinelError> {
        self.machine.ensure_authenticated(&mut self.handle).await?;

        let slots = match self.poller.poll(&self.handle).await {
            Ok(slots) => slots,
            Err(e) => {
                if matches!(e, SentinelError::SessionExpired) {
                    self.handle.expire();
                }
                return Err(e);
            }
        };

        let matches = filter_slots(&slots, &self.criteria);
        if !matches.is_empty() {
            info!("{} slot(s) match the criteria", matches.len());
        }
        let sent = self.dispatcher.dispatch(&matches).await;

        // A completed authenticated poll clears the expiry streak.
        self.handle.expiry_events = 0;
        Ok(sent)
    }
}
