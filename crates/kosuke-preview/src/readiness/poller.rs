//! Readiness poller and heartbeat.
//!
//! One [`PreviewWatcher`] runs one task for one (consumer, session) pair. The
//! task walks `loading -> ready | error`, publishing every step on a watch
//! channel, and keeps pinging the health endpoint while `ready`. The
//! heartbeat ends when the server reports the session gone. Cancelling (or
//! dropping) the watcher drops the task's future, so no request is issued
//! afterwards. Each task only publishes while its own token is live, so a
//! task still finishing on another worker cannot overwrite a `retry`.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{PreviewApi, PreviewProbe};
use super::error::ReadinessError;
use crate::preview::{PreviewStatus, SessionKey};

/// Poller timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Wait after a start request before re-checking status.
    pub settle_delay: Duration,
    /// Wait before the first health attempt.
    pub initial_grace: Duration,
    /// Delay after each of the first `fast_attempts` attempts.
    pub fast_delay: Duration,
    pub fast_attempts: u32,
    /// Delay after every later attempt.
    pub slow_delay: Duration,
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Highest progress shown before a success is observed.
    pub progress_cap: u8,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            initial_grace: Duration::from_secs(5),
            fast_delay: Duration::from_secs(1),
            fast_attempts: 5,
            slow_delay: Duration::from_secs(3),
            max_attempts: 30,
            heartbeat_interval: Duration::from_secs(30),
            progress_cap: 95,
        }
    }
}

impl PollerConfig {
    /// Delay after attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt <= self.fast_attempts {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }

    /// Progress after `attempts` unsuccessful attempts, never above the cap.
    pub fn progress(&self, attempts: u32) -> u8 {
        if self.max_attempts == 0 {
            return 0;
        }
        let pct = (u64::from(attempts) * 100 / u64::from(self.max_attempts)).min(100) as u8;
        pct.min(self.progress_cap.min(99))
    }
}

/// Snapshot published by a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewState {
    pub phase: PreviewStatus,
    pub url: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// 0..=100; only 100 once ready.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreviewState {
    fn loading(max_attempts: u32) -> Self {
        Self {
            phase: PreviewStatus::Loading,
            url: None,
            attempts: 0,
            max_attempts,
            progress: 0,
            error: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.phase != PreviewStatus::Loading
    }
}

/// Cancellable readiness task for one session.
pub struct PreviewWatcher {
    api: Arc<dyn PreviewApi>,
    key: SessionKey,
    config: PollerConfig,
    state: Arc<watch::Sender<PreviewState>>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PreviewWatcher {
    /// Start watching a session.
    pub fn spawn(api: Arc<dyn PreviewApi>, key: SessionKey, config: PollerConfig) -> Self {
        let (state, _) = watch::channel(PreviewState::loading(config.max_attempts));
        let mut watcher = Self {
            api,
            key,
            config,
            state: Arc::new(state),
            token: CancellationToken::new(),
            handle: None,
        };
        watcher.start_task();
        watcher
    }

    fn start_task(&mut self) {
        let token = self.token.clone();
        let task = PollTask {
            api: self.api.clone(),
            key: self.key.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            token: token.clone(),
        };
        let key = self.key.clone();

        self.handle = Some(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(session = %key, "readiness task cancelled");
                }
                _ = task.run() => {}
            }
        }));
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> PreviewState {
        self.state.borrow().clone()
    }

    /// Receiver that sees every published state, including after `retry`.
    pub fn subscribe(&self) -> watch::Receiver<PreviewState> {
        self.state.subscribe()
    }

    /// Wait until the watcher leaves `loading`.
    pub async fn settled(&self) -> PreviewState {
        let mut rx = self.subscribe();
        match rx.wait_for(PreviewState::is_settled).await {
            Ok(state) => (*state).clone(),
            Err(_) => self.state(),
        }
    }

    /// Stop the task. The last published state stays readable.
    pub fn cancel(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Restart the whole state machine from `loading`.
    pub fn retry(&mut self) {
        self.cancel();
        self.token = CancellationToken::new();
        self.state
            .send_replace(PreviewState::loading(self.config.max_attempts));
        info!(session = %self.key, "retrying preview readiness");
        self.start_task();
    }
}

impl Drop for PreviewWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct PollTask {
    api: Arc<dyn PreviewApi>,
    key: SessionKey,
    config: PollerConfig,
    state: Arc<watch::Sender<PreviewState>>,
    /// Token of the generation this task belongs to.
    token: CancellationToken,
}

impl PollTask {
    async fn run(self) {
        match self.become_ready().await {
            Ok(()) => self.heartbeat().await,
            Err(e) => {
                warn!(session = %self.key, error = %e, "preview failed to become ready");
                self.fail(e.to_string());
            }
        }
    }

    /// Apply `update` unless this task's generation was cancelled. The check
    /// runs under the channel lock, which `retry` also takes for its reset.
    fn publish(&self, update: impl FnOnce(&mut PreviewState)) {
        self.state.send_if_modified(|s| {
            if self.token.is_cancelled() {
                return false;
            }
            update(s);
            true
        });
    }

    fn fail(&self, error: String) {
        self.publish(|s| {
            s.phase = PreviewStatus::Error;
            s.error = Some(error);
        });
    }

    fn set_url(&self, url: Option<&str>) {
        if let Some(url) = url {
            self.publish(|s| s.url = Some(url.to_string()));
        }
    }

    fn mark_ready(&self) {
        info!(session = %self.key, "preview ready");
        self.publish(|s| {
            s.phase = PreviewStatus::Ready;
            s.progress = 100;
            s.error = None;
        });
    }

    async fn become_ready(&self) -> Result<(), ReadinessError> {
        match self.api.status(&self.key).await? {
            PreviewProbe::Found(body) => {
                self.set_url(body.address());
                if body.is_responding {
                    self.mark_ready();
                    return Ok(());
                }
            }
            PreviewProbe::NotStarted(code) => {
                debug!(session = %self.key, code, "preview not started, requesting start");
                let started = self.api.start(&self.key).await?;
                self.set_url(started.address());

                tokio::time::sleep(self.config.settle_delay).await;

                match self.api.status(&self.key).await {
                    Ok(PreviewProbe::Found(body)) => {
                        self.set_url(body.address());
                        if body.is_responding {
                            self.mark_ready();
                            return Ok(());
                        }
                    }
                    Ok(PreviewProbe::NotStarted(code)) => {
                        return Err(ReadinessError::StartFailed(format!(
                            "preview still not started (status {})",
                            code
                        )));
                    }
                    Err(e) => return Err(ReadinessError::StartFailed(e.to_string())),
                }
            }
        }

        self.poll_health().await
    }

    async fn poll_health(&self) -> Result<(), ReadinessError> {
        let max = self.config.max_attempts;
        tokio::time::sleep(self.config.initial_grace).await;

        for attempt in 1..=max {
            let healthy = match self.api.health(&self.key).await {
                Ok(body) => body.ok,
                Err(e) => {
                    debug!(session = %self.key, attempt, error = %e, "health check failed");
                    false
                }
            };

            if healthy {
                self.publish(|s| s.attempts = attempt);
                self.mark_ready();
                return Ok(());
            }

            let progress = self.config.progress(attempt);
            self.publish(|s| {
                s.attempts = attempt;
                s.progress = progress;
            });

            if attempt < max {
                tokio::time::sleep(self.config.delay_after(attempt)).await;
            }
        }

        Err(ReadinessError::Timeout { attempts: max })
    }

    async fn heartbeat(&self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.api.health(&self.key).await {
                Ok(_) => {}
                Err(e @ ReadinessError::SessionGone(_)) => {
                    info!(session = %self.key, "preview torn down, stopping heartbeat");
                    self.fail(e.to_string());
                    return;
                }
                Err(e) => {
                    debug!(session = %self.key, error = %e, "heartbeat failed");
                }
            }
        }
    }
}
