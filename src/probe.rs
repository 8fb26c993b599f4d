use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Stand-in deadline for timeouts too large to add to an Instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);


/// A single availability check. A failed check is a normal `false`, never an error.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn check(&self) -> bool;
}


/// GET `http://<host>:<port>/`; only a 200 counts as available.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(host: &str, port: u16, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            url: format!("http://{host}:{port}/"),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                debug!(url = %self.url, "health check succeeded");
                true
            }
            Ok(resp) => {
                debug!(url = %self.url, status = resp.status().as_u16(), "health check returned non-200");
                false
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "health check failed");
                false
            }
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
    Cancelled,
}


pub struct ReadinessProber {
    probe: Arc<dyn Probe>,
    retry_delay: Duration,
    monitor: Mutex<Option<CancellationToken>>,
}

impl ReadinessProber {
    pub fn new(probe: Arc<dyn Probe>, retry_delay: Duration) -> Self {
        Self {
            probe,
            retry_delay,
            monitor: Mutex::new(None),
        }
    }

    pub async fn check_once(&self) -> bool {
        self.probe.check().await
    }



    /*
        @@@
        @wait_until_ready();
        . Probes, then sleeps `retry_delay`, until a probe succeeds or `timeout` has fully elapsed.
        . An in-flight probe is cut off at the deadline, and the last sleep is shortened to end on it.
        . TimedOut is only ever returned once the deadline has passed.
        . Cancelling the token wins over whatever the probe is doing at that moment.
        . A timeout too large for the clock means waiting without a deadline.
    */
    pub async fn wait_until_ready(&self, timeout: Duration, cancel: &CancellationToken) -> Readiness {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Readiness::Cancelled,
                outcome = timeout_at(deadline, self.probe.check()) => outcome,
            };

            match outcome {
                Ok(true) => {
                    return Readiness::Ready { attempts, elapsed: started.elapsed() };
                }
                Ok(false) => {}
                Err(_) => {
                    return Readiness::TimedOut { attempts, elapsed: started.elapsed() };
                }
            }

            let next = Instant::now()
                .checked_add(self.retry_delay)
                .map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = sleep_until(next) => {}
            }

            if Instant::now() >= deadline {
                return Readiness::TimedOut { attempts, elapsed: started.elapsed() };
            }
        }
    }



    /*
        @@@
        @start_monitoring();
        . Spawns the periodic probe loop: sleep `interval`, probe, repeat.
        . `failure_threshold` consecutive failures fire `on_degraded` once and end the loop.
        . A success resets the failure count.
        . Returns false (and spawns nothing) if a loop is already running.
    */
    pub fn start_monitoring<F>(&self, interval: Duration, failure_threshold: u32, on_degraded: F) -> bool
    where
        F: FnOnce(u32) + Send + 'static,
    {
        let mut slot = self.lock_monitor();
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            warn!("health monitoring already running");
            return false;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let probe = self.probe.clone();
        let threshold = failure_threshold.max(1);
        let mut on_degraded = Some(on_degraded);

        let task = async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                let healthy = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    healthy = probe.check() => healthy,
                };

                if healthy {
                    failures = 0;
                    continue;
                }

                failures += 1;
                warn!(failures, threshold, "periodic health check failed");
                if failures >= threshold {
                    token.cancel();
                    if let Some(callback) = on_degraded.take() {
                        callback(failures);
                    }
                    break;
                }
            }
            debug!("health monitoring loop ended");
        };
        tokio::spawn(task.instrument(info_span!("health-monitor")));
        info!(interval_ms = interval.as_millis() as u64, threshold, "started health monitoring");
        true
    }

    /// Returns true if a running loop was told to stop.
    pub fn stop_monitoring(&self) -> bool {
        match self.lock_monitor().take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                info!("stopped health monitoring");
                true
            }
            _ => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_monitor().as_ref().is_some_and(|t| !t.is_cancelled())
    }

    fn lock_monitor(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReadinessProber {
    fn drop(&mut self) {
        if let Some(token) = self.lock_monitor().take() {
            token.cancel();
        }
    }
}
