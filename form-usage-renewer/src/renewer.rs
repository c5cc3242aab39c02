use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::{
    config::RenewerConfig,
    errors::{FetchError, PassError, RecordError, SubmitError},
    period::{due_window, millis_to_add, Clock, SystemClock},
    stats::{RecordOutcome, RenewalStats, Statistics},
    store::{CarryOverRecord, CarryOverStore, RecordState, ScanOptions},
    token::{bearer, TokenProvider},
    transport::{CollectorResponse, RequestOptions, Transport, FETCH_USAGE_PATH, SUBMIT_USAGE_PATH},
    usage::{renewal_payload, UsageDoc},
};

/// Completion callbacks of one renewal pass.
///
/// `failure` is called once per failing record with the error and, when the
/// collector answered, its response. `success` is called once after every
/// record of every page has settled.
pub struct Callbacks<S, F> {
    pub success: S,
    pub failure: F,
}

impl<S, F> Callbacks<S, F>
where
    S: FnOnce(&RenewalStats) + Send,
    F: Fn(&RecordError, Option<&CollectorResponse>) + Send + Sync,
{
    pub fn new(success: S, failure: F) -> Self {
        Self { success, failure }
    }
}

struct RecordFailure {
    error: RecordError,
    response: Option<CollectorResponse>,
}

impl RecordFailure {
    fn new(error: impl Into<RecordError>, response: Option<CollectorResponse>) -> Self {
        Self {
            error: error.into(),
            response,
        }
    }
}

enum Submission {
    Accepted(CollectorResponse),
    Conflict,
}

struct Schedule {
    stop: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Marks the renewer idle again when a pass ends, however it ends
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodically resubmits the last known usage of every tracked resource so
/// it stays inside the aggregator's retention window across period boundaries
#[derive(Clone)]
pub struct Renewer {
    config: Arc<RenewerConfig>,
    store: Arc<dyn CarryOverStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
    last_stats: Arc<RwLock<Option<RenewalStats>>>,
    schedule: Arc<Mutex<Option<Schedule>>>,
}

impl Renewer {
    pub fn new(
        config: RenewerConfig,
        store: Arc<dyn CarryOverStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            transport,
            clock: Arc::new(SystemClock),
            running: Arc::new(AtomicBool::new(false)),
            last_stats: Arc::new(RwLock::new(None)),
            schedule: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RenewerConfig {
        &self.config
    }

    /// Whether a pass is in flight
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether recurring passes are scheduled
    pub fn is_scheduled(&self) -> bool {
        self.schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Statistics of the last completed pass
    pub async fn last_statistics(&self) -> Option<RenewalStats> {
        *self.last_stats.read().await
    }

    /// Runs one renewal pass over every carry-over record due for renewal.
    ///
    /// Record failures are reported through `callbacks.failure` and never end
    /// the pass. A store scan failure ends it with [`PassError::Scan`], in
    /// which case `callbacks.success` is not called.
    pub async fn renew_usage<S, F>(
        &self,
        token: &dyn TokenProvider,
        callbacks: Callbacks<S, F>,
    ) -> Result<RenewalStats, PassError>
    where
        S: FnOnce(&RenewalStats) + Send,
        F: Fn(&RecordError, Option<&CollectorResponse>) + Send + Sync,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Renewal pass requested while another one is running");
            return Err(PassError::AlreadyRunning);
        }
        let guard = RunningGuard(self.running.clone());

        let Callbacks { success, failure } = callbacks;
        let stats = match self.run_pass(token, &failure).await {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("Renewal pass aborted: {e}");
                return Err(e);
            }
        };

        *self.last_stats.write().await = Some(stats);
        drop(guard);

        log::info!(
            "Renewal pass completed: {} renewed, {} conflicts, {} not supported, {} skipped, {} failed",
            stats.success.all,
            stats.success.conflicts,
            stats.success.notsupported,
            stats.success.skips,
            stats.failures
        );
        success(&stats);

        Ok(stats)
    }

    async fn run_pass<F>(&self, token: &dyn TokenProvider, failure: &F) -> Result<RenewalStats, PassError>
    where
        F: Fn(&RecordError, Option<&CollectorResponse>) + Send + Sync,
    {
        let now = self.clock.now();
        let authorization = if self.config.secured {
            Some(bearer(&token.token()))
        } else {
            None
        };

        let (from, to) = due_window(now, &self.config.slack);
        let options = ScanOptions {
            from,
            to,
            page_size: self.config.page_size,
        };
        let policy = self.transport.policy();
        let stats = Statistics::default();

        log::info!("Starting renewal pass for carry-over records in [{from}, {to})");

        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = self
                .store
                .read_page(&options, cursor.as_deref())
                .await
                .map_err(PassError::Scan)?;
            pages += 1;
            log::debug!("Renewing page {pages} with {} carry-over records", page.records.len());

            for batch in page.records.chunks(policy.max_batch.max(1)) {
                stream::iter(batch)
                    .for_each_concurrent(policy.max_calls.max(1), |record| {
                        let authorization = authorization.as_deref();
                        let stats = &stats;
                        async move {
                            match self.renew_record(record, now, authorization).await {
                                Ok(outcome) => stats.record(outcome),
                                Err(RecordFailure { error, response }) => {
                                    stats.record_failure();
                                    log::warn!("Failed to renew carry-over record {}: {error}", record.id);
                                    failure(&error, response.as_ref());
                                }
                            }
                        }
                    })
                    .await;
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(stats.snapshot())
    }

    /// fetch, transform, submit, persist
    async fn renew_record(
        &self,
        record: &CarryOverRecord,
        now: DateTime<Utc>,
        authorization: Option<&str>,
    ) -> Result<RecordOutcome, RecordFailure> {
        if record.state != RecordState::Started {
            log::debug!("Skipping carry-over record {} in state {:?}", record.id, record.state);
            return Ok(RecordOutcome::Skipped);
        }

        let usage = self.fetch_usage(record, now, authorization).await?;
        if !usage.supports_carry_over() {
            log::debug!("Resource {} has no carry-over measures", usage.resource_id);
            return Ok(RecordOutcome::NotSupported);
        }

        let payload = renewal_payload(&usage, millis_to_add(&usage, now));

        let response = match self.submit_usage(&payload, authorization).await? {
            Submission::Accepted(response) => response,
            Submission::Conflict => {
                log::debug!("Usage of {} already renewed", record.id);
                return Ok(RecordOutcome::Conflict);
            }
        };

        if let Err(e) = self
            .store
            .insert(&payload, &response, &record.guid, record.state)
            .await
        {
            return Err(RecordFailure::new(e, Some(response)));
        }

        Ok(RecordOutcome::Renewed)
    }

    async fn fetch_usage(
        &self,
        record: &CarryOverRecord,
        now: DateTime<Utc>,
        authorization: Option<&str>,
    ) -> Result<UsageDoc, RecordFailure> {
        let key = &record.key;
        let options = RequestOptions::new()
            .param("organization_id", &key.organization_id)
            .param("space_id", &key.space_id)
            .param("consumer_id", &key.consumer_id)
            .param("resource_id", &key.resource_id)
            .param("resource_instance_id", &key.resource_instance_id)
            .param("end", now.timestamp_millis().to_string())
            .authorization(authorization.map(String::from));

        let response = self
            .transport
            .get(FETCH_USAGE_PATH, &options)
            .await
            .map_err(|e| RecordFailure::new(FetchError::Transport(e), None))?;

        if !response.is_success() {
            return Err(RecordFailure::new(FetchError::Status(response.status), Some(response)));
        }

        serde_json::from_value(response.body.clone())
            .map_err(|e| RecordFailure::new(FetchError::InvalidBody(e), Some(response)))
    }

    async fn submit_usage(
        &self,
        payload: &UsageDoc,
        authorization: Option<&str>,
    ) -> Result<Submission, RecordFailure> {
        let body = serde_json::to_value(payload)
            .map_err(|e| RecordFailure::new(SubmitError::Serialization(e), None))?;
        let options = RequestOptions::new()
            .authorization(authorization.map(String::from))
            .body(body);

        let response = self
            .transport
            .post(SUBMIT_USAGE_PATH, &options)
            .await
            .map_err(|e| RecordFailure::new(SubmitError::Transport(e), None))?;

        match response.status {
            202 if response.location().is_some() => Ok(Submission::Accepted(response)),
            202 => Err(RecordFailure::new(SubmitError::MissingLocation, Some(response))),
            409 => Ok(Submission::Conflict),
            status => Err(RecordFailure::new(SubmitError::Status(status), Some(response))),
        }
    }

    /// Runs a pass every configured interval, the first one right away.
    /// Does nothing when passes are already scheduled.
    pub fn start_renewer(&self, token: Arc<dyn TokenProvider>) {
        let mut schedule = self.schedule.lock().unwrap_or_else(PoisonError::into_inner);
        if schedule.is_some() {
            log::debug!("Renewer already scheduled");
            return;
        }

        let (stop, mut stop_rx) = broadcast::channel(1);
        let mut ticker = interval(self.config.interval());
        // a pass outlasting the interval pushes later ticks back
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let renewer = self.clone();

        log::info!("Scheduling renewal passes every {:?}", self.config.interval());
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {}
                }

                let callbacks = Callbacks::new(
                    |_: &RenewalStats| {},
                    |error: &RecordError, response: Option<&CollectorResponse>| {
                        log::error!(
                            "Carry-over renewal failed: {error} (status {:?})",
                            response.map(|r| r.status)
                        );
                    },
                );
                if let Err(e) = renewer.renew_usage(token.as_ref(), callbacks).await {
                    log::error!("Scheduled renewal pass failed: {e}");
                }
            }
            log::debug!("Renewal schedule stopped");
        });

        *schedule = Some(Schedule { stop, handle });
    }

    /// Cancels scheduled passes. A pass already in flight runs to completion.
    pub fn stop_renewer(&self) {
        let schedule = self
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Schedule { stop, handle }) = schedule {
            // the task may already be gone if it panicked
            let _ = stop.send(());
            drop(handle);
            log::info!("Renewer stopped");
        }
    }
}
