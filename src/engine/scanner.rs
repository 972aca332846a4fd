//! Village scanner
//!
//! Walks the survey numbers of one village strictly in increasing order from
//! the resume cursor, with no gaps: a failed attempt re-tries the same cursor
//! value, never the next one. A survey that exhausts its transient retries is
//! recorded as skipped and the cursor moves on; only an unusable driver fails
//! the village. Surveys that carry data are expanded into every
//! (sub-parcel x sub-holding x period) combination; the adaptive stopping
//! policy decides when the remaining range is judged empty.

use tracing::{info, warn};

use crate::domain::entities::{LandRecord, SearchSession, SkippedItem};
use crate::domain::ports::{
    PortalAdapter, PortalError, RecordSelector, SurveyListing, VillageRef,
};
use crate::engine::config::{EngineConfig, StoppingMode, StoppingPolicyConfig};
use crate::engine::health::{Recovery, SessionHealthMonitor};
use crate::engine::state::{SharedState, WorkerStatus};
use crate::infrastructure::checkpoint_store::{CheckpointStore, StoreError};

/// How a village scan ended. `Cancelled` leaves the village in progress with
/// its cursor checkpointed.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    Completed { last_survey_no: u32 },
    Failed { last_survey_no: u32, error: String },
    Cancelled { last_survey_no: u32 },
}

enum SurveyOutcome {
    Done { records: u32, matches: u32 },
    Abandoned(String),
}

enum SubmitOutcome {
    Listing(SurveyListing),
    /// Transient retries exhausted on this survey alone; set it aside and
    /// keep the cursor moving.
    Skip(String),
    /// Driver recovery exhausted; the whole village goes down.
    Abort(String),
}

/// Empty-range stop decision. Fixed mode waits out the full threshold;
/// adaptive mode stops early once data has been seen, on either overshoot
/// past the highest survey with data or a proportional empty run.
pub struct StoppingPolicy {
    config: StoppingPolicyConfig,
    empty_run: u32,
    highest_with_data: u32,
    surveys_with_data: u32,
}

impl StoppingPolicy {
    pub fn new(config: StoppingPolicyConfig) -> Self {
        Self {
            config,
            empty_run: 0,
            highest_with_data: 0,
            surveys_with_data: 0,
        }
    }

    pub fn observe_data(&mut self, survey_no: u32) {
        self.empty_run = 0;
        self.highest_with_data = survey_no;
        self.surveys_with_data += 1;
    }

    /// Only true negatives (empty listing over a healthy session) are
    /// observed here; failures never count as empty.
    pub fn observe_empty(&mut self) {
        self.empty_run += 1;
    }

    /// Decide whether scanning `next_survey` is still worthwhile.
    pub fn should_stop(&self, next_survey: u32) -> bool {
        if self.config.mode == StoppingMode::Fixed || self.surveys_with_data == 0 {
            return self.empty_run > self.config.empty_survey_threshold;
        }
        // overshoot only applies once the data run has ended; inside a
        // contiguous run every next survey exceeds the factor trivially
        if self.empty_run > 0
            && f64::from(next_survey)
                > self.config.overshoot_factor * f64::from(self.highest_with_data)
        {
            return true;
        }
        let adaptive_bound = (self.config.adaptive_fraction * f64::from(self.surveys_with_data))
            .ceil()
            .max(f64::from(self.config.adaptive_floor))
            .min(f64::from(self.config.empty_survey_threshold));
        f64::from(self.empty_run) > adaptive_bound
    }
}

pub struct VillageScanner<'a> {
    store: &'a CheckpointStore,
    state: &'a SharedState,
    config: &'a EngineConfig,
    session: &'a SearchSession,
    worker_id: u32,
}

impl<'a> VillageScanner<'a> {
    pub fn new(
        store: &'a CheckpointStore,
        state: &'a SharedState,
        config: &'a EngineConfig,
        session: &'a SearchSession,
        worker_id: u32,
    ) -> Self {
        Self {
            store,
            state,
            config,
            session,
            worker_id,
        }
    }

    /// Scan one village from its resume cursor to the stop point.
    pub async fn scan(
        &self,
        adapter: &mut Box<dyn PortalAdapter>,
        monitor: &mut SessionHealthMonitor,
        village: &VillageRef,
        status: &mut WorkerStatus,
    ) -> Result<ScanResult, StoreError> {
        let session_id = &self.session.session_id;
        let max_survey = self.session.max_survey;
        let resume_from = self
            .store
            .last_completed_survey(session_id, &village.village_code)
            .await?
            .map(|n| n + 1)
            .unwrap_or(1);

        if resume_from > 1 {
            info!(
                worker_id = self.worker_id,
                village = %village.village_name,
                survey = resume_from,
                "resuming village from checkpoint"
            );
        }

        let mut policy = StoppingPolicy::new(self.config.stopping.clone());
        let mut last_done = resume_from.saturating_sub(1);
        let mut pending_records = 0u32;
        let mut pending_matches = 0u32;
        let mut survey = resume_from;

        while survey <= max_survey {
            if self.state.is_cancelled() {
                self.flush_progress(village, last_done, &mut pending_records, &mut pending_matches)
                    .await?;
                return Ok(ScanResult::Cancelled {
                    last_survey_no: last_done,
                });
            }
            if policy.should_stop(survey) {
                break;
            }

            status.current_survey = survey;
            self.state.publish_worker(status.clone());
            self.store
                .mark_task_started(session_id, &village.village_code, survey, self.worker_id, 0)
                .await?;

            let listing = match self.submit_with_recovery(adapter, monitor, village, survey).await
            {
                SubmitOutcome::Listing(listing) => listing,
                SubmitOutcome::Skip(reason) => {
                    // the portal is still healthy, so only this survey is
                    // set aside; the cursor keeps walking
                    self.skip_survey(village, survey, &reason).await?;
                    survey += 1;
                    continue;
                }
                SubmitOutcome::Abort(reason) => {
                    self.store
                        .mark_task_failed(session_id, &village.village_code, survey, &reason)
                        .await?;
                    self.flush_progress(
                        village,
                        last_done,
                        &mut pending_records,
                        &mut pending_matches,
                    )
                    .await?;
                    return Ok(ScanResult::Failed {
                        last_survey_no: last_done,
                        error: reason,
                    });
                }
            };
            let attempts = monitor.attempts();
            monitor.reset_on_success();
            if attempts > 0 {
                self.store
                    .record_task_retries(session_id, &village.village_code, survey, attempts)
                    .await?;
            }

            if listing.has_data() {
                policy.observe_data(survey);
                match self
                    .process_survey(adapter, monitor, village, survey, &listing)
                    .await?
                {
                    SurveyOutcome::Done { records, matches } => {
                        pending_records += records;
                        pending_matches += matches;
                        status.records_found += u64::from(records);
                    }
                    SurveyOutcome::Abandoned(reason) => {
                        self.store
                            .mark_task_failed(session_id, &village.village_code, survey, &reason)
                            .await?;
                        self.flush_progress(
                            village,
                            last_done,
                            &mut pending_records,
                            &mut pending_matches,
                        )
                        .await?;
                        return Ok(ScanResult::Failed {
                            last_survey_no: last_done,
                            error: reason,
                        });
                    }
                }
            } else {
                // empty listing over a healthy session: a true negative
                policy.observe_empty();
            }

            self.store
                .mark_task_completed(session_id, &village.village_code, survey)
                .await?;
            last_done = survey;

            if survey % self.config.checkpoint_interval == 0 {
                let found = pending_records;
                self.flush_progress(village, last_done, &mut pending_records, &mut pending_matches)
                    .await?;
                info!(
                    worker_id = self.worker_id,
                    village = %village.village_name,
                    survey,
                    found,
                    "scan progress checkpointed"
                );
            }
            survey += 1;
        }

        self.flush_progress(village, last_done, &mut pending_records, &mut pending_matches)
            .await?;
        Ok(ScanResult::Completed {
            last_survey_no: last_done,
        })
    }

    /// Submit one survey query, absorbing recoverable failures. The same
    /// survey is re-submitted after every successful recovery.
    async fn submit_with_recovery(
        &self,
        adapter: &mut Box<dyn PortalAdapter>,
        monitor: &mut SessionHealthMonitor,
        village: &VillageRef,
        survey_no: u32,
    ) -> SubmitOutcome {
        loop {
            self.state.throttle().await;
            match adapter.submit(village, survey_no).await {
                Ok(listing) => return SubmitOutcome::Listing(listing),
                Err(err) => match monitor.recover(adapter, &err).await {
                    Recovery::Retry => continue,
                    Recovery::SkipTask(reason) => return SubmitOutcome::Skip(reason),
                    Recovery::Abandon(reason) => return SubmitOutcome::Abort(reason),
                },
            }
        }
    }

    /// Walk every (sub-parcel x sub-holding x period) combination of one
    /// survey, persisting validated records as they are found.
    async fn process_survey(
        &self,
        adapter: &mut Box<dyn PortalAdapter>,
        monitor: &mut SessionHealthMonitor,
        village: &VillageRef,
        survey_no: u32,
        listing: &SurveyListing,
    ) -> Result<SurveyOutcome, StoreError> {
        let mut records = 0u32;
        let mut matches = 0u32;

        for sub_parcel in &listing.sub_parcels {
            for holding in &sub_parcel.holdings {
                for period in &holding.periods {
                    let selector = RecordSelector {
                        survey_no,
                        surnoc: sub_parcel.surnoc.clone(),
                        hissa: holding.hissa.clone(),
                        period: period.clone(),
                    };
                    let mut attempts = 0u32;
                    loop {
                        self.state.throttle().await;
                        match adapter.select_and_fetch(&selector).await {
                            Ok(rows) => {
                                monitor.reset_on_success();
                                for raw in &rows {
                                    let record = LandRecord::from_raw(
                                        &self.session.scope,
                                        village,
                                        &selector,
                                        raw,
                                        &self.session.owner_variants,
                                        self.worker_id,
                                    );
                                    let is_match = record.is_match;
                                    if self
                                        .store
                                        .save_record(&self.session.session_id, &record)
                                        .await?
                                    {
                                        records += 1;
                                        if is_match {
                                            matches += 1;
                                        }
                                        self.state.record_saved(is_match);
                                    }
                                }
                                break;
                            }
                            Err(PortalError::Other(msg)) => {
                                attempts += 1;
                                if attempts > self.config.max_subtask_retries {
                                    // skipped, not conflated with "no data"
                                    self.record_selector_skip(village, &selector, &msg)
                                        .await?;
                                    break;
                                }
                            }
                            Err(err) => match monitor.recover(adapter, &err).await {
                                Recovery::Retry => {
                                    // the form state is gone after a refresh
                                    // or restart, re-submit before re-fetching
                                    match self
                                        .submit_with_recovery(adapter, monitor, village, survey_no)
                                        .await
                                    {
                                        SubmitOutcome::Listing(_) => {}
                                        SubmitOutcome::Skip(reason) => {
                                            self.record_selector_skip(
                                                village, &selector, &reason,
                                            )
                                            .await?;
                                            break;
                                        }
                                        SubmitOutcome::Abort(reason) => {
                                            return Ok(SurveyOutcome::Abandoned(reason));
                                        }
                                    }
                                }
                                Recovery::SkipTask(reason) => {
                                    self.record_selector_skip(village, &selector, &reason)
                                        .await?;
                                    break;
                                }
                                Recovery::Abandon(reason) => {
                                    return Ok(SurveyOutcome::Abandoned(reason));
                                }
                            },
                        }
                    }
                }
            }
        }
        Ok(SurveyOutcome::Done { records, matches })
    }

    /// Set a whole survey aside after its listing could not be fetched. The
    /// selector fields stay empty: nothing below the survey level was reached.
    async fn skip_survey(
        &self,
        village: &VillageRef,
        survey_no: u32,
        reason: &str,
    ) -> Result<(), StoreError> {
        warn!(
            worker_id = self.worker_id,
            village = %village.village_name,
            survey_no,
            "survey set aside for a follow-up run: {reason}"
        );
        self.store
            .mark_task_failed(&self.session.session_id, &village.village_code, survey_no, reason)
            .await?;
        self.store
            .record_task_retries(
                &self.session.session_id,
                &village.village_code,
                survey_no,
                self.config.max_subtask_retries,
            )
            .await?;
        let item = SkippedItem {
            village_code: village.village_code.clone(),
            village_name: village.village_name.clone(),
            survey_no,
            surnoc: String::new(),
            hissa: String::new(),
            period: String::new(),
            error: reason.to_owned(),
            worker_id: self.worker_id,
        };
        self.store.save_skipped(&self.session.session_id, &item).await?;
        self.state.record_skipped(item);
        Ok(())
    }

    /// Set one (surnoc, hissa, period) combination aside while the rest of
    /// the survey keeps going.
    async fn record_selector_skip(
        &self,
        village: &VillageRef,
        selector: &RecordSelector,
        reason: &str,
    ) -> Result<(), StoreError> {
        warn!(
            worker_id = self.worker_id,
            village = %village.village_name,
            survey_no = selector.survey_no,
            surnoc = %selector.surnoc,
            hissa = %selector.hissa,
            period = %selector.period,
            "sub-task skipped after retries: {reason}"
        );
        let item = SkippedItem {
            village_code: village.village_code.clone(),
            village_name: village.village_name.clone(),
            survey_no: selector.survey_no,
            surnoc: selector.surnoc.clone(),
            hissa: selector.hissa.clone(),
            period: selector.period.clone(),
            error: reason.to_owned(),
            worker_id: self.worker_id,
        };
        self.store.save_skipped(&self.session.session_id, &item).await?;
        self.state.record_skipped(item);
        Ok(())
    }

    async fn flush_progress(
        &self,
        village: &VillageRef,
        last_done: u32,
        pending_records: &mut u32,
        pending_matches: &mut u32,
    ) -> Result<(), StoreError> {
        self.store
            .update_village_progress(
                &self.session.session_id,
                &village.village_code,
                last_done,
                *pending_records,
                *pending_matches,
            )
            .await?;
        *pending_records = 0;
        *pending_matches = 0;
        Ok(())
    }
}
