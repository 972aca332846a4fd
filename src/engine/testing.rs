//! Test doubles for the two external collaborators
//!
//! A scripted portal adapter (data per village, injectable faults, call
//! counters) and a static location catalog. Used by the unit tests and the
//! integration scenarios; not part of the public API surface.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ports::{
    CatalogError, LocationCatalog, LocationScope, PortalAdapter, PortalAdapterFactory,
    PortalError, RawOwnerRow, RecordSelector, SubHolding, SubParcel, SurveyListing, VillageRef,
};

#[derive(Default)]
struct MockScript {
    /// village code -> survey numbers that hold data
    data: Mutex<HashMap<String, Vec<u32>>>,
    /// village code -> faults returned by `submit`, in order
    submit_faults: Mutex<HashMap<String, VecDeque<PortalError>>>,
    /// faults returned by `select_and_fetch`, in order
    fetch_faults: Mutex<VecDeque<PortalError>>,
    owner_name: Mutex<Option<String>>,
    call_delay: Mutex<Option<Duration>>,
    fail_refresh: AtomicBool,
    fail_restart: AtomicBool,
    refresh_calls: AtomicU32,
    restart_calls: AtomicU32,
    submit_calls: AtomicU32,
    fetch_calls: AtomicU32,
}

/// Builds scripted adapters that all share one script and one set of call
/// counters, so a test can inspect behavior across a whole worker pool.
#[derive(Clone, Default)]
pub struct MockAdapterFactory {
    script: Arc<MockScript>,
}

impl MockAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare which surveys of a village hold data. Each data survey yields
    /// one sub-parcel with one holding and one period, producing one row.
    pub fn with_data(&self, village_code: &str, surveys: Vec<u32>) {
        if let Ok(mut data) = self.script.data.lock() {
            data.insert(village_code.to_string(), surveys);
        }
    }

    /// Queue a fault to be returned by the next `submit` for this village.
    pub fn push_submit_fault(&self, village_code: &str, err: PortalError) {
        if let Ok(mut faults) = self.script.submit_faults.lock() {
            faults
                .entry(village_code.to_string())
                .or_default()
                .push_back(err);
        }
    }

    /// Queue a fault to be returned by the next `select_and_fetch`.
    pub fn push_fetch_fault(&self, err: PortalError) {
        if let Ok(mut faults) = self.script.fetch_faults.lock() {
            faults.push_back(err);
        }
    }

    pub fn set_owner_name(&self, name: &str) {
        if let Ok(mut owner) = self.script.owner_name.lock() {
            *owner = Some(name.to_string());
        }
    }

    /// Slow every portal call down, for tests that stop a run mid-flight.
    pub fn set_call_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.script.call_delay.lock() {
            *d = Some(delay);
        }
    }

    pub fn fail_refreshes(&self) {
        self.script.fail_refresh.store(true, Ordering::SeqCst);
    }

    pub fn fail_restarts(&self) {
        self.script.fail_restart.store(true, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> u32 {
        self.script.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn restart_calls(&self) -> u32 {
        self.script.restart_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> u32 {
        self.script.submit_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u32 {
        self.script.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortalAdapterFactory for MockAdapterFactory {
    async fn create(&self, _worker_id: u32) -> Result<Box<dyn PortalAdapter>, PortalError> {
        Ok(Box::new(MockPortalAdapter {
            script: self.script.clone(),
            last_submitted: None,
        }))
    }
}

pub struct MockPortalAdapter {
    script: Arc<MockScript>,
    last_submitted: Option<(String, u32)>,
}

impl MockPortalAdapter {
    async fn maybe_delay(&self) {
        let delay = self.script.call_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PortalAdapter for MockPortalAdapter {
    async fn open(&mut self) -> Result<(), PortalError> {
        Ok(())
    }

    async fn submit(
        &mut self,
        village: &VillageRef,
        survey_no: u32,
    ) -> Result<SurveyListing, PortalError> {
        self.script.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;

        if let Ok(mut faults) = self.script.submit_faults.lock() {
            if let Some(queue) = faults.get_mut(&village.village_code) {
                if let Some(err) = queue.pop_front() {
                    return Err(err);
                }
            }
        }

        self.last_submitted = Some((village.village_code.clone(), survey_no));
        let has_data = self
            .script
            .data
            .lock()
            .ok()
            .map(|data| {
                data.get(&village.village_code)
                    .is_some_and(|surveys| surveys.contains(&survey_no))
            })
            .unwrap_or(false);

        if has_data {
            Ok(SurveyListing {
                sub_parcels: vec![SubParcel {
                    surnoc: "*".to_string(),
                    holdings: vec![SubHolding {
                        hissa: "1".to_string(),
                        periods: vec!["2023-24".to_string()],
                    }],
                }],
            })
        } else {
            Ok(SurveyListing::default())
        }
    }

    async fn select_and_fetch(
        &mut self,
        selector: &RecordSelector,
    ) -> Result<Vec<RawOwnerRow>, PortalError> {
        self.script.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;

        if let Ok(mut faults) = self.script.fetch_faults.lock() {
            if let Some(err) = faults.pop_front() {
                return Err(err);
            }
        }

        let (village_code, survey_no) = self
            .last_submitted
            .clone()
            .ok_or_else(|| PortalError::Other("select without a prior submit".into()))?;
        if survey_no != selector.survey_no {
            return Err(PortalError::Other(format!(
                "selector for survey {} but survey {survey_no} is loaded",
                selector.survey_no
            )));
        }

        let owner = self
            .script
            .owner_name
            .lock()
            .ok()
            .and_then(|o| o.clone())
            .unwrap_or_else(|| "Sri Ramappa".to_string());
        Ok(vec![RawOwnerRow {
            owner_name: owner,
            extent: "1.20".to_string(),
            khatah: format!("{village_code}-{survey_no}"),
        }])
    }

    async fn refresh_session(&mut self) -> Result<(), PortalError> {
        self.script.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_refresh.load(Ordering::SeqCst) {
            Err(PortalError::SessionInvalid("refresh rejected".into()))
        } else {
            Ok(())
        }
    }

    async fn restart(&mut self) -> Result<(), PortalError> {
        self.script.restart_calls.fetch_add(1, Ordering::SeqCst);
        self.last_submitted = None;
        if self.script.fail_restart.load(Ordering::SeqCst) {
            Err(PortalError::DriverDead("driver would not come up".into()))
        } else {
            Ok(())
        }
    }
}

/// In-memory location hierarchy.
#[derive(Clone, Default)]
pub struct StaticCatalog {
    hoblis: Vec<(String, String)>,
    villages: HashMap<String, Vec<(String, String)>>,
    unavailable: bool,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hobli(
        mut self,
        hobli_code: &str,
        hobli_name: &str,
        villages: Vec<(&str, &str)>,
    ) -> Self {
        self.hoblis
            .push((hobli_code.to_string(), hobli_name.to_string()));
        self.villages.insert(
            hobli_code.to_string(),
            villages
                .into_iter()
                .map(|(code, name)| (code.to_string(), name.to_string()))
                .collect(),
        );
        self
    }

    /// A catalog whose every call fails, for startup-error tests.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl LocationCatalog for StaticCatalog {
    async fn list_hoblis(
        &self,
        _scope: &LocationScope,
    ) -> Result<Vec<(String, String)>, CatalogError> {
        if self.unavailable {
            return Err(CatalogError("hierarchy service unreachable".into()));
        }
        Ok(self.hoblis.clone())
    }

    async fn list_villages(
        &self,
        _scope: &LocationScope,
        hobli_code: &str,
    ) -> Result<Vec<(String, String)>, CatalogError> {
        if self.unavailable {
            return Err(CatalogError("hierarchy service unreachable".into()));
        }
        Ok(self.villages.get(hobli_code).cloned().unwrap_or_default())
    }
}
