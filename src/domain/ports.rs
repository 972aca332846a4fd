//! Boundary ports consumed by the engine
//!
//! The portal adapter drives one stateful form session against the upstream
//! portal; the location catalog enumerates the administrative hierarchy. Both
//! are external collaborators: the engine only sees these traits and the
//! closed [`PortalError`] tag set, never page markup or field identifiers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Selected administrative scope for a search: one district/taluk, optionally
/// narrowed to a single hobli or village.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationScope {
    pub district_code: String,
    pub district_name: String,
    pub taluk_code: String,
    pub taluk_name: String,
    /// `None` means all hoblis of the taluk.
    pub hobli_code: Option<String>,
    /// `None` means all villages of the selected hoblis.
    pub village_code: Option<String>,
}

/// One village as the unit of work distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VillageRef {
    pub village_code: String,
    pub village_name: String,
    pub hobli_code: String,
    pub hobli_name: String,
}

/// Failure signals the engine understands. Everything an adapter raises must
/// collapse into this closed set; the health monitor switches on the tag, not
/// on message text.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PortalError {
    /// The portal-side session is no longer usable; a refresh may recover it.
    #[error("portal session invalid: {0}")]
    SessionInvalid(String),

    /// The automation driver process itself is unusable and must be
    /// disposed and recreated.
    #[error("driver dead: {0}")]
    DriverDead(String),

    /// Anything else (element not ready, timeout without a failure
    /// signature). Bounded retry, then recorded as skipped.
    #[error("portal error: {0}")]
    Other(String),
}

/// Page-text markers the portal emits when its session has lapsed. String
/// matching against page content is the portal's only tell; it is isolated
/// here so adapter implementations share one classification function.
const SESSION_EXPIRY_MARKERS: &[&str] = &[
    "session expired",
    "please login again",
    "session timeout",
    "your session has expired",
    "login again",
    "session has been terminated",
];

/// Classify rendered page text as a session-expiry response.
pub fn looks_like_session_expiry(page_text: &str) -> bool {
    let lower = page_text.to_lowercase();
    SESSION_EXPIRY_MARKERS.iter().any(|m| lower.contains(m))
}

/// One raw owner row as extracted from a result page. Untyped boundary data;
/// converted once at ingestion into a `LandRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOwnerRow {
    pub owner_name: String,
    pub extent: String,
    pub khatah: String,
}

/// Periods available under one sub-holding (hissa).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubHolding {
    pub hissa: String,
    pub periods: Vec<String>,
}

/// One sub-parcel (surnoc) with its sub-holdings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubParcel {
    pub surnoc: String,
    pub holdings: Vec<SubHolding>,
}

/// Result of submitting one (village, survey number) query: the full
/// sub-parcel tree the form exposes. An empty tree after a verified healthy
/// session is a true negative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurveyListing {
    pub sub_parcels: Vec<SubParcel>,
}

impl SurveyListing {
    pub fn has_data(&self) -> bool {
        !self.sub_parcels.is_empty()
    }
}

/// Addresses one (survey, surnoc, hissa, period) combination for fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSelector {
    pub survey_no: u32,
    pub surnoc: String,
    pub hissa: String,
    pub period: String,
}

/// Drives one form session against the portal. An adapter instance holds
/// exclusive stateful session context and must never be shared across
/// workers.
#[async_trait]
pub trait PortalAdapter: Send {
    /// Navigate to the entry form and establish a fresh session.
    async fn open(&mut self) -> Result<(), PortalError>;

    /// Submit the search form for one village and survey number and return
    /// the sub-parcel tree (empty when the survey holds no data).
    async fn submit(
        &mut self,
        village: &VillageRef,
        survey_no: u32,
    ) -> Result<SurveyListing, PortalError>;

    /// Select one sub-parcel/hissa/period combination and fetch its owner
    /// rows. Must follow a successful `submit` for the same survey.
    async fn select_and_fetch(
        &mut self,
        selector: &RecordSelector,
    ) -> Result<Vec<RawOwnerRow>, PortalError>;

    /// Refresh the portal session in place (clear cookies, reload the entry
    /// page) without recreating the driver.
    async fn refresh_session(&mut self) -> Result<(), PortalError>;

    /// Fully dispose and recreate the underlying driver instance.
    async fn restart(&mut self) -> Result<(), PortalError>;
}

/// Creates one adapter per worker. Workers own their adapter exclusively.
#[async_trait]
pub trait PortalAdapterFactory: Send + Sync {
    async fn create(&self, worker_id: u32) -> Result<Box<dyn PortalAdapter>, PortalError>;
}

#[derive(Error, Debug, Clone)]
#[error("location catalog unavailable: {0}")]
pub struct CatalogError(pub String);

/// Read-only enumeration of the administrative hierarchy. Assumed idempotent
/// and cacheable; a failure here is fatal at startup (there is no village
/// list to assign work from), so the engine does not retry it.
#[async_trait]
pub trait LocationCatalog: Send + Sync {
    /// Hoblis of the scoped district/taluk as (code, name) pairs.
    async fn list_hoblis(&self, scope: &LocationScope) -> Result<Vec<(String, String)>, CatalogError>;

    /// Villages of one hobli as (code, name) pairs.
    async fn list_villages(
        &self,
        scope: &LocationScope,
        hobli_code: &str,
    ) -> Result<Vec<(String, String)>, CatalogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_markers_match_case_insensitively() {
        assert!(looks_like_session_expiry(
            "<html><body>Your Session Has Expired. Please login again.</body></html>"
        ));
        assert!(looks_like_session_expiry("SESSION TIMEOUT"));
        assert!(!looks_like_session_expiry(
            "<html><body>RTC details for survey 12</body></html>"
        ));
    }

    #[test]
    fn empty_listing_is_a_true_negative() {
        let listing = SurveyListing::default();
        assert!(!listing.has_data());
        let listing = SurveyListing {
            sub_parcels: vec![SubParcel {
                surnoc: "*".into(),
                holdings: vec![],
            }],
        };
        assert!(listing.has_data());
    }
}
