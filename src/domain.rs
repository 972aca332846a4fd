//! Domain module - core entities and boundary ports
//!
//! This module contains the entities of an owner search (sessions, village
//! tasks, land records, checkpoints) and the traits the engine consumes
//! (portal adapter, location catalog). No persistence or scheduling logic
//! lives here.

pub mod entities;
pub mod ports;

// Re-export commonly used items for convenience
pub use entities::{
    AuditReport, LandRecord, SearchParams, SearchSession, SessionStatus, SkippedItem,
    TaskCheckpoint, VillageAnomaly, VillageStatus, VillageTask,
};
pub use ports::{
    CatalogError, LocationCatalog, LocationScope, PortalAdapter, PortalAdapterFactory,
    PortalError, RawOwnerRow, RecordSelector, SubHolding, SubParcel, SurveyListing, VillageRef,
};
