//! Bhoomi Engine - resumable parallel land-records scrape engine
//!
//! Drives an owner-name search across the combinatorial task space of the
//! Karnataka Bhoomi portal (village x survey number x sub-parcel x period),
//! with durable checkpointing, session/driver failure recovery, and a
//! post-run coverage audit. The portal itself is consumed through the
//! [`domain::ports::PortalAdapter`] boundary; this crate never touches markup.

// Module declarations
pub mod domain;
pub mod engine;
pub mod infrastructure;

// Re-export the control surface for embedding layers (dashboard, CLI)
pub use engine::{EngineError, SearchEngine, StatusSnapshot};
