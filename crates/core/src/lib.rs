//! Shared data model for the Compton event-reconstruction pipeline.
//!
//! The core crate carries everything the reconstruction stages agree on:
//! the RESE node tree (hits, clusters, tracks), the raw-event hypothesis
//! and its rejection taxonomy, the hypothesis group with its
//! initial/optimum/best-try bookkeeping, Compton kinematics, and the
//! read-only geometry collaborator trait.

pub mod error;
pub mod geometry;
pub mod hypotheses;
pub mod kinematics;
pub mod physical;
pub mod raw_event;
pub mod rese;

pub use error::{SetupError, SinkError};
pub use geometry::{Geometry, Resolutions, UniformGeometry};
pub use hypotheses::HypothesisGroup;
pub use physical::{PhysicalEvent, PhysicalEventKind};
pub use raw_event::{EventType, RawEvent, RejectionReason};
pub use rese::{DetectorType, Rese, ReseKind};
