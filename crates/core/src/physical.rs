//! Finalized physical events: the output payload handed to sinks.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::raw_event::{EventType, RawEvent, RejectionReason};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PhysicalEventKind {
    Photo {
        position: Vector3<f64>,
        energy: f64,
    },
    Compton {
        /// Interaction sites in scattering order with their deposits.
        sites: Vec<(Vector3<f64>, f64)>,
        scatter_angles: Vec<f64>,
        quality: f64,
        escaped_energy: f64,
        decay: bool,
    },
    Pair {
        vertex: Vector3<f64>,
        energy: f64,
    },
    Muon {
        direction: Vector3<f64>,
        energy: f64,
    },
    Unidentifiable {
        rejection: RejectionReason,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalEvent {
    pub event_id: u64,
    pub time: f64,
    pub kind: PhysicalEventKind,
}

impl PhysicalEvent {
    /// Convert a finalized raw event into its physical payload.
    ///
    /// Unreconstructed or rejected events become `Unidentifiable` with
    /// their rejection reason attached; they are emitted for
    /// diagnostics, never counted as successes.
    pub fn from_raw(raw: &RawEvent) -> Self {
        let kind = if raw.is_rejected() || !raw.is_good() {
            PhysicalEventKind::Unidentifiable {
                rejection: raw.rejection(),
            }
        } else {
            match raw.event_type {
                EventType::Photo => PhysicalEventKind::Photo {
                    position: raw.reses()[0].position,
                    energy: raw.total_energy(),
                },
                EventType::Compton => PhysicalEventKind::Compton {
                    sites: raw
                        .reses()
                        .iter()
                        .map(|r| (r.position, r.energy))
                        .collect(),
                    scatter_angles: raw.scatter_angles(),
                    quality: raw.quality.unwrap_or(f64::INFINITY),
                    escaped_energy: raw.escaped_energy,
                    decay: raw.decay,
                },
                EventType::Pair => PhysicalEventKind::Pair {
                    vertex: raw
                        .reses()
                        .first()
                        .map(|r| r.position)
                        .unwrap_or_else(Vector3::zeros),
                    energy: raw.total_energy(),
                },
                EventType::Muon => PhysicalEventKind::Muon {
                    direction: raw
                        .reses()
                        .first()
                        .and_then(|r| r.direction())
                        .unwrap_or_else(|| Vector3::new(0.0, 0.0, 1.0)),
                    energy: raw.total_energy(),
                },
                EventType::Unknown | EventType::Unidentifiable => {
                    PhysicalEventKind::Unidentifiable {
                        rejection: raw.rejection(),
                    }
                }
            }
        };

        PhysicalEvent {
            event_id: raw.event_id,
            time: raw.event_time,
            kind,
        }
    }

    pub fn is_identified(&self) -> bool {
        !matches!(self.kind, PhysicalEventKind::Unidentifiable { .. })
    }
}
