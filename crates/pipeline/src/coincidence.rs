//! Coincidence search: merge hit lists that arrived within one time
//! window into a single triggered event.

use tracing::debug;

use recon_core::{RawEvent, Rese};

use crate::config::{CoincidenceAlgorithm, CoincidenceConfig};
use crate::source::EventStore;

/// Positions closer than this count as the same voxel after a merge.
const SAME_VOXEL_CM: f64 = 1e-7;

pub struct Coincidence {
    config: CoincidenceConfig,
}

impl Coincidence {
    pub fn new(config: CoincidenceConfig) -> Self {
        Coincidence { config }
    }

    /// Try to produce the next merged event from the store.
    ///
    /// Returns `None` while the window is still open (caller keeps
    /// feeding input). With `flush` set the remaining buffer is merged
    /// unconditionally, for when the source is exhausted.
    pub fn search(&self, store: &mut EventStore, flush: bool) -> Option<RawEvent> {
        if store.is_empty() {
            return None;
        }

        if self.config.algorithm == CoincidenceAlgorithm::None {
            return store.pop_front();
        }

        let window_start = store.front().map(|e| e.event_time)?;

        // Find the first event outside the window; everything before it
        // belongs to one physical event.
        let mut inside = store.len();
        for i in 1..store.len() {
            let t = store.get(i).map(|e| e.event_time).unwrap_or(window_start);
            if t - window_start > self.config.window_s {
                inside = i;
                break;
            }
        }

        if inside == store.len() && !flush {
            // Window still open, wait for more input.
            return None;
        }

        let parts = store.drain_front(inside);
        Some(self.merge(parts))
    }

    fn merge(&self, parts: Vec<RawEvent>) -> RawEvent {
        debug_assert!(!parts.is_empty());
        if parts.len() > 1 {
            debug!(n = parts.len(), "coincidence: merging hit lists");
        }

        let mut iter = parts.into_iter();
        let mut merged = iter.next().expect("non-empty parts");
        for part in iter {
            merged.external_bad |= part.external_bad;
            if merged.external_bad_reason.is_none() {
                merged.external_bad_reason = part.external_bad_reason.clone();
            }
            for rese in part.reses().iter().cloned() {
                merged.push(rese);
            }
        }

        Self::merge_same_voxel(&mut merged);
        merged
    }

    /// Coincidence search can land two deposits in the same voxel (a
    /// simulation artifact); combine them by summing energies.
    fn merge_same_voxel(event: &mut RawEvent) {
        let mut reses: Vec<Rese> = event.reses().to_vec();
        let mut i = 0;
        while i < reses.len() {
            let mut j = i + 1;
            while j < reses.len() {
                if (reses[i].position - reses[j].position).norm() < SAME_VOXEL_CM {
                    debug!(
                        first = reses[i].id,
                        second = reses[j].id,
                        "coincidence: two deposits in one voxel, merging"
                    );
                    let absorbed = reses.remove(j);
                    reses[i].energy += absorbed.energy;
                    reses[i].energy_resolution = (reses[i].energy_resolution.powi(2)
                        + absorbed.energy_resolution.powi(2))
                    .sqrt();
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        event.replace_reses(reses);
    }

    pub fn describe(&self) -> String {
        match self.config.algorithm {
            CoincidenceAlgorithm::None => "# Coincidence: off\n".to_string(),
            CoincidenceAlgorithm::Window => format!(
                "# Coincidence: time window\n# Window: {:e} s\n",
                self.config.window_s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use recon_core::DetectorType;

    fn event_at(id: u64, t: f64, z: f64) -> RawEvent {
        RawEvent::with_reses(
            id,
            t,
            vec![Rese::hit(
                id as u32,
                Vector3::new(0.0, 0.0, z),
                100.0,
                DetectorType::Tracker2d,
            )],
        )
    }

    fn window_config(window_s: f64) -> CoincidenceConfig {
        CoincidenceConfig {
            algorithm: CoincidenceAlgorithm::Window,
            window_s,
        }
    }

    #[test]
    fn test_waits_while_window_open() {
        let c = Coincidence::new(window_config(1e-6));
        let mut store = EventStore::new();
        store.push(event_at(1, 0.0, 0.0));
        store.push(event_at(2, 5e-7, 1.0));

        assert!(c.search(&mut store, false).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_merges_on_window_close() {
        let c = Coincidence::new(window_config(1e-6));
        let mut store = EventStore::new();
        store.push(event_at(1, 0.0, 0.0));
        store.push(event_at(2, 5e-7, 1.0));
        store.push(event_at(3, 1.0, 2.0)); // far outside the window

        let merged = c.search(&mut store, false).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.event_id, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_flush_drains_open_window() {
        let c = Coincidence::new(window_config(1e-6));
        let mut store = EventStore::new();
        store.push(event_at(1, 0.0, 0.0));
        store.push(event_at(2, 5e-7, 1.0));

        let merged = c.search(&mut store, true).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_same_voxel_deposits_are_combined() {
        let c = Coincidence::new(window_config(1e-6));
        let mut store = EventStore::new();
        store.push(event_at(1, 0.0, 0.0));
        store.push(event_at(2, 5e-7, 0.0)); // identical position

        let merged = c.search(&mut store, true).unwrap();
        assert_eq!(merged.len(), 1);
        assert!((merged.reses()[0].energy - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_passes_through() {
        let c = Coincidence::new(CoincidenceConfig::default());
        let mut store = EventStore::new();
        store.push(event_at(1, 0.0, 0.0));
        store.push(event_at(2, 1e-9, 1.0));

        let first = c.search(&mut store, false).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(store.len(), 1);
    }
}
