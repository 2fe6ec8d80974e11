//! Decay tagging: flag reconstructed Compton sequences whose energy
//! combinations match known radioactive decay lines.
//!
//! The tagger never changes a sequence or the optimum; it only
//! annotates. Matches are counted per line and reported at teardown.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use recon_core::{EventType, HypothesisGroup, RawEvent, SetupError};

use crate::config::{DecayConfig, DecayMode};
use crate::stage::ReconstructionStage;

/// One known decay line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecayLine {
    pub energy_kev: f64,
    pub sigma_kev: f64,
}

pub struct DecayTagger {
    config: DecayConfig,
    lines: Vec<DecayLine>,
    /// Matches per line, reported at post-analysis.
    occupation: Vec<u64>,
}

impl DecayTagger {
    pub fn new(config: DecayConfig) -> Self {
        let lines: Vec<DecayLine> = config
            .lines
            .iter()
            .map(|&(energy_kev, sigma_kev)| DecayLine {
                energy_kev,
                sigma_kev,
            })
            .collect();
        let occupation = vec![0; lines.len()];
        DecayTagger {
            config,
            lines,
            occupation,
        }
    }

    fn is_decay(&mut self, energy: f64, energy_error: f64) -> bool {
        for (i, line) in self.lines.iter().enumerate() {
            if (energy - line.energy_kev).abs() < line.sigma_kev * energy_error.max(1.0) {
                self.occupation[i] += 1;
                debug!(
                    line = line.energy_kev,
                    measured = energy,
                    "decay: line match"
                );
                return true;
            }
        }
        false
    }

    /// Recursive subset search over RESE energies: does any combination
    /// (starting at `level` picks) sum to a known line?
    fn check_combinations(
        &mut self,
        energy: f64,
        energy_error: f64,
        start: usize,
        event: &RawEvent,
        level: usize,
    ) -> bool {
        if level >= event.len() {
            return false;
        }

        for i in start..event.len() {
            let r = &event.reses()[i];
            let combined_error =
                (energy_error * energy_error + r.energy_resolution * r.energy_resolution).sqrt();
            if self.is_decay(energy + r.energy, combined_error) {
                return true;
            }
        }

        for i in start..event.len().saturating_sub(1) {
            let r = &event.reses()[i];
            let combined_error =
                (energy_error * energy_error + r.energy_resolution * r.energy_resolution).sqrt();
            if self.check_combinations(energy + r.energy, combined_error, i + 1, event, level + 1) {
                return true;
            }
        }

        false
    }

    fn tag(&mut self, event: &RawEvent) -> bool {
        match self.config.mode {
            // The full event is excluded: a fully absorbed photopeak is
            // not a decay signature by itself.
            DecayMode::AllButOneCombination => self.check_combinations(0.0, 0.0, 0, event, 1),
            DecayMode::AllCombinations => self.check_combinations(0.0, 0.0, 0, event, 0),
            DecayMode::SequenceEnd => {
                if event.is_empty() || event.start_index.is_none() {
                    return false;
                }
                let start = &event.reses()[0];
                let energy = event.total_energy() - start.energy;
                let error_sq = event.energy_resolution() * event.energy_resolution()
                    - start.energy_resolution * start.energy_resolution;
                self.is_decay(energy, error_sq.max(0.0).sqrt())
            }
        }
    }
}

impl ReconstructionStage for DecayTagger {
    fn analyze(&mut self, group: &mut HypothesisGroup) -> Result<(), SetupError> {
        for i in 0..group.len() {
            let is_compton = group
                .get(i)
                .map(|e| e.event_type == EventType::Compton && !e.is_rejected())
                .unwrap_or(false);
            if !is_compton {
                continue;
            }
            let tagged = {
                let event = group.get(i).expect("index valid").clone();
                self.tag(&event)
            };
            if tagged {
                group.get_mut(i).expect("index valid").decay = true;
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let mut out = String::from("# Decay options:\n");
        out.push_str(&format!("# Mode: {:?}\n", self.config.mode));
        for line in &self.lines {
            out.push_str(&format!(
                "# Line: {} +- {} keV\n",
                line.energy_kev, line.sigma_kev
            ));
        }
        out
    }

    fn pre_analysis(&mut self) -> Result<(), SetupError> {
        if let Some(file) = self.config.table_file.clone() {
            let content =
                std::fs::read_to_string(Path::new(&file)).map_err(|e| SetupError::TableLoad {
                    what: "decay line table",
                    detail: e.to_string(),
                })?;
            let loaded: Vec<DecayLine> =
                serde_json::from_str(&content).map_err(|e| SetupError::TableLoad {
                    what: "decay line table",
                    detail: e.to_string(),
                })?;
            self.lines.extend(loaded);
        }
        self.occupation = vec![0; self.lines.len()];
        Ok(())
    }

    fn post_analysis(&mut self) -> String {
        let mut out = String::from("Decay analysis:\n");
        for (line, count) in self.lines.iter().zip(&self.occupation) {
            out.push_str(&format!("  {} keV: {} matches\n", line.energy_kev, count));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use recon_core::{DetectorType, Rese};
    use std::io::Write;

    fn hit(id: u32, z: f64, energy: f64) -> Rese {
        let mut r = Rese::hit(id, Vector3::new(0.0, 0.0, z), energy, DetectorType::Tracker2d);
        r.energy_resolution = 2.0;
        r
    }

    fn compton_event(energies: &[f64]) -> RawEvent {
        let mut event = RawEvent::with_reses(
            1,
            0.0,
            energies
                .iter()
                .enumerate()
                .map(|(i, &e)| hit(i as u32 + 1, i as f64, e))
                .collect(),
        );
        event.event_type = EventType::Compton;
        event.start_index = Some(0);
        event.set_good(true);
        event
    }

    fn config_with_lines(lines: Vec<(f64, f64)>, mode: DecayMode) -> DecayConfig {
        DecayConfig {
            algorithm: crate::config::DecayAlgorithm::Standard,
            mode,
            table_file: None,
            lines,
        }
    }

    #[test]
    fn test_subset_sum_matches_line() {
        // 511 keV annihilation line; deposits 200 + 311 sum to it.
        let mut tagger = DecayTagger::new(config_with_lines(
            vec![(511.0, 2.0)],
            DecayMode::AllButOneCombination,
        ));
        let mut group = HypothesisGroup::new();
        group.set_initial(compton_event(&[200.0, 311.0, 400.0]));

        tagger.analyze(&mut group).unwrap();
        assert!(group.get(0).unwrap().decay);
    }

    #[test]
    fn test_all_but_one_excludes_total() {
        // Only the full event sums to the line; the default mode must
        // not count that as a decay signature.
        let mut tagger = DecayTagger::new(config_with_lines(
            vec![(600.0, 1.0)],
            DecayMode::AllButOneCombination,
        ));
        let mut group = HypothesisGroup::new();
        group.set_initial(compton_event(&[200.0, 400.0]));

        tagger.analyze(&mut group).unwrap();
        assert!(!group.get(0).unwrap().decay);
    }

    #[test]
    fn test_sequence_end_mode() {
        // Everything after the first hit sums to the line.
        let mut tagger =
            DecayTagger::new(config_with_lines(vec![(511.0, 3.0)], DecayMode::SequenceEnd));
        let mut group = HypothesisGroup::new();
        group.set_initial(compton_event(&[150.0, 300.0, 211.0]));

        tagger.analyze(&mut group).unwrap();
        assert!(group.get(0).unwrap().decay);
    }

    #[test]
    fn test_non_compton_events_ignored() {
        let mut tagger = DecayTagger::new(config_with_lines(
            vec![(511.0, 5.0)],
            DecayMode::AllButOneCombination,
        ));
        let mut event = compton_event(&[200.0, 311.0]);
        event.event_type = EventType::Photo;
        let mut group = HypothesisGroup::new();
        group.set_initial(event);

        tagger.analyze(&mut group).unwrap();
        assert!(!group.get(0).unwrap().decay);
    }

    #[test]
    fn test_table_file_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"energy_kev": 1460.8, "sigma_kev": 3.0}}, {{"energy_kev": 2614.5, "sigma_kev": 4.0}}]"#
        )
        .unwrap();

        let mut config = config_with_lines(vec![(511.0, 2.0)], DecayMode::AllButOneCombination);
        config.table_file = Some(file.path().to_string_lossy().into_owned());

        let mut tagger = DecayTagger::new(config);
        tagger.pre_analysis().unwrap();
        assert_eq!(tagger.lines.len(), 3);

        let summary = tagger.post_analysis();
        assert!(summary.contains("1460.8"));
    }
}
