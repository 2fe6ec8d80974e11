//! Reconstruction configuration.
//!
//! JSON-loadable configuration for the whole pipeline. Every knob has a
//! serde default so a partial file configures only what it names.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use recon_core::{DetectorType, SetupError};

/// Top-level reconstruction configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconstructionConfig {
    #[serde(default)]
    pub coincidence: CoincidenceConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub csr: CsrConfig,

    #[serde(default)]
    pub decay: DecayConfig,

    #[serde(default)]
    pub selection: SelectionConfig,
}

impl ReconstructionConfig {
    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, SetupError> {
        let content = std::fs::read_to_string(path).map_err(|e| SetupError::TableLoad {
            what: "reconstruction config",
            detail: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SetupError::TableLoad {
            what: "reconstruction config",
            detail: e.to_string(),
        })
    }
}

/// Coincidence search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoincidenceConfig {
    #[serde(default)]
    pub algorithm: CoincidenceAlgorithm,

    /// Width of the coincidence time window in seconds.
    #[serde(default = "default_coincidence_window")]
    pub window_s: f64,
}

impl Default for CoincidenceConfig {
    fn default() -> Self {
        CoincidenceConfig {
            algorithm: CoincidenceAlgorithm::default(),
            window_s: default_coincidence_window(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoincidenceAlgorithm {
    #[default]
    None,
    Window,
}

fn default_coincidence_window() -> f64 {
    1e-6
}

/// Hit clustering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default)]
    pub algorithm: ClusteringAlgorithm,

    /// Per-detector minimum merge distances (cm) for the distance policy.
    #[serde(default = "default_min_distances")]
    pub min_distances_cm: BTreeMap<DetectorType, f64>,

    /// Use cluster centroids instead of closest leaves as the distance
    /// reference.
    #[serde(default)]
    pub center_is_reference: bool,

    /// Voxel connectivity level (1..=5) for the adjacency policy.
    #[serde(default = "default_adjacent_level")]
    pub adjacent_level: u8,

    /// Timing veto in combined sigmas for the adjacency policy; zero
    /// disables the veto.
    #[serde(default)]
    pub adjacent_sigma: f64,

    /// Separability table file for the probability policy.
    #[serde(default)]
    pub separability_table: Option<String>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        ClusteringConfig {
            algorithm: ClusteringAlgorithm::default(),
            min_distances_cm: default_min_distances(),
            center_is_reference: false,
            adjacent_level: default_adjacent_level(),
            adjacent_sigma: 0.0,
            separability_table: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringAlgorithm {
    None,
    Distance,
    #[default]
    AdjacentVoxels,
    ProbabilityTable,
}

fn default_min_distances() -> BTreeMap<DetectorType, f64> {
    let mut m = BTreeMap::new();
    m.insert(DetectorType::Tracker2d, 0.05);
    m.insert(DetectorType::Calorimeter, 1.1);
    m.insert(DetectorType::Strip3d, 0.19);
    m.insert(DetectorType::Scintillator, 0.0);
    m.insert(DetectorType::DriftChamber, 0.19);
    m.insert(DetectorType::DirectionalStrip3d, 0.19);
    m.insert(DetectorType::AngerCamera, 0.19);
    m.insert(DetectorType::Voxel3d, 0.19);
    m
}

fn default_adjacent_level() -> u8 {
    2
}

/// Electron/pair/MIP tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub algorithm: TrackingAlgorithm,

    /// Detector classes searched for track segments.
    #[serde(default = "default_tracking_detectors")]
    pub detectors: Vec<DetectorType>,

    #[serde(default = "default_true")]
    pub search_pairs: bool,

    #[serde(default)]
    pub search_mips: bool,

    #[serde(default = "default_true")]
    pub search_comptons: bool,

    /// Maximum number of layers a Compton electron may skip between
    /// consecutive track hits.
    #[serde(default = "default_max_compton_jump")]
    pub max_compton_jump: i32,

    /// Number of alternative track interpretations kept as competing
    /// incarnations.
    #[serde(default = "default_sequences_to_keep")]
    pub n_sequences_to_keep: usize,

    /// Reject events whose best track interpretations tie exactly.
    #[serde(default)]
    pub reject_pure_ambiguities: bool,

    /// Minimum number of crossed layers for a MIP/muon call.
    #[serde(default = "default_min_layers_mip")]
    pub min_layers_mip: i32,

    /// Hard cap on simultaneous incarnations per event.
    #[serde(default = "default_max_incarnations")]
    pub max_incarnations: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            algorithm: TrackingAlgorithm::default(),
            detectors: default_tracking_detectors(),
            search_pairs: true,
            search_mips: false,
            search_comptons: true,
            max_compton_jump: default_max_compton_jump(),
            n_sequences_to_keep: default_sequences_to_keep(),
            reject_pure_ambiguities: false,
            min_layers_mip: default_min_layers_mip(),
            max_incarnations: default_max_incarnations(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingAlgorithm {
    #[default]
    None,
    Directional,
}

fn default_tracking_detectors() -> Vec<DetectorType> {
    vec![DetectorType::Tracker2d, DetectorType::DriftChamber]
}

fn default_max_compton_jump() -> i32 {
    2
}

fn default_sequences_to_keep() -> usize {
    1
}

fn default_min_layers_mip() -> i32 {
    4
}

fn default_max_incarnations() -> usize {
    16
}

/// Compton sequence reconstruction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrConfig {
    #[serde(default)]
    pub algorithm: CsrAlgorithm,

    /// Accepted quality window: the best sequence score must fall inside
    /// `[threshold_min, threshold_max]`.
    #[serde(default)]
    pub threshold_min: f64,

    #[serde(default = "default_threshold_max")]
    pub threshold_max: f64,

    /// Events with more undecided sites are rejected unsequenced.
    #[serde(default = "default_max_hits")]
    pub max_hits: usize,

    /// Permutation evaluation budget; generation stops when exhausted.
    #[serde(default = "default_max_permutations")]
    pub max_permutations: u64,

    /// Only sequences starting in a first-module detector are accepted.
    #[serde(default = "default_true")]
    pub start_in_first_module: bool,

    /// Reject events whose two best orderings tie within tolerance.
    #[serde(default)]
    pub reject_pure_ambiguities: bool,

    /// Score tolerance under which two orderings count as tied.
    #[serde(default = "default_ambiguity_tolerance")]
    pub ambiguity_tolerance: f64,

    /// Emit one incarnation per permutation, unscored, for external
    /// classifier training.
    #[serde(default)]
    pub only_create_permutations: bool,

    /// Chi-square scorer sub-mode.
    #[serde(default)]
    pub test_statistic: TestStatistic,

    /// Accept untracked two-site events.
    #[serde(default = "default_true")]
    pub use_comptel_type_events: bool,

    /// Reject events confined to a single detector type.
    #[serde(default = "default_true")]
    pub reject_one_detector_type_only: bool,

    /// Policy for two-site events where both orders are kinematically
    /// allowed.
    #[serde(default)]
    pub undecided_handling: UndecidedHandling,
}

impl Default for CsrConfig {
    fn default() -> Self {
        CsrConfig {
            algorithm: CsrAlgorithm::default(),
            threshold_min: 0.0,
            threshold_max: default_threshold_max(),
            max_hits: default_max_hits(),
            max_permutations: default_max_permutations(),
            start_in_first_module: true,
            reject_pure_ambiguities: false,
            ambiguity_tolerance: default_ambiguity_tolerance(),
            only_create_permutations: false,
            test_statistic: TestStatistic::default(),
            use_comptel_type_events: true,
            reject_one_detector_type_only: true,
            undecided_handling: UndecidedHandling::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CsrAlgorithm {
    None,
    #[default]
    ChiSquare,
    EnergyRecovery,
    TimeOfFlight,
    Classifier,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestStatistic {
    Simple,
    SimpleWithErrors,
    #[default]
    ChiSquare,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UndecidedHandling {
    #[default]
    Ignore,
    AssumeFirstModule,
    LargerKleinNishina,
    LargerKleinNishinaTimesPhoto,
    LargerEnergyDeposit,
}

fn default_threshold_max() -> f64 {
    1.0
}

fn default_max_hits() -> usize {
    4
}

fn default_max_permutations() -> u64 {
    50_000
}

fn default_ambiguity_tolerance() -> f64 {
    1e-9
}

/// Decay-line tagging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    #[serde(default)]
    pub algorithm: DecayAlgorithm,

    #[serde(default)]
    pub mode: DecayMode,

    /// JSON file with `[{"energy_kev": ..., "sigma_kev": ...}, ...]`.
    #[serde(default)]
    pub table_file: Option<String>,

    /// Additional inline lines as (energy, sigma) pairs in keV.
    #[serde(default)]
    pub lines: Vec<(f64, f64)>,
}

impl Default for DecayConfig {
    fn default() -> Self {
        DecayConfig {
            algorithm: DecayAlgorithm::default(),
            mode: DecayMode::default(),
            table_file: None,
            lines: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecayAlgorithm {
    #[default]
    None,
    Standard,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecayMode {
    AllCombinations,
    #[default]
    AllButOneCombination,
    SequenceEnd,
}

/// Event-level selection windows applied before the expensive stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Accepted total-energy window in keV.
    #[serde(default)]
    pub total_energy_min: f64,

    #[serde(default = "default_energy_max")]
    pub total_energy_max: f64,

    /// Accepted lever-arm window in cm, applied per raw event.
    #[serde(default)]
    pub lever_arm_min: f64,

    #[serde(default = "default_lever_arm_max")]
    pub lever_arm_max: f64,

    /// Accepted event-ID window; negative bounds disable the cut.
    #[serde(default = "default_id_open")]
    pub event_id_min: i64,

    #[serde(default = "default_id_open")]
    pub event_id_max: i64,

    /// Reject events the input flagged bad.
    #[serde(default = "default_true")]
    pub reject_flagged_bad: bool,

    /// Still emit best-try events as diagnostics when no optimum exists.
    #[serde(default)]
    pub emit_diagnostics: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            total_energy_min: 0.0,
            total_energy_max: default_energy_max(),
            lever_arm_min: 0.0,
            lever_arm_max: default_lever_arm_max(),
            event_id_min: default_id_open(),
            event_id_max: default_id_open(),
            reject_flagged_bad: true,
            emit_diagnostics: false,
        }
    }
}

fn default_energy_max() -> f64 {
    f64::MAX
}

fn default_lever_arm_max() -> f64 {
    f64::MAX
}

fn default_id_open() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_permissive() {
        let c = ReconstructionConfig::default();
        assert_eq!(c.csr.max_hits, 4);
        assert!(c.csr.start_in_first_module);
        assert_eq!(c.selection.event_id_min, -1);
        assert!(c.selection.total_energy_max > 1e100);
    }

    #[test]
    fn test_partial_json_overrides_only_named_fields() {
        let json = r#"{
            "csr": { "algorithm": "time_of_flight", "max_hits": 6 },
            "selection": { "total_energy_min": 100.0, "total_energy_max": 2000.0 }
        }"#;
        let c: ReconstructionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.csr.algorithm, CsrAlgorithm::TimeOfFlight);
        assert_eq!(c.csr.max_hits, 6);
        assert!((c.selection.total_energy_min - 100.0).abs() < 1e-12);
        // untouched sections keep defaults
        assert_eq!(c.clustering.algorithm, ClusteringAlgorithm::AdjacentVoxels);
        assert_eq!(c.coincidence.algorithm, CoincidenceAlgorithm::None);
    }

    #[test]
    fn test_distance_defaults_cover_all_detectors() {
        let d = default_min_distances();
        assert!((d[&DetectorType::Calorimeter] - 1.1).abs() < 1e-12);
        assert!((d[&DetectorType::Tracker2d] - 0.05).abs() < 1e-12);
    }
}
