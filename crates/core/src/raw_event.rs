//! Raw event: one candidate reconstruction of a physical event.
//!
//! A raw event owns an ordered sequence of RESEs. Stages reorder, merge,
//! split and annotate it; a rejection reason, once set, is permanent
//! (first rejection wins) and bars the event from ever becoming the
//! optimum.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::kinematics::ELECTRON_MASS_KEV;
use crate::rese::Rese;

/// Resolved physical interpretation of a raw event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Unknown,
    /// Single-site absorption.
    Photo,
    Compton,
    Pair,
    Muon,
    Unidentifiable,
}

/// Why a raw event was taken out of the running. Exactly one reason per
/// rejected event; the first one set wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    None,
    TooManyHitsCsr,
    OneDetectorTypeOnly,
    OneTrackOnly,
    TwoTracksOnly,
    TrackNotValid,
    TooManyHits,
    StartNotInFirstModule,
    StartUndecided,
    ElectronDirectionBad,
    CsrThreshold,
    CsrNoGoodCombination,
    ComptelType,
    ComptelKinematicsBad,
    NoHits,
    TotalEnergyOutOfLimits,
    LeverArmOutOfLimits,
    EventIdOutOfLimits,
    TooManyUndecidedTrackElements,
    ExternalBadFlag,
    TooManyIncarnations,
    StripPairingUnresolvable,
}

impl RejectionReason {
    /// All reasons in reporting order, for the run-end breakdown.
    pub const ALL: [RejectionReason; 22] = [
        RejectionReason::None,
        RejectionReason::TooManyHitsCsr,
        RejectionReason::OneDetectorTypeOnly,
        RejectionReason::OneTrackOnly,
        RejectionReason::TwoTracksOnly,
        RejectionReason::TrackNotValid,
        RejectionReason::TooManyHits,
        RejectionReason::StartNotInFirstModule,
        RejectionReason::StartUndecided,
        RejectionReason::ElectronDirectionBad,
        RejectionReason::CsrThreshold,
        RejectionReason::CsrNoGoodCombination,
        RejectionReason::ComptelType,
        RejectionReason::ComptelKinematicsBad,
        RejectionReason::NoHits,
        RejectionReason::TotalEnergyOutOfLimits,
        RejectionReason::LeverArmOutOfLimits,
        RejectionReason::EventIdOutOfLimits,
        RejectionReason::TooManyUndecidedTrackElements,
        RejectionReason::ExternalBadFlag,
        RejectionReason::TooManyIncarnations,
        RejectionReason::StripPairingUnresolvable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::None => "not rejected",
            RejectionReason::TooManyHitsCsr => "too many hits for sequencing",
            RejectionReason::OneDetectorTypeOnly => "all hits in one detector type",
            RejectionReason::OneTrackOnly => "event is one track only",
            RejectionReason::TwoTracksOnly => "event is two tracks only",
            RejectionReason::TrackNotValid => "track not valid",
            RejectionReason::TooManyHits => "too many hits",
            RejectionReason::StartNotInFirstModule => "sequence does not start in first module",
            RejectionReason::StartUndecided => "sequence start undecided",
            RejectionReason::ElectronDirectionBad => "electron direction test failed",
            RejectionReason::CsrThreshold => "sequence quality outside threshold window",
            RejectionReason::CsrNoGoodCombination => "no admissible sequence found",
            RejectionReason::ComptelType => "untracked two-site event not accepted",
            RejectionReason::ComptelKinematicsBad => "two-site kinematics incompatible",
            RejectionReason::NoHits => "event without hits",
            RejectionReason::TotalEnergyOutOfLimits => "total energy out of window",
            RejectionReason::LeverArmOutOfLimits => "lever arm out of window",
            RejectionReason::EventIdOutOfLimits => "event id out of window",
            RejectionReason::TooManyUndecidedTrackElements => "too many undecided track elements",
            RejectionReason::ExternalBadFlag => "externally flagged bad",
            RejectionReason::TooManyIncarnations => "too many simultaneous incarnations",
            RejectionReason::StripPairingUnresolvable => "strip pairing unresolvable",
        }
    }
}

/// One candidate reconstruction: an ordered RESE sequence plus the
/// bookkeeping the stages attach to it.
#[derive(Debug, Clone)]
pub struct RawEvent {
    reses: Vec<Rese>,
    pub event_id: u64,
    pub event_time: f64,
    rejection: RejectionReason,
    pub event_type: EventType,
    good: bool,
    pub reconstructed: bool,
    /// Index of the sequence start once ordered.
    pub start_index: Option<usize>,
    /// Best and runner-up sequence quality (lower is better).
    pub quality: Option<f64>,
    pub second_quality: Option<f64>,
    /// Track-hypothesis ranking score from the tracker stage.
    pub track_quality: Option<f64>,
    /// Energy estimated to have escaped the detector.
    pub escaped_energy: f64,
    /// Matches a known decay line combination.
    pub decay: bool,
    pub external_bad: bool,
    pub external_bad_reason: Option<String>,
}

impl RawEvent {
    pub fn new(event_id: u64, event_time: f64) -> Self {
        RawEvent {
            reses: Vec::new(),
            event_id,
            event_time,
            rejection: RejectionReason::None,
            event_type: EventType::Unknown,
            good: false,
            reconstructed: false,
            start_index: None,
            quality: None,
            second_quality: None,
            track_quality: None,
            escaped_energy: 0.0,
            decay: false,
            external_bad: false,
            external_bad_reason: None,
        }
    }

    pub fn with_reses(event_id: u64, event_time: f64, reses: Vec<Rese>) -> Self {
        let mut re = RawEvent::new(event_id, event_time);
        re.reses = reses;
        re
    }

    pub fn reses(&self) -> &[Rese] {
        &self.reses
    }

    pub fn len(&self) -> usize {
        self.reses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reses.is_empty()
    }

    pub fn push(&mut self, rese: Rese) {
        self.reses.push(rese);
    }

    /// Remove and return the RESE at `index`, dropping nothing else.
    pub fn take(&mut self, index: usize) -> Rese {
        self.reses.remove(index)
    }

    /// Replace the whole sequence.
    pub fn replace_reses(&mut self, reses: Vec<Rese>) {
        self.reses = reses;
    }

    /// Reorder the owned sequence to the given index permutation.
    pub fn reorder(&mut self, permutation: &[usize]) {
        debug_assert_eq!(permutation.len(), self.reses.len());
        let mut taken: Vec<Option<Rese>> = self.reses.drain(..).map(Some).collect();
        self.reses = permutation
            .iter()
            .map(|&i| taken[i].take().expect("index used twice in permutation"))
            .collect();
    }

    pub fn rejection(&self) -> RejectionReason {
        self.rejection
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection != RejectionReason::None
    }

    /// Record a rejection. The first reason sticks; later calls are
    /// ignored so earlier stages cannot be overruled.
    pub fn reject(&mut self, reason: RejectionReason) {
        if self.rejection == RejectionReason::None && reason != RejectionReason::None {
            self.rejection = reason;
            self.good = false;
        }
    }

    pub fn is_good(&self) -> bool {
        self.good && !self.is_rejected()
    }

    /// Mark the event fully reconstructed and valid. Refused for
    /// rejected events.
    pub fn set_good(&mut self, good: bool) {
        if good && self.is_rejected() {
            return;
        }
        self.good = good;
    }

    /// Total deposited energy, including any escaped-energy estimate.
    pub fn total_energy(&self) -> f64 {
        self.reses.iter().map(|r| r.energy).sum::<f64>() + self.escaped_energy
    }

    /// Combined one-sigma energy resolution of all deposits.
    pub fn energy_resolution(&self) -> f64 {
        self.reses
            .iter()
            .map(|r| r.energy_resolution * r.energy_resolution)
            .sum::<f64>()
            .sqrt()
    }

    /// Smallest and largest distance between any two RESEs, or `None`
    /// for fewer than two sites.
    pub fn lever_arm_range(&self) -> Option<(f64, f64)> {
        if self.reses.len() < 2 {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = 0.0_f64;
        for i in 0..self.reses.len() {
            for j in (i + 1)..self.reses.len() {
                let d = self.reses[i].center_distance(&self.reses[j]);
                min = min.min(d);
                max = max.max(d);
            }
        }
        Some((min, max))
    }

    /// Scatter angles along the ordered sequence (one per inner vertex).
    pub fn scatter_angles(&self) -> Vec<f64> {
        let mut angles = Vec::new();
        for i in 1..self.reses.len().saturating_sub(1) {
            let incoming: Vector3<f64> = self.reses[i].position - self.reses[i - 1].position;
            let outgoing: Vector3<f64> = self.reses[i + 1].position - self.reses[i].position;
            angles.push(incoming.angle(&outgoing));
        }
        angles
    }

    /// Elementary direction test when the sequence starts with an
    /// electron track: the recoil-electron angle must be computable and
    /// must not point backward.
    ///
    /// `e1` is the first deposit, `e2` the remaining energy including
    /// any escaped-energy estimate.
    pub fn test_electron_direction(&self, e1: f64, e2: f64) -> bool {
        if e1 <= 0.0 || e2 <= 0.0 {
            return false;
        }
        let e0 = ELECTRON_MASS_KEV;

        let cos_phi = 1.0 - e0 * (1.0 / e2 - 1.0 / (e1 + e2));
        if cos_phi <= -1.0 || cos_phi >= 1.0 {
            return false;
        }

        let cos_theta = (e1 * (e1 + e2 + e0)) / ((e1 + e2) * (e1 * (e1 + 2.0 * e0)).sqrt());
        if cos_theta <= -1.0 || cos_theta >= 1.0 {
            return false;
        }

        // Back-scattered electrons are unphysical for a forward sequence.
        cos_theta.acos() <= std::f64::consts::FRAC_PI_2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rese::DetectorType;

    fn hit(id: u32, z: f64, energy: f64) -> Rese {
        Rese::hit(id, Vector3::new(0.0, 0.0, z), energy, DetectorType::Tracker2d)
    }

    #[test]
    fn test_first_rejection_wins() {
        let mut re = RawEvent::new(1, 0.0);
        re.reject(RejectionReason::TotalEnergyOutOfLimits);
        re.reject(RejectionReason::CsrThreshold);
        assert_eq!(re.rejection(), RejectionReason::TotalEnergyOutOfLimits);
    }

    #[test]
    fn test_rejected_event_cannot_become_good() {
        let mut re = RawEvent::new(1, 0.0);
        re.reject(RejectionReason::NoHits);
        re.set_good(true);
        assert!(!re.is_good());
    }

    #[test]
    fn test_reorder_permutes_ownership() {
        let mut re =
            RawEvent::with_reses(1, 0.0, vec![hit(10, 0.0, 1.0), hit(11, 1.0, 2.0), hit(12, 2.0, 3.0)]);
        re.reorder(&[2, 0, 1]);
        let ids: Vec<u32> = re.reses().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![12, 10, 11]);
    }

    #[test]
    fn test_lever_arm_range() {
        let re = RawEvent::with_reses(
            1,
            0.0,
            vec![hit(1, 0.0, 1.0), hit(2, 1.0, 1.0), hit(3, 5.0, 1.0)],
        );
        let (min, max) = re.lever_arm_range().unwrap();
        assert!((min - 1.0).abs() < 1e-12);
        assert!((max - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_total_energy_includes_escape() {
        let mut re = RawEvent::with_reses(1, 0.0, vec![hit(1, 0.0, 100.0), hit(2, 1.0, 50.0)]);
        re.escaped_energy = 25.0;
        assert!((re.total_energy() - 175.0).abs() < 1e-12);
    }

    #[test]
    fn test_electron_direction_needs_forward_recoil() {
        let re = RawEvent::new(1, 0.0);
        assert!(re.test_electron_direction(150.0, 362.0));
        assert!(!re.test_electron_direction(150.0, 0.0));
    }
}
