//! Run statistics: what happened to every event, and why the missing
//! ones are missing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use recon_core::{PhysicalEvent, PhysicalEventKind, RejectionReason};

/// Per-run counters. Merging across independently processed shards is
/// an order-independent sum.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStatistics {
    pub events: u64,
    pub passed_selection: u64,
    pub good: u64,
    pub photo: u64,
    pub compton: u64,
    pub decay: u64,
    pub pair: u64,
    pub muon: u64,
    pub unidentifiable: u64,
    pub structural_anomalies: u64,
    pub rejections: BTreeMap<RejectionReason, u64>,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one emitted physical event.
    pub fn count_physical(&mut self, event: &PhysicalEvent) {
        match &event.kind {
            PhysicalEventKind::Photo { .. } => {
                self.good += 1;
                self.photo += 1;
            }
            PhysicalEventKind::Compton { decay, .. } => {
                self.good += 1;
                self.compton += 1;
                if *decay {
                    self.decay += 1;
                }
            }
            PhysicalEventKind::Pair { .. } => {
                self.good += 1;
                self.pair += 1;
            }
            PhysicalEventKind::Muon { .. } => {
                self.good += 1;
                self.muon += 1;
            }
            PhysicalEventKind::Unidentifiable { .. } => {
                self.unidentifiable += 1;
            }
        }
    }

    pub fn count_rejection(&mut self, reason: RejectionReason) {
        *self.rejections.entry(reason).or_insert(0) += 1;
    }

    /// Order-independent counter sum for joining worker shards.
    pub fn merge(&mut self, other: &RunStatistics) {
        self.events += other.events;
        self.passed_selection += other.passed_selection;
        self.good += other.good;
        self.photo += other.photo;
        self.compton += other.compton;
        self.decay += other.decay;
        self.pair += other.pair;
        self.muon += other.muon;
        self.unidentifiable += other.unidentifiable;
        self.structural_anomalies += other.structural_anomalies;
        for (reason, count) in &other.rejections {
            *self.rejections.entry(*reason).or_insert(0) += count;
        }
    }

    /// Human-readable run summary block.
    pub fn report(&self) -> String {
        let pct = |part: u64, whole: u64| {
            if whole == 0 {
                0.0
            } else {
                100.0 * part as f64 / whole as f64
            }
        };

        let mut out = String::new();
        out.push_str("Event statistics for all triggered events:\n");
        out.push_str(&format!(
            "  Number of events ............................ {:6} (100.000%)\n",
            self.events
        ));
        out.push_str(&format!(
            "  Events passing selections ................... {:6} ({:7.3}%)\n",
            self.passed_selection,
            pct(self.passed_selection, self.events)
        ));
        out.push_str(&format!(
            "  Reconstructable events ...................... {:6} ({:7.3}%)\n",
            self.good,
            pct(self.good, self.events)
        ));
        out.push_str(&format!(
            "      Single-site ............................. {:6} ({:7.3}%)\n",
            self.photo,
            pct(self.photo, self.good)
        ));
        out.push_str(&format!(
            "      Compton ................................. {:6} ({:7.3}%)\n",
            self.compton,
            pct(self.compton, self.good)
        ));
        out.push_str(&format!(
            "          Decay ............................... {:6} ({:7.3}%)\n",
            self.decay,
            pct(self.decay, self.compton)
        ));
        out.push_str(&format!(
            "      Pair .................................... {:6} ({:7.3}%)\n",
            self.pair,
            pct(self.pair, self.good)
        ));
        out.push_str(&format!(
            "      Muon .................................... {:6} ({:7.3}%)\n",
            self.muon,
            pct(self.muon, self.good)
        ));
        out.push('\n');

        out.push_str("Rejection reasons for not reconstructable events:\n");
        let mut total = 0;
        for reason in RejectionReason::ALL {
            if let Some(&count) = self.rejections.get(&reason) {
                if count > 0 {
                    let label = reason.as_str();
                    out.push_str(&format!("  {label} "));
                    for _ in label.len()..55 {
                        out.push('.');
                    }
                    out.push_str(&format!(" {count:6}\n"));
                    total += count;
                }
            }
        }
        out.push_str(&format!(
            "    Total ..................................... {total:6}\n"
        ));
        if self.structural_anomalies > 0 {
            out.push_str(&format!(
                "    Structural anomalies ...................... {:6}\n",
                self.structural_anomalies
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_a_plain_sum() {
        let mut a = RunStatistics::new();
        a.events = 10;
        a.good = 4;
        a.compton = 3;
        a.count_rejection(RejectionReason::CsrThreshold);
        a.count_rejection(RejectionReason::CsrThreshold);

        let mut b = RunStatistics::new();
        b.events = 5;
        b.good = 2;
        b.compton = 2;
        b.count_rejection(RejectionReason::CsrThreshold);
        b.count_rejection(RejectionReason::NoHits);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.events, 15);
        assert_eq!(ab.rejections[&RejectionReason::CsrThreshold], 3);
        assert_eq!(ab.rejections[&RejectionReason::NoHits], 1);
    }

    #[test]
    fn test_report_lists_rejections() {
        let mut s = RunStatistics::new();
        s.events = 3;
        s.count_rejection(RejectionReason::TotalEnergyOutOfLimits);

        let report = s.report();
        assert!(report.contains("total energy out of window"));
        assert!(report.contains("Number of events"));
    }
}
