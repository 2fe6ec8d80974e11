//! The pipeline orchestrator.
//!
//! Drives one physical event at a time through the fixed stage order
//! (coincidence, selection filters, clustering, tracking, lever-arm
//! filter, Compton sequencing, decay tagging), then emits the winning
//! interpretation or records the rejection. Stage objects are built
//! once in `pre_analysis`; running with a configured-but-unbuilt stage
//! is a fatal configuration error, never a per-event rejection.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use recon_core::{
    Geometry, HypothesisGroup, PhysicalEvent, RawEvent, RejectionReason, SetupError,
};

use crate::clusterize::Clusterizer;
use crate::coincidence::Coincidence;
use crate::config::{
    ClusteringAlgorithm, CoincidenceAlgorithm, CsrAlgorithm, DecayAlgorithm, ReconstructionConfig,
    TrackingAlgorithm,
};
use crate::csr::{CsrEngine, SequenceClassifier};
use crate::decay::DecayTagger;
use crate::sink::EventSink;
use crate::source::{EventStore, HitSource};
use crate::stage::ReconstructionStage;
use crate::statistics::RunStatistics;
use crate::track::Tracker;

/// Outcome of one `analyze_event` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    /// One event was fully processed (emitted or rejected).
    Ok,
    /// The coincidence window is still open; feed more input.
    CoincidenceWait,
    /// Nothing buffered to analyze.
    NoEventsInStore,
    /// The source is exhausted and the buffer is drained.
    NoEventsLeft,
    /// The sink refused the event.
    SavingFailed,
}

pub struct RawEventAnalyzer {
    config: ReconstructionConfig,
    geometry: Arc<dyn Geometry>,

    reader: Option<Box<dyn HitSource>>,
    store: EventStore,
    sink: Option<Box<dyn EventSink>>,

    coincidence: Option<Coincidence>,
    clusterizer: Option<Clusterizer>,
    tracker: Option<Tracker>,
    csr: Option<CsrEngine>,
    decay: Option<DecayTagger>,
    classifier: Option<Box<dyn SequenceClassifier>>,

    hypotheses: HypothesisGroup,
    initial_event: Option<RawEvent>,
    statistics: RunStatistics,
    prepared: bool,
}

impl RawEventAnalyzer {
    pub fn new(config: ReconstructionConfig, geometry: Arc<dyn Geometry>) -> Self {
        RawEventAnalyzer {
            config,
            geometry,
            reader: None,
            store: EventStore::new(),
            sink: None,
            coincidence: None,
            clusterizer: None,
            tracker: None,
            csr: None,
            decay: None,
            classifier: None,
            hypotheses: HypothesisGroup::new(),
            initial_event: None,
            statistics: RunStatistics::new(),
            prepared: false,
        }
    }

    /// Attach a live hit source. Events can instead be pre-loaded with
    /// [`add_raw_event`](Self::add_raw_event).
    pub fn set_source(&mut self, reader: Box<dyn HitSource>) {
        self.reader = Some(reader);
    }

    pub fn set_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sink = Some(sink);
    }

    /// Install the external classifier back-end for CSR.
    pub fn set_classifier(&mut self, classifier: Box<dyn SequenceClassifier>) {
        self.classifier = Some(classifier);
    }

    /// Feed one raw hit list into the in-memory store.
    pub fn add_raw_event(&mut self, event: RawEvent) {
        self.store.push(event);
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.statistics
    }

    /// Join another worker's counters into this one.
    pub fn join_statistics(&mut self, other: &RunStatistics) {
        self.statistics.merge(other);
    }

    /// Hypothesis group of the most recently analyzed event.
    pub fn hypotheses(&self) -> &HypothesisGroup {
        &self.hypotheses
    }

    /// The unclustered event as it entered the pipeline.
    pub fn initial_event(&self) -> Option<&RawEvent> {
        self.initial_event.as_ref()
    }

    pub fn csr_engine(&self) -> Option<&CsrEngine> {
        self.csr.as_ref()
    }

    pub fn take_sink(&mut self) -> Option<Box<dyn EventSink>> {
        self.sink.take()
    }

    /// Build every configured stage. Must run before `analyze_event`
    /// whenever the configuration changed.
    pub fn pre_analysis(&mut self) -> Result<(), SetupError> {
        self.statistics = RunStatistics::new();

        self.coincidence = match self.config.coincidence.algorithm {
            CoincidenceAlgorithm::None | CoincidenceAlgorithm::Window => {
                Some(Coincidence::new(self.config.coincidence.clone()))
            }
        };

        self.clusterizer = match self.config.clustering.algorithm {
            ClusteringAlgorithm::None => None,
            _ => {
                let mut stage =
                    Clusterizer::new(self.config.clustering.clone(), self.geometry.clone());
                stage.pre_analysis()?;
                Some(stage)
            }
        };

        self.tracker = match self.config.tracking.algorithm {
            TrackingAlgorithm::None => None,
            TrackingAlgorithm::Directional => {
                let mut stage = Tracker::new(self.config.tracking.clone(), self.geometry.clone());
                stage.pre_analysis()?;
                Some(stage)
            }
        };

        self.csr = match self.config.csr.algorithm {
            CsrAlgorithm::None => None,
            CsrAlgorithm::Classifier => {
                let classifier = self.classifier.take().ok_or_else(|| {
                    SetupError::InvalidParameter(
                        "classifier CSR configured but no classifier installed".into(),
                    )
                })?;
                let mut stage = CsrEngine::with_classifier(
                    self.config.csr.clone(),
                    self.geometry.clone(),
                    classifier,
                );
                stage.pre_analysis()?;
                Some(stage)
            }
            _ => {
                let mut stage = CsrEngine::new(self.config.csr.clone(), self.geometry.clone())?;
                stage.pre_analysis()?;
                Some(stage)
            }
        };

        self.decay = match self.config.decay.algorithm {
            DecayAlgorithm::None => None,
            DecayAlgorithm::Standard => {
                let mut stage = DecayTagger::new(self.config.decay.clone());
                stage.pre_analysis()?;
                Some(stage)
            }
        };

        self.prepared = true;
        Ok(())
    }

    /// Process the next event through the full pipeline.
    pub fn analyze_event(&mut self) -> Result<AnalysisStatus, SetupError> {
        if !self.prepared {
            return Err(SetupError::StageNotInitialized("analyzer"));
        }

        // Acquire: pull from the reader when attached; a drained reader
        // switches the coincidence search into flush mode.
        let mut flush = self.reader.is_none();
        if let Some(reader) = self.reader.as_mut() {
            match reader.next_event() {
                Some(event) => self.store.push(event),
                None => {
                    flush = true;
                    if self.store.is_empty() {
                        return Ok(AnalysisStatus::NoEventsLeft);
                    }
                }
            }
        }

        if self.store.is_empty() {
            return Ok(AnalysisStatus::NoEventsInStore);
        }

        // Coincidence gate.
        let coincidence = self
            .coincidence
            .as_ref()
            .ok_or(SetupError::StageNotInitialized("coincidence"))?;
        let event = match coincidence.search(&mut self.store, flush) {
            Some(event) => event,
            None => {
                if self.store.is_empty() {
                    return Ok(AnalysisStatus::NoEventsInStore);
                }
                return Ok(AnalysisStatus::CoincidenceWait);
            }
        };

        debug!(event = event.event_id, hits = event.len(), "analyzing event");
        self.initial_event = Some(event.clone());
        self.hypotheses.set_initial(event);

        // Selection filters: cheap gates before the expensive stages.
        let mut selections_passed = self.apply_selections();

        // Hit clustering.
        if selections_passed && self.config.clustering.algorithm != ClusteringAlgorithm::None {
            let clusterizer = self
                .clusterizer
                .as_mut()
                .ok_or(SetupError::StageNotInitialized("clusterizer"))?;
            clusterizer.analyze(&mut self.hypotheses)?;
            if self.hypotheses.len() != 1 {
                warn!(
                    survivors = self.hypotheses.len(),
                    "expected exactly one event after clustering"
                );
                self.statistics.structural_anomalies += 1;
            }
            if !self.hypotheses.is_empty() {
                self.hypotheses.set_best_try(0);
            }
            selections_passed &= self.hypotheses.any_valid();
        }

        // Tracking: may fan one interpretation out into several, or
        // finish the event outright (pair, muon).
        if selections_passed && self.config.tracking.algorithm != TrackingAlgorithm::None {
            let tracker = self
                .tracker
                .as_mut()
                .ok_or(SetupError::StageNotInitialized("tracker"))?;
            tracker.analyze(&mut self.hypotheses)?;
            selections_passed &= self.hypotheses.any_valid();
        }

        // Lever-arm window, per surviving interpretation.
        if selections_passed {
            self.apply_lever_arm_filter();
            selections_passed &= self.hypotheses.any_valid();
        }

        // Compton sequencing, unless tracking already found the optimum.
        if selections_passed
            && self.config.csr.algorithm != CsrAlgorithm::None
            && !self.hypotheses.has_optimum()
        {
            let csr = self
                .csr
                .as_mut()
                .ok_or(SetupError::StageNotInitialized("csr"))?;
            csr.analyze(&mut self.hypotheses)?;
            selections_passed &= self.hypotheses.any_valid();
        }

        // Decay tagging annotates, never re-ranks.
        if selections_passed && self.config.decay.algorithm != DecayAlgorithm::None {
            let decay = self
                .decay
                .as_mut()
                .ok_or(SetupError::StageNotInitialized("decay"))?;
            decay.analyze(&mut self.hypotheses)?;
        }

        // Emit or account.
        let status = self.emit();

        self.statistics.events += 1;
        if selections_passed {
            self.statistics.passed_selection += 1;
        }

        Ok(status)
    }

    /// Run until the source is exhausted. Returns the number of fully
    /// processed events.
    pub fn analyze_all(&mut self) -> Result<u64, SetupError> {
        let mut processed = 0;
        loop {
            match self.analyze_event()? {
                AnalysisStatus::Ok | AnalysisStatus::SavingFailed => processed += 1,
                AnalysisStatus::CoincidenceWait => continue,
                AnalysisStatus::NoEventsInStore | AnalysisStatus::NoEventsLeft => break,
            }
        }
        Ok(processed)
    }

    fn apply_selections(&mut self) -> bool {
        let selection = &self.config.selection;
        let Some(event) = self.hypotheses.get_mut(0) else {
            return false;
        };

        if event.external_bad && selection.reject_flagged_bad {
            debug!(
                event = event.event_id,
                reason = event.external_bad_reason.as_deref().unwrap_or(""),
                "selection: external bad flag"
            );
            event.reject(RejectionReason::ExternalBadFlag);
            return false;
        }

        let id = event.event_id as i64;
        if (selection.event_id_min >= 0 && id < selection.event_id_min)
            || (selection.event_id_max >= 0 && id > selection.event_id_max)
        {
            debug!(event = event.event_id, "selection: event id out of window");
            event.reject(RejectionReason::EventIdOutOfLimits);
            return false;
        }

        let energy = event.total_energy();
        if energy < selection.total_energy_min || energy > selection.total_energy_max {
            debug!(
                event = event.event_id,
                energy, "selection: total energy out of window"
            );
            event.reject(RejectionReason::TotalEnergyOutOfLimits);
            return false;
        }

        true
    }

    fn apply_lever_arm_filter(&mut self) {
        let min_allowed = self.config.selection.lever_arm_min;
        let max_allowed = self.config.selection.lever_arm_max;
        for event in self.hypotheses.events_mut() {
            if event.is_rejected() {
                continue;
            }
            if let Some((min, max)) = event.lever_arm_range() {
                if min < min_allowed || max > max_allowed {
                    debug!(
                        event = event.event_id,
                        min, max, "lever arm out of window"
                    );
                    event.reject(RejectionReason::LeverArmOutOfLimits);
                }
            }
        }
    }

    fn emit(&mut self) -> AnalysisStatus {
        let physical = if let Some(optimum) = self.hypotheses.optimum() {
            Some(PhysicalEvent::from_raw(optimum))
        } else if let Some(best_try) = self.hypotheses.best_try() {
            // No winner: book the reason, optionally still emit the
            // diagnostic record.
            self.statistics.count_rejection(best_try.rejection());
            self.statistics.unidentifiable += 1;
            if self.config.selection.emit_diagnostics {
                Some(PhysicalEvent::from_raw(best_try))
            } else {
                None
            }
        } else if let Some(initial) = self.hypotheses.get(0) {
            self.statistics.count_rejection(initial.rejection());
            self.statistics.unidentifiable += 1;
            if self.config.selection.emit_diagnostics {
                Some(PhysicalEvent::from_raw(initial))
            } else {
                None
            }
        } else {
            None
        };

        let Some(physical) = physical else {
            return AnalysisStatus::Ok;
        };

        if physical.is_identified() {
            self.statistics.count_physical(&physical);
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.emit(physical) {
                warn!(error = %e, "sink refused event");
                return AnalysisStatus::SavingFailed;
            }
        }
        AnalysisStatus::Ok
    }

    /// Close the run: render the provenance footer, hand it to the
    /// sink, and return it.
    pub fn post_analysis(&mut self) -> Result<String, SetupError> {
        let mut out = String::new();
        out.push_str(&format!(
            "Reconstruction run finished {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(
            "---------------------------------------------------------------------------\n",
        );

        if let Some(stage) = &self.coincidence {
            out.push_str(&stage.describe());
        }
        if let Some(stage) = &self.clusterizer {
            out.push_str(&stage.describe());
        }
        if let Some(stage) = &self.tracker {
            out.push_str(&stage.describe());
        }
        if let Some(stage) = &self.csr {
            out.push_str(&stage.describe());
        }
        if let Some(stage) = &self.decay {
            out.push_str(&stage.describe());
        }

        out.push_str(
            "---------------------------------------------------------------------------\n",
        );
        out.push_str(&self.statistics.report());

        if let Some(stage) = self.decay.as_mut() {
            let summary = stage.post_analysis();
            if !summary.is_empty() {
                out.push('\n');
                out.push_str(&summary);
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.footer(&out) {
                warn!(error = %e, "sink refused footer");
            }
        }

        Ok(out)
    }
}
