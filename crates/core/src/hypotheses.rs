//! Hypothesis group: the competing raw-event interpretations of one
//! physical event.
//!
//! The group owns its raw events; the distinguished references are
//! indices into the owned vector, so removal can never leave a dangling
//! optimum or best-try. `initial` is set once when the event enters the
//! pipeline and never replaced; `optimum` only ever points at a good,
//! unrejected event, and setting it also sets `best_try`.

use crate::raw_event::RawEvent;

#[derive(Debug, Default)]
pub struct HypothesisGroup {
    events: Vec<RawEvent>,
    initial: Option<usize>,
    optimum: Option<usize>,
    best_try: Option<usize>,
}

impl HypothesisGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the first, unclustered incarnation, clearing any previous
    /// content.
    pub fn set_initial(&mut self, event: RawEvent) {
        self.events.clear();
        self.events.push(event);
        self.initial = Some(0);
        self.optimum = None;
        self.best_try = None;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [RawEvent] {
        &mut self.events
    }

    pub fn get(&self, index: usize) -> Option<&RawEvent> {
        self.events.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RawEvent> {
        self.events.get_mut(index)
    }

    /// Append a new incarnation and return its index.
    pub fn add(&mut self, event: RawEvent) -> usize {
        self.events.push(event);
        self.events.len() - 1
    }

    /// Remove an incarnation, fixing up the distinguished indices.
    pub fn remove(&mut self, index: usize) -> RawEvent {
        let fix = |slot: &mut Option<usize>| {
            *slot = match *slot {
                Some(i) if i == index => None,
                Some(i) if i > index => Some(i - 1),
                other => other,
            };
        };
        fix(&mut self.initial);
        fix(&mut self.optimum);
        fix(&mut self.best_try);
        self.events.remove(index)
    }

    pub fn initial(&self) -> Option<&RawEvent> {
        self.initial.map(|i| &self.events[i])
    }

    pub fn optimum(&self) -> Option<&RawEvent> {
        self.optimum.map(|i| &self.events[i])
    }

    pub fn optimum_mut(&mut self) -> Option<&mut RawEvent> {
        match self.optimum {
            Some(i) => self.events.get_mut(i),
            None => None,
        }
    }

    pub fn optimum_index(&self) -> Option<usize> {
        self.optimum
    }

    pub fn best_try(&self) -> Option<&RawEvent> {
        self.best_try.map(|i| &self.events[i])
    }

    pub fn has_optimum(&self) -> bool {
        self.optimum.is_some()
    }

    /// Declare the incarnation at `index` the optimum. Only good,
    /// unrejected events qualify; best-try follows the optimum.
    pub fn set_optimum(&mut self, index: usize) {
        debug_assert!(self.events[index].is_good());
        self.optimum = Some(index);
        self.best_try = Some(index);
    }

    pub fn clear_optimum(&mut self) {
        self.optimum = None;
    }

    /// Record the most complete attempt so far; kept even when no
    /// optimum is ever found, for diagnostic emission.
    pub fn set_best_try(&mut self, index: usize) {
        debug_assert!(index < self.events.len());
        self.best_try = Some(index);
    }

    /// True while at least one incarnation is still unrejected.
    pub fn any_valid(&self) -> bool {
        self.events.iter().any(|e| !e.is_rejected())
    }

    /// Rank incarnations by track quality (ascending when `good_are_low`).
    pub fn sort_by_track_quality(&mut self, good_are_low: bool) {
        // Sorting invalidates positional references; re-derive them below.
        let initial_id = self.initial.map(|i| self.events[i].event_id);
        let keep = |e: &RawEvent| e.track_quality.unwrap_or(f64::INFINITY);
        if good_are_low {
            self.events
                .sort_by(|a, b| keep(a).total_cmp(&keep(b)).then(a.event_id.cmp(&b.event_id)));
        } else {
            self.events
                .sort_by(|a, b| keep(b).total_cmp(&keep(a)).then(a.event_id.cmp(&b.event_id)));
        }
        self.initial = initial_id
            .and_then(|id| self.events.iter().position(|e| e.event_id == id));
        self.optimum = None;
        self.best_try = None;
    }
}
