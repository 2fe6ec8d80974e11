//! The reconstruction stage contract.

use recon_core::{HypothesisGroup, SetupError};

/// One stage of the reconstruction pipeline.
///
/// `analyze` mutates the hypothesis group in place: it may add
/// incarnations (splitting one interpretation into several), remove the
/// ones it replaces, and reject individual raw events by setting their
/// rejection reason. It must cope with zero, one, or many raw events in
/// the group. `Err` is reserved for configuration problems; a rejected
/// event is a successful analysis.
pub trait ReconstructionStage {
    fn analyze(&mut self, group: &mut HypothesisGroup) -> Result<(), SetupError>;

    /// One-line-per-parameter configuration dump for run provenance.
    fn describe(&self) -> String;

    /// Expensive one-time setup (loading tables, training files).
    fn pre_analysis(&mut self) -> Result<(), SetupError> {
        Ok(())
    }

    /// One-time teardown; returns a summary block for the footer.
    fn post_analysis(&mut self) -> String {
        String::new()
    }
}
