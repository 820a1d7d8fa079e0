// ============================================================================
// Market Resolve Module - Resolution & Disputes
// ============================================================================
//
//   - engine: pure resolution function (first submission / plurality vote)
//   - evidence: per-mode evidence shapes and ORACLE provenance checks
//   - workflow: submission, approval gate, applying a resolution
//   - dispute: filing and adjudicating disputes within the window
//
// ============================================================================

pub mod dispute;
pub mod engine;
pub mod evidence;
pub mod workflow;

pub use dispute::{adjudicate_dispute, file_dispute, pending_disputes, DisputeRequest};
pub use engine::{canonical_hash, resolve, Resolution, ResolutionContext, OPINION_DISCLAIMER};
pub use evidence::Evidence;
pub use workflow::{approve_submission, submit_resolution, ResolutionOutcome, ResolutionRequest};
