// ============================================================================
// RESOLUTION ENGINE
// ============================================================================
//
// Pure function from (market context, submissions) to a resolution with an
// auditable trace. No clock, no randomness, no I/O: the same inputs in any
// order produce the same trace and hash.
//
// ORACLE / AUTHORITY → first submission wins, must name a declared outcome
// OPINION            → plurality over "<label>:<SIDE>" votes, ties go to the
//                      lexically smallest key
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::models::{ResolutionMode, Side};

pub const OPINION_DISCLAIMER: &str =
    "This result reflects the opinion of participating voters and is not a statement of external truth.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionContext {
    pub market_id: String,
    pub option_id: String,
    pub mode: ResolutionMode,
    pub declared_outcomes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSubmission {
    pub submitter: String,
    pub outcome: String,
    pub winning_side: Side,
    pub evidence_hash: String,
    pub submitted_at: DateTime<Utc>,
}

impl EngineSubmission {
    fn vote_key(&self) -> String {
        format!("{}:{}", self.outcome, self.winning_side)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub final_outcome: String,
    pub winning_side: Side,
    pub mode: ResolutionMode,
    pub trace: Value,
    pub canonical_hash: String,
}

pub fn resolve(ctx: &ResolutionContext, submissions: &[EngineSubmission]) -> EngineResult<Resolution> {
    if submissions.is_empty() {
        return Err(EngineError::Validation(format!(
            "no submissions to resolve option {}",
            ctx.option_id
        )));
    }
    match ctx.mode {
        ResolutionMode::Oracle | ResolutionMode::Authority => resolve_first(ctx, submissions),
        ResolutionMode::Opinion => resolve_plurality(ctx, submissions),
    }
}

fn resolve_first(ctx: &ResolutionContext, submissions: &[EngineSubmission]) -> EngineResult<Resolution> {
    let first = &submissions[0];
    if !ctx.declared_outcomes.iter().any(|o| o == &first.outcome) {
        return Err(EngineError::Validation(format!(
            "outcome '{}' is not declared for option {}",
            first.outcome, ctx.option_id
        )));
    }

    let trace = base_trace(ctx)
        .chain([
            ("outcome".to_string(), json!(first.outcome)),
            ("winning_side".to_string(), json!(first.winning_side)),
            ("submitter".to_string(), json!(first.submitter)),
            ("evidence_hash".to_string(), json!(first.evidence_hash)),
            ("submitted_at".to_string(), json!(first.submitted_at.to_rfc3339())),
            ("submission_count".to_string(), json!(submissions.len())),
        ])
        .collect::<Map<String, Value>>();

    Ok(finish(ctx, first.outcome.clone(), first.winning_side, trace))
}

fn resolve_plurality(ctx: &ResolutionContext, submissions: &[EngineSubmission]) -> EngineResult<Resolution> {
    let mut counts: BTreeMap<String, (u64, &EngineSubmission)> = BTreeMap::new();
    let mut ignored = 0u64;
    for submission in submissions {
        if !ctx.declared_outcomes.iter().any(|o| o == &submission.outcome) {
            ignored += 1;
            continue;
        }
        counts
            .entry(submission.vote_key())
            .and_modify(|(n, _)| *n += 1)
            .or_insert((1, submission));
    }

    // BTreeMap iterates keys in order, so a strict > keeps the smallest key on ties
    let mut winner: Option<(&String, u64, &EngineSubmission)> = None;
    for (key, (count, sample)) in &counts {
        if winner.map_or(true, |(_, best, _)| *count > best) {
            winner = Some((key, *count, *sample));
        }
    }
    let (winning_key, winning_votes, sample) = winner.ok_or_else(|| {
        EngineError::Validation(format!("no valid votes for option {}", ctx.option_id))
    })?;

    let snapshot_at = submissions.iter().map(|s| s.submitted_at).max().unwrap_or_default();
    let tally: Map<String, Value> = counts.iter().map(|(k, (n, _))| (k.clone(), json!(n))).collect();

    let trace = base_trace(ctx)
        .chain([
            ("winning_vote".to_string(), json!(winning_key)),
            ("winning_votes".to_string(), json!(winning_votes)),
            ("tally".to_string(), Value::Object(tally)),
            ("total_votes".to_string(), json!(submissions.len())),
            ("ignored_votes".to_string(), json!(ignored)),
            ("snapshot_at".to_string(), json!(snapshot_at.to_rfc3339())),
            ("disclaimer".to_string(), json!(OPINION_DISCLAIMER)),
        ])
        .collect::<Map<String, Value>>();

    Ok(finish(ctx, sample.outcome.clone(), sample.winning_side, trace))
}

fn base_trace(ctx: &ResolutionContext) -> impl Iterator<Item = (String, Value)> {
    let mut declared = ctx.declared_outcomes.clone();
    declared.sort();
    [
        ("mode".to_string(), json!(ctx.mode)),
        ("market_id".to_string(), json!(ctx.market_id)),
        ("option_id".to_string(), json!(ctx.option_id)),
        ("declared_outcomes".to_string(), json!(declared)),
    ]
    .into_iter()
}

fn finish(ctx: &ResolutionContext, final_outcome: String, winning_side: Side, trace: Map<String, Value>) -> Resolution {
    let trace = Value::Object(trace);
    let canonical_hash = canonical_hash(&trace);
    Resolution { final_outcome, winning_side, mode: ctx.mode, trace, canonical_hash }
}

/// SHA-256 (hex) of the value's JSON with sorted object keys
pub fn canonical_hash(value: &Value) -> String {
    // serde_json::Map is a BTreeMap here, so serialization is key-sorted
    let encoded = value.to_string();
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(mode: ResolutionMode) -> ResolutionContext {
        ResolutionContext {
            market_id: "m1".into(),
            option_id: "o1".into(),
            mode,
            declared_outcomes: vec!["Rain".into()],
        }
    }

    fn vote(user: &str, side: Side, minute: u32) -> EngineSubmission {
        EngineSubmission {
            submitter: user.into(),
            outcome: "Rain".into(),
            winning_side: side,
            evidence_hash: format!("hash-{}", user),
            submitted_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_authority_takes_first_submission() {
        let subs = vec![vote("carol", Side::No, 0), vote("dave", Side::Yes, 1)];
        let resolution = resolve(&ctx(ResolutionMode::Authority), &subs).unwrap();
        assert_eq!(resolution.winning_side, Side::No);
        assert_eq!(resolution.trace["submitter"], "carol");
        assert_eq!(resolution.canonical_hash.len(), 64);
    }

    #[test]
    fn test_undeclared_outcome_is_rejected() {
        let mut sub = vote("carol", Side::Yes, 0);
        sub.outcome = "Snow".into();
        assert!(matches!(
            resolve(&ctx(ResolutionMode::Oracle), &[sub]),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_submissions_fail() {
        assert!(resolve(&ctx(ResolutionMode::Opinion), &[]).is_err());
    }

    #[test]
    fn test_opinion_plurality_and_snapshot() {
        let subs = vec![vote("a", Side::Yes, 3), vote("b", Side::No, 9), vote("c", Side::Yes, 5)];
        let resolution = resolve(&ctx(ResolutionMode::Opinion), &subs).unwrap();
        assert_eq!(resolution.winning_side, Side::Yes);
        assert_eq!(resolution.trace["tally"]["Rain:YES"], 2);
        assert_eq!(resolution.trace["snapshot_at"], "2026-05-01T12:09:00+00:00");
        assert_eq!(resolution.trace["disclaimer"], OPINION_DISCLAIMER);
    }

    #[test]
    fn test_opinion_tie_breaks_lexically() {
        let subs = vec![vote("a", Side::Yes, 1), vote("b", Side::No, 2)];
        let resolution = resolve(&ctx(ResolutionMode::Opinion), &subs).unwrap();
        assert_eq!(resolution.trace["winning_vote"], "Rain:NO");
        assert_eq!(resolution.winning_side, Side::No);
    }

    #[test]
    fn test_opinion_is_order_independent() {
        let subs = vec![vote("a", Side::Yes, 1), vote("b", Side::No, 2), vote("c", Side::No, 3)];
        let mut reversed = subs.clone();
        reversed.reverse();

        let forward = resolve(&ctx(ResolutionMode::Opinion), &subs).unwrap();
        let backward = resolve(&ctx(ResolutionMode::Opinion), &reversed).unwrap();
        assert_eq!(forward.canonical_hash, backward.canonical_hash);
        assert_eq!(forward.trace, backward.trace);
    }

    #[test]
    fn test_canonical_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }
}
