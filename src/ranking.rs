//! Hybrid fuzzy-text and distance ranking.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::trace;

use crate::config::RankingDefaults;
use crate::errors::{AppError, AppResult};
use crate::geometry::{distance_to_geometry, GeoPoint};
use crate::model::{Feature, Provenance, SiteRecord};
use crate::similarity::contains_ci;

/// A record returned by the storage text pre-filter together with the
/// similarity the storage layer computed for each of its name sources.
#[derive(Debug, Clone)]
pub struct TextCandidate {
    pub record: SiteRecord,
    pub name_similarity: f64,
    pub property_similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankingParams {
    pub similarity_weight: f64,
    pub distance_weight: f64,
    pub distance_scale_meters: f64,
    pub min_score: f64,
    pub limit: usize,
}

impl RankingParams {
    pub fn validate(&self) -> AppResult<()> {
        for (label, value) in [
            ("similarity weight", self.similarity_weight),
            ("distance weight", self.distance_weight),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(AppError::invalid(format!("{label} must be positive")));
            }
        }
        if !self.distance_scale_meters.is_finite() || self.distance_scale_meters <= 0.0 {
            return Err(AppError::invalid("distance scale must be positive"));
        }
        if !self.min_score.is_finite() {
            return Err(AppError::invalid("minimum score must be a number"));
        }
        if self.limit == 0 {
            return Err(AppError::invalid("limit must be at least 1"));
        }
        Ok(())
    }
}

impl From<RankingDefaults> for RankingParams {
    fn from(value: RankingDefaults) -> Self {
        Self {
            similarity_weight: value.similarity_weight,
            distance_weight: value.distance_weight,
            distance_scale_meters: value.distance_scale_meters,
            min_score: value.min_score,
            limit: value.limit,
        }
    }
}

impl Default for RankingParams {
    fn default() -> Self {
        RankingDefaults::default().into()
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub record: SiteRecord,
    pub similarity: f64,
    pub distance_meters: Option<f64>,
    pub score: f64,
}

impl ScoredCandidate {
    pub fn to_feature(&self) -> Feature {
        let mut feature = self
            .record
            .to_feature()
            .with_property("provenance", Provenance::Local.as_str())
            .with_property("score", self.score)
            .with_property("similarity", self.similarity);
        if let Some(distance) = self.distance_meters {
            feature = feature.with_property("distance_m", distance);
        }
        feature
    }
}

/// `1 / (1 + distance / scale)`: 1 at the reference point, falling towards 0.
pub fn proximity(distance_meters: f64, scale_meters: f64) -> f64 {
    1.0 / (1.0 + distance_meters.max(0.0) / scale_meters)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RankedSearch;

impl RankedSearch {
    pub fn new() -> Self {
        Self
    }

    /// Scores `candidates` for `term`, highest score first.
    ///
    /// Candidates whose names do not contain the term are skipped, as are
    /// those scoring below `params.min_score`. An empty term yields nothing.
    pub fn rank(
        &self,
        term: &str,
        reference: Option<GeoPoint>,
        params: &RankingParams,
        candidates: Vec<TextCandidate>,
    ) -> AppResult<Vec<ScoredCandidate>> {
        params.validate()?;
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .filter(|candidate| passes_prefilter(&candidate.record, term))
            .map(|candidate| score_candidate(candidate, reference, params))
            .filter(|candidate| candidate.score >= params.min_score)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        scored.truncate(params.limit);
        trace!(term, results = scored.len(), "ranked text candidates");
        Ok(scored)
    }
}

fn passes_prefilter(record: &SiteRecord, term: &str) -> bool {
    record
        .name
        .as_deref()
        .map(|name| contains_ci(name, term))
        .unwrap_or(false)
        || record
            .property_name()
            .map(|name| contains_ci(name, term))
            .unwrap_or(false)
}

fn score_candidate(
    candidate: TextCandidate,
    reference: Option<GeoPoint>,
    params: &RankingParams,
) -> ScoredCandidate {
    let similarity = clamp_unit(candidate.name_similarity).max(clamp_unit(candidate.property_similarity));
    let distance_meters =
        reference.map(|point| distance_to_geometry(point, &candidate.record.geometry));
    let score = match distance_meters {
        Some(distance) => {
            similarity * params.similarity_weight
                + proximity(distance, params.distance_scale_meters) * params.distance_weight
        }
        None => similarity,
    };
    ScoredCandidate {
        record: candidate.record,
        similarity,
        distance_meters,
        score,
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
