//! Core domain model and batch ranking for Cellarwatch.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cellar-core";

/// Fixed prior weight (`m`) used by the smoothed score unless overridden.
pub const DEFAULT_PRIOR_WEIGHT: f64 = 10.0;

/// Open-schema attribute value. Upstream facets arrive as strings, numbers,
/// or "N/A" sentinels; the sentinel is carried as an explicit variant so
/// "missing" is never confused with a valid zero or empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Number(f64),
    Text(String),
    Unavailable,
}

impl AttrValue {
    pub fn is_available(&self) -> bool {
        !matches!(self, AttrValue::Unavailable)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Text(s) => s.trim().parse().ok(),
            AttrValue::Unavailable => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Canonical normalized representation of one catalog item.
///
/// `id` is the only field guaranteed unique and non-empty; it is immutable
/// once assigned. `score` is always recomputed over a full batch by
/// [`rank`], never patched for a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub title: String,
    pub price: Option<f64>,
    pub promo_price: Option<f64>,
    pub rating_value: Option<f64>,
    #[serde(default)]
    pub rating_count: u32,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub score: f64,
    pub last_refreshed: DateTime<Utc>,
}

impl Record {
    /// Promotional price when present and positive, else the regular price.
    pub fn effective_price(&self) -> Option<f64> {
        match self.promo_price {
            Some(promo) if promo > 0.0 => Some(promo),
            _ => self.price.filter(|p| *p > 0.0),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }
}

/// One price point for one item on one day. At most one observation exists
/// per `(id, date)`; later writes for the same key overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: String,
    pub date: NaiveDate,
    pub price: f64,
    #[serde(default)]
    pub title: Option<String>,
}

/// Membership of one item in one user's favorites set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteEntry {
    pub user_id: String,
    pub id: String,
    pub date_added: DateTime<Utc>,
}

/// Derived alert payload: a favorited item currently at or below its
/// historical low. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertItem {
    pub id: String,
    pub title: String,
    pub current_price: f64,
    pub lowest_price: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RankingConfig {
    pub prior_weight: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            prior_weight: DEFAULT_PRIOR_WEIGHT,
        }
    }
}

/// Batch-wide prior `C`: the mean rating over reviewed items, falling back
/// to the mean over all rated items, then 0 when no ratings exist at all.
pub fn batch_prior_mean(records: &[Record]) -> f64 {
    let reviewed: Vec<f64> = records
        .iter()
        .filter(|r| r.rating_count > 0)
        .filter_map(|r| r.rating_value)
        .collect();
    if !reviewed.is_empty() {
        return reviewed.iter().sum::<f64>() / reviewed.len() as f64;
    }

    let rated: Vec<f64> = records.iter().filter_map(|r| r.rating_value).collect();
    if !rated.is_empty() {
        return rated.iter().sum::<f64>() / rated.len() as f64;
    }

    0.0
}

/// Smoothed popularity score over a complete batch.
///
/// `score = (v / (v + m)) * R + (m / (v + m)) * C` where `v` is the review
/// count, `R` the item rating (0 when absent), `m` the prior weight, and
/// `C` the batch prior from [`batch_prior_mean`]. The prior depends on the
/// whole batch, so scores are only meaningful when computed over one full
/// pagination pass. Deterministic for a fixed batch.
pub fn rank(records: &mut [Record], config: RankingConfig) {
    let c = batch_prior_mean(records);
    let m = config.prior_weight.max(0.0);

    for record in records.iter_mut() {
        let v = f64::from(record.rating_count);
        let r = record.rating_value.unwrap_or(0.0);
        let denom = v + m;
        // denom can only hit zero with a configured m of 0 and no reviews;
        // the item then carries exactly the batch prior.
        record.score = if denom == 0.0 {
            c
        } else {
            (v / denom) * r + (m / denom) * c
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_record(id: &str, rating: Option<f64>, reviews: u32) -> Record {
        Record {
            id: id.to_string(),
            title: id.to_string(),
            price: Some(19.95),
            promo_price: None,
            rating_value: rating,
            rating_count: reviews,
            attributes: BTreeMap::new(),
            score: 0.0,
            last_refreshed: Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn smoothing_matches_worked_example() {
        let mut batch = vec![
            mk_record("a", Some(4.0), 20),
            mk_record("b", Some(2.0), 0),
        ];
        rank(&mut batch, RankingConfig::default());

        // C over reviewed items is 4.0; both scores land on exactly 4.0.
        assert!((batch[0].score - 4.0).abs() < 1e-12);
        assert!((batch[1].score - 4.0).abs() < 1e-12);
    }

    #[test]
    fn ranking_is_deterministic() {
        let mut first = vec![
            mk_record("a", Some(4.5), 7),
            mk_record("b", Some(3.1), 0),
            mk_record("c", None, 3),
        ];
        let mut second = first.clone();

        rank(&mut first, RankingConfig::default());
        rank(&mut second, RankingConfig::default());

        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.score, y.score);
        }
    }

    #[test]
    fn prior_falls_back_to_all_rated_then_zero() {
        let only_unreviewed = vec![mk_record("a", Some(3.0), 0), mk_record("b", Some(5.0), 0)];
        assert!((batch_prior_mean(&only_unreviewed) - 4.0).abs() < 1e-12);

        let unrated = vec![mk_record("a", None, 0), mk_record("b", None, 0)];
        assert_eq!(batch_prior_mean(&unrated), 0.0);
    }

    #[test]
    fn zero_prior_weight_never_divides_by_zero() {
        let mut batch = vec![mk_record("a", Some(4.0), 5), mk_record("b", None, 0)];
        rank(&mut batch, RankingConfig { prior_weight: 0.0 });

        // Reviewed item keeps its own rating; unreviewed item gets the prior.
        assert!((batch[0].score - 4.0).abs() < 1e-12);
        assert!((batch[1].score - 4.0).abs() < 1e-12);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut batch: Vec<Record> = Vec::new();
        rank(&mut batch, RankingConfig::default());
        assert!(batch.is_empty());
    }

    #[test]
    fn effective_price_prefers_valid_promo() {
        let mut record = mk_record("a", None, 0);
        record.price = Some(24.95);
        record.promo_price = Some(19.95);
        assert_eq!(record.effective_price(), Some(19.95));

        record.promo_price = Some(0.0);
        assert_eq!(record.effective_price(), Some(24.95));

        record.promo_price = None;
        record.price = None;
        assert_eq!(record.effective_price(), None);
    }

    #[test]
    fn attr_value_sentinel_round_trips_as_null() {
        let json = serde_json::to_string(&AttrValue::Unavailable).unwrap();
        assert_eq!(json, "null");
        let back: AttrValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AttrValue::Unavailable);
        assert!(!back.is_available());

        let num: AttrValue = serde_json::from_str("12.5").unwrap();
        assert_eq!(num.as_number(), Some(12.5));
    }
}
