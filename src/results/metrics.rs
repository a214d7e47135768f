//! Aggregate metrics over a result set.
//!
//! Every metric returns a flat mapping so it can be stored verbatim in the
//! results summary.

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};

use crate::error::ResultError;
use crate::metadata::key;

use super::result_set::{PointResult, ResultSet, SquashStrategy};

/// Names accepted by [`compute`].
pub const METRIC_NAMES: [&str; 3] = ["accuracy", "distance", "idlevel"];

const TOP_K: [usize; 4] = [1, 3, 5, 10];

/// Computes the metric called `name`.
pub fn compute(name: &str, results: &ResultSet) -> Result<Mapping, ResultError> {
    match name {
        "accuracy" => Ok(accuracy(results)),
        "distance" => Ok(distance(results)),
        "idlevel" => Ok(idlevel(results)),
        other => Err(ResultError::UnknownMetric(other.to_string())),
    }
}

fn round(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

fn by_identity(results: &[PointResult]) -> BTreeMap<&str, Vec<&PointResult>> {
    let mut grouped: BTreeMap<&str, Vec<&PointResult>> = BTreeMap::new();
    for result in results {
        grouped.entry(result.identity.as_str()).or_default().push(result);
    }
    grouped
}

/// Counts of probes whose identity is within the top 1, 3, 5 and 10.
fn top_k_hits(results: &[&PointResult]) -> [f64; 4] {
    let mut hits = [0.0; 4];
    for result in results {
        for (slot, k) in TOP_K.iter().enumerate() {
            if result.is_topn_success(*k) {
                hits[slot] += 1.0;
            }
        }
    }
    hits
}

/// Top-k accuracy with chance level, normalization and identity mean.
///
/// Candidates are squashed per identity with the minimum distance first.
/// Probes without any candidate count as a guess at chance level.
pub fn accuracy(results: &ResultSet) -> Mapping {
    let squashed = results.to_squashed(SquashStrategy::Min);
    let grouped = by_identity(squashed.results());
    let ids = grouped.len();
    let n = squashed.len();

    let mut hits = [0.0; 4];
    for result in squashed.results() {
        if result.candidates.is_empty() {
            for (slot, k) in TOP_K.iter().enumerate() {
                hits[slot] += (*k as f64 / ids as f64).min(1.0);
            }
        } else {
            for (slot, k) in TOP_K.iter().enumerate() {
                if result.is_topn_success(*k) {
                    hits[slot] += 1.0;
                }
            }
        }
    }

    let mut out = Mapping::new();
    out.insert(key("ids"), Value::from(ids as u64));
    out.insert(key("n"), Value::from(n as u64));
    let rate = |hits: f64| if n == 0 { 0.0 } else { round(hits / n as f64, 3) };
    out.insert(key("hitrate"), Value::from(rate(hits[0])));
    for (slot, k) in TOP_K.iter().enumerate() {
        out.insert(key(&format!("top{}rate", k)), Value::from(rate(hits[slot])));
    }
    for (slot, k) in TOP_K.iter().enumerate() {
        let chance = if ids == 0 {
            0.0
        } else {
            round((*k as f64 / ids as f64).min(1.0), 3)
        };
        let normalized = if chance < 1.0 {
            round((rate(hits[slot]) - chance) / (1.0 - chance), 3)
        } else {
            0.0
        };
        out.insert(key(&format!("cl-top{}rate", k)), Value::from(chance));
        out.insert(
            key(&format!("top{}rate-normalized", k)),
            Value::from(normalized),
        );
    }

    let per_identity: Vec<f64> = grouped
        .values()
        .map(|probes| {
            probes.iter().filter(|r| r.is_success()).count() as f64 / probes.len() as f64
        })
        .collect();
    let id_mean = if per_identity.is_empty() {
        0.0
    } else {
        per_identity.iter().sum::<f64>() / per_identity.len() as f64
    };
    out.insert(key("id-mean"), Value::from(round(id_mean, 3)));
    out
}

/// Statistics over the first candidate's distance of each probe.
///
/// Meant for comparisons where every probe has exactly one candidate,
/// itself in the clear. Non-finite distances are skipped.
pub fn distance(results: &ResultSet) -> Mapping {
    let grouped = by_identity(results.results());
    let distances: Vec<f64> = results
        .results()
        .iter()
        .filter_map(|r| r.candidates.first())
        .map(|c| c.distance)
        .filter(|d| d.is_finite())
        .collect();

    let mut out = Mapping::new();
    out.insert(key("ids"), Value::from(grouped.len() as u64));
    out.insert(key("n"), Value::from(distances.len() as u64));
    if distances.is_empty() {
        for name in ["avg", "std", "min", "max"] {
            out.insert(key(name), Value::Null);
        }
        return out;
    }
    let count = distances.len() as f64;
    let mean = distances.iter().sum::<f64>() / count;
    let variance = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / count;
    let min = distances.iter().copied().fold(f64::INFINITY, f64::min);
    let max = distances.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    out.insert(key("avg"), Value::from(round(mean, 3)));
    out.insert(key("std"), Value::from(round(variance.sqrt(), 3)));
    out.insert(key("min"), Value::from(round(min, 3)));
    out.insert(key("max"), Value::from(round(max, 3)));
    out
}

/// Per-identity hit and top-k rates in percent.
pub fn idlevel(results: &ResultSet) -> Mapping {
    let squashed = results.to_squashed(SquashStrategy::Min);
    let mut identities = Mapping::new();
    for (identity, probes) in by_identity(squashed.results()) {
        let n = probes.len() as f64;
        let hits = top_k_hits(&probes);
        let mut row = Mapping::new();
        row.insert(key("n"), Value::from(probes.len() as u64));
        row.insert(key("hitrate"), Value::from(round(hits[0] / n * 100.0, 2)));
        for (slot, k) in TOP_K.iter().enumerate().skip(1) {
            row.insert(
                key(&format!("top{}rate", k)),
                Value::from(round(hits[slot] / n * 100.0, 2)),
            );
        }
        identities.insert(key(identity), Value::Mapping(row));
    }
    let mut out = Mapping::new();
    out.insert(key("identities"), Value::Mapping(identities));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(identity: &str, candidates: &[(&str, f64)]) -> PointResult {
        let mut r = PointResult::new(identity, "p");
        for (id, d) in candidates {
            r.add_candidate(*id, *d);
        }
        r
    }

    fn set(probes: Vec<PointResult>) -> ResultSet {
        let mut set = ResultSet::in_memory();
        for p in probes {
            set.append(p).unwrap();
        }
        set
    }

    fn get(m: &Mapping, k: &str) -> f64 {
        m.get(k).and_then(Value::as_f64).unwrap()
    }

    #[test]
    fn test_accuracy() {
        let results = set(vec![
            probe("a", &[("a", 0.1), ("b", 0.2)]),
            probe("a", &[("b", 0.1), ("a", 0.2)]),
            probe("b", &[("b", 0.1), ("b", 0.05), ("a", 0.3)]),
            probe("c", &[("a", 0.1), ("b", 0.2), ("c", 0.3), ("d", 0.4)]),
        ]);
        let m = accuracy(&results);
        assert_eq!(m.get("ids").and_then(Value::as_u64), Some(3));
        assert_eq!(get(&m, "top1rate"), 0.5);
        assert_eq!(get(&m, "hitrate"), 0.5);
        assert_eq!(get(&m, "top3rate"), 1.0);
        assert_eq!(get(&m, "cl-top1rate"), 0.333);
        assert_eq!(get(&m, "cl-top3rate"), 1.0);
        assert_eq!(get(&m, "top3rate-normalized"), 0.0);
        // a: 1/2, b: 1/1, c: 0/1
        assert_eq!(get(&m, "id-mean"), 0.5);
    }

    #[test]
    fn test_accuracy_credits_chance_for_empty_candidates() {
        let results = set(vec![
            probe("a", &[]),
            probe("b", &[("b", 0.0)]),
            probe("c", &[("c", 0.0)]),
            probe("d", &[("d", 0.0)]),
        ]);
        let m = accuracy(&results);
        assert_eq!(get(&m, "top1rate"), round((3.0 + 0.25) / 4.0, 3));
        assert_eq!(get(&m, "top5rate"), 1.0);
    }

    #[test]
    fn test_distance_skips_non_finite() {
        let results = set(vec![
            probe("a", &[("a", 1.0)]),
            probe("a", &[("a", 3.0)]),
            probe("b", &[("b", f64::INFINITY)]),
        ]);
        let m = distance(&results);
        assert_eq!(m.get("ids").and_then(Value::as_u64), Some(2));
        assert_eq!(m.get("n").and_then(Value::as_u64), Some(2));
        assert_eq!(get(&m, "avg"), 2.0);
        assert_eq!(get(&m, "std"), 1.0);
        assert_eq!(get(&m, "min"), 1.0);
        assert_eq!(get(&m, "max"), 3.0);
    }

    #[test]
    fn test_idlevel_rows() {
        let results = set(vec![
            probe("a", &[("a", 0.1)]),
            probe("a", &[("b", 0.1), ("a", 0.2)]),
            probe("a", &[("b", 0.1), ("c", 0.2), ("a", 0.3)]),
        ]);
        let m = idlevel(&results);
        let row = m.get("identities").and_then(|v| v.get("a")).unwrap();
        assert_eq!(row.get("n").and_then(Value::as_u64), Some(3));
        assert_eq!(row.get("hitrate").and_then(Value::as_f64), Some(33.33));
        assert_eq!(row.get("top3rate").and_then(Value::as_f64), Some(100.0));
    }

    #[test]
    fn test_unknown_metric() {
        assert!(matches!(
            compute("f1", &ResultSet::in_memory()),
            Err(ResultError::UnknownMetric(_))
        ));
    }
}
