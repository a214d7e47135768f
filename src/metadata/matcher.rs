//! Recursive structural matching of metadata trees.
//!
//! A query is a partial metadata tree. A candidate matches when every key
//! path present in the query exists in the candidate with an equal value.
//! Mappings on both sides are compared key by key, so keys missing from
//! the query act as wildcards. Every other pair of values is compared for
//! equality; numbers compare by numeric value, so `1` equals `1.0`.

use std::fmt;

use serde_yaml::Value;

/// The first point at which a candidate diverges from a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// Dotted key path from the document root, e.g. `lineage.stage-params.rate`.
    pub path: String,
    /// Value required by the query.
    pub expected: Value,
    /// Value found in the candidate, `None` if the key is absent.
    pub actual: Option<Value>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expected = render(&self.expected);
        match &self.actual {
            Some(actual) => write!(
                f,
                "'{}': expected {}, found {}",
                self.path,
                expected,
                render(actual)
            ),
            None => write!(f, "'{}': expected {}, key missing", self.path, expected),
        }
    }
}

/// Returns true if `candidate` satisfies every key path in `query`.
pub fn matches(candidate: &Value, query: &Value) -> bool {
    explain(candidate, query).is_none()
}

/// Returns the first mismatch between `candidate` and `query`, if any.
pub fn explain(candidate: &Value, query: &Value) -> Option<Mismatch> {
    let mut path = Vec::new();
    match_level(candidate, query, &mut path)
}

fn match_level(candidate: &Value, query: &Value, path: &mut Vec<String>) -> Option<Mismatch> {
    match (candidate, query) {
        (Value::Mapping(candidate), Value::Mapping(query)) => {
            for (key, expected) in query {
                path.push(key_label(key));
                let outcome = match candidate.get(key) {
                    Some(actual) => match_level(actual, expected, path),
                    None => Some(Mismatch {
                        path: path.join("."),
                        expected: expected.clone(),
                        actual: None,
                    }),
                };
                path.pop();
                if outcome.is_some() {
                    return outcome;
                }
            }
            None
        }
        _ if values_equal(candidate, query) => None,
        _ => Some(Mismatch {
            path: path.join("."),
            expected: query.clone(),
            actual: Some(candidate.clone()),
        }),
    }
}

/// Strict equality with numeric normalization.
///
/// Mappings nested inside sequences must be fully equal; wildcards only
/// apply along mapping paths of the query.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Sequence(xs), Value::Sequence(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Mapping(xs), Value::Mapping(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        (Value::Tagged(x), Value::Tagged(y)) => x.tag == y.tag && values_equal(&x.value, &y.value),
        _ => a == b,
    }
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => render(other),
    }
}

fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_absent_query_keys_are_wildcards() {
        let candidate = yaml(
            "original: faces\nlineage:\n  stage-kind: anonymization\n  stage-params: {sigma: 2, size: 5}\n  random-tag: 0\n",
        );
        let query = yaml("original: faces\nlineage:\n  stage-params: {sigma: 2}\n");
        assert!(matches(&candidate, &query));
    }

    #[test]
    fn test_differing_nested_value_reports_path() {
        let candidate = yaml("lineage:\n  stage-params:\n    rate: 0.5\n");
        let query = yaml("lineage:\n  stage-params:\n    rate: 0.6\n");

        let mismatch = explain(&candidate, &query).unwrap();
        assert_eq!(mismatch.path, "lineage.stage-params.rate");
        assert_eq!(mismatch.expected, Value::from(0.6));
        assert_eq!(mismatch.actual, Some(Value::from(0.5)));
        assert!(mismatch.to_string().contains("lineage.stage-params.rate"));
    }

    #[test]
    fn test_missing_key_is_mismatch() {
        let candidate = yaml("original: faces\n");
        let query = yaml("original: faces\nlineage:\n  part: 0\n");
        let mismatch = explain(&candidate, &query).unwrap();
        assert_eq!(mismatch.path, "lineage");
        assert_eq!(mismatch.actual, None);
    }

    #[test]
    fn test_mapping_against_scalar_is_mismatch() {
        let candidate = yaml("params: fast\n");
        let query = yaml("params:\n  mode: fast\n");
        assert!(!matches(&candidate, &query));
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let candidate = yaml("rate: 1\n");
        let query = yaml("rate: 1.0\n");
        assert!(matches(&candidate, &query));
    }

    #[test]
    fn test_sequences_compare_fully() {
        let candidate = yaml("rates: [0.2, 0.3]\n");
        assert!(matches(&candidate, &yaml("rates: [0.2, 0.3]\n")));
        assert!(!matches(&candidate, &yaml("rates: [0.2]\n")));
        assert!(!matches(&candidate, &yaml("rates: [0.3, 0.2]\n")));
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let candidate = yaml("name: x\n");
        assert!(matches(&candidate, &yaml("{}")));
    }
}
