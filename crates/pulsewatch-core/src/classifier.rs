use serde_json::Value;

use crate::error::ProbeError;
use crate::models::{ComparisonOperator, QueryDefinition, ResultStatus};

/// Connection-level facts attached to every SQL raw outcome: the database
/// server's reported version and the database name the pool actually
/// connected to (not necessarily the target's configured display name).
#[derive(Debug, Clone, Default)]
pub struct SqlMeta {
    pub server_version: Option<String>,
    pub database_name: Option<String>,
}

/// Raw outcome of one probe attempt, before classification. `probes/http.rs`
/// and `probes/sql.rs` both produce this; `classify_*` turns it into a
/// `ResultStatus` + message.
#[derive(Debug, Clone)]
pub enum RawOutcome {
    Http { status_code: u16, reason_phrase: String },
    SqlScalar { value: Option<Value>, meta: SqlMeta },
    SqlNonQuery { rows_affected: u64, meta: SqlMeta },
    SqlTable { row_count: usize, meta: SqlMeta },
    Error(ProbeError),
}

impl RawOutcome {
    /// `Some` for every SQL variant, `None` for `Http`/`Error`.
    pub fn sql_meta(&self) -> Option<&SqlMeta> {
        match self {
            RawOutcome::SqlScalar { meta, .. } | RawOutcome::SqlNonQuery { meta, .. } | RawOutcome::SqlTable { meta, .. } => Some(meta),
            RawOutcome::Http { .. } | RawOutcome::Error(_) => None,
        }
    }

    /// Text form of the outcome's payload, stored as `probe_results.raw_value`.
    pub fn raw_value_string(&self) -> Option<String> {
        match self {
            RawOutcome::SqlScalar { value, .. } => value.as_ref().map(|v| v.to_string()),
            RawOutcome::SqlNonQuery { rows_affected, .. } => Some(rows_affected.to_string()),
            RawOutcome::SqlTable { row_count, .. } => Some(row_count.to_string()),
            RawOutcome::Http { .. } | RawOutcome::Error(_) => None,
        }
    }
}

/// Classified result: status plus a short human-facing message (never
/// containing credentials — see §4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: ResultStatus,
    pub message: String,
}

pub fn classify(outcome: &RawOutcome, accepted_status_codes: &[u16], query: Option<&QueryDefinition>) -> Classification {
    match outcome {
        RawOutcome::Error(err) => Classification { status: ResultStatus::Error, message: err.to_string() },

        RawOutcome::Http { status_code, reason_phrase } => {
            if accepted_status_codes.contains(status_code) {
                Classification { status: ResultStatus::Healthy, message: format!("HTTP {status_code} {reason_phrase}") }
            } else {
                Classification { status: ResultStatus::Warning, message: format!("HTTP {status_code} {reason_phrase}") }
            }
        }

        RawOutcome::SqlScalar { value, .. } => classify_scalar(value.as_ref(), query),

        RawOutcome::SqlNonQuery { rows_affected, .. } => {
            Classification { status: ResultStatus::Healthy, message: format!("executed, {rows_affected} rows affected") }
        }

        RawOutcome::SqlTable { row_count, .. } => {
            Classification { status: ResultStatus::Healthy, message: format!("returned {row_count} rows") }
        }
    }
}

fn classify_scalar(value: Option<&Value>, query: Option<&QueryDefinition>) -> Classification {
    let query = match query {
        Some(q) => q,
        None => {
            return Classification { status: ResultStatus::Healthy, message: "query executed".to_string() };
        }
    };

    if let (Some(warning), Some(critical)) = (query.warning_threshold, query.critical_threshold) {
        if critical <= warning {
            return Classification { status: ResultStatus::Error, message: "threshold_inversion".to_string() };
        }
    }

    // Step 3: expected-value comparison, if configured.
    if let Some(expected) = &query.expected_value {
        let op = query.comparison_operator.unwrap_or(ComparisonOperator::Eq);
        let matches = match value {
            None => expected.is_null(),
            Some(actual) => compare(actual, expected, op),
        };
        if !matches {
            return Classification { status: ResultStatus::Warning, message: format!("Query result outside expected range: {}", display_value(value)) };
        }
    } else if value.is_none() {
        return Classification { status: ResultStatus::Warning, message: "unexpected null result".to_string() };
    }

    // Step 4: threshold comparison against a numeric coercion of the value.
    if let Some(actual_num) = value.and_then(coerce_f64) {
        if let Some(critical) = query.critical_threshold {
            if actual_num >= critical {
                return Classification { status: ResultStatus::Critical, message: format!("value {actual_num} at or above critical threshold {critical}") };
            }
        }
        if let Some(warning) = query.warning_threshold {
            if actual_num >= warning {
                return Classification { status: ResultStatus::Warning, message: format!("value {actual_num} at or above warning threshold {warning}") };
            }
        }
    }

    Classification { status: ResultStatus::Healthy, message: format!("value: {}", display_value(value)) }
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "null".to_string(),
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn compare(actual: &Value, expected: &Value, op: ComparisonOperator) -> bool {
    match op {
        ComparisonOperator::Eq => values_equal(actual, expected),
        ComparisonOperator::Ne => !values_equal(actual, expected),
        ComparisonOperator::Contains => match (actual, expected) {
            (Value::String(a), Value::String(e)) => a.contains(e.as_str()),
            _ => false,
        },
        ComparisonOperator::Gt | ComparisonOperator::Gte | ComparisonOperator::Lt | ComparisonOperator::Lte => {
            match (coerce_f64(actual), coerce_f64(expected)) {
                (Some(a), Some(e)) => match op {
                    ComparisonOperator::Gt => a > e,
                    ComparisonOperator::Gte => a >= e,
                    ComparisonOperator::Lt => a < e,
                    ComparisonOperator::Lte => a <= e,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (coerce_f64(a), coerce_f64(b)) {
        return (a - b).abs() < f64::EPSILON;
    }
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query_with_thresholds(warning: f64, critical: f64) -> QueryDefinition {
        QueryDefinition {
            name: "q".into(),
            sql: "select 1".into(),
            result_kind: crate::models::QueryResultKind::Scalar,
            expected_value: None,
            comparison_operator: None,
            warning_threshold: Some(warning),
            critical_threshold: Some(critical),
            timeout_seconds: None,
            description: String::new(),
        }
    }

    #[test]
    fn http_200_is_healthy_boundary() {
        let c = classify(&RawOutcome::Http { status_code: 200, reason_phrase: "OK".into() }, &[200], None);
        assert_eq!(c.status, ResultStatus::Healthy);
    }

    #[test]
    fn http_just_outside_accepted_is_unhealthy() {
        let c = classify(&RawOutcome::Http { status_code: 201, reason_phrase: "Created".into() }, &[200], None);
        assert_eq!(c.status, ResultStatus::Warning);
        let c = classify(&RawOutcome::Http { status_code: 199, reason_phrase: "".into() }, &[200], None);
        assert_eq!(c.status, ResultStatus::Warning);
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        let query = query_with_thresholds(50.0, 100.0);
        let at_49_999 = classify(&RawOutcome::SqlScalar { value: Some(json!(49.999)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(at_49_999.status, ResultStatus::Healthy);

        let at_50 = classify(&RawOutcome::SqlScalar { value: Some(json!(50)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(at_50.status, ResultStatus::Warning);

        let at_99_999 = classify(&RawOutcome::SqlScalar { value: Some(json!(99.999)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(at_99_999.status, ResultStatus::Warning);

        let at_100 = classify(&RawOutcome::SqlScalar { value: Some(json!(100)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(at_100.status, ResultStatus::Critical);
    }

    #[test]
    fn critical_wins_when_both_fire() {
        let query = query_with_thresholds(10.0, 20.0);
        let c = classify(&RawOutcome::SqlScalar { value: Some(json!(25)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(c.status, ResultStatus::Critical);
    }

    #[test]
    fn inverted_thresholds_are_an_error() {
        let query = query_with_thresholds(100.0, 50.0);
        let c = classify(&RawOutcome::SqlScalar { value: Some(json!(60)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(c.status, ResultStatus::Error);
        assert_eq!(c.message, "threshold_inversion");
    }

    #[test]
    fn expected_value_eq_matches_across_numeric_representations() {
        let query = QueryDefinition {
            name: "q".into(),
            sql: "select 5".into(),
            result_kind: crate::models::QueryResultKind::Scalar,
            expected_value: Some(json!(5)),
            comparison_operator: Some(ComparisonOperator::Eq),
            warning_threshold: None,
            critical_threshold: None,
            timeout_seconds: None,
            description: String::new(),
        };
        let int_match = classify(&RawOutcome::SqlScalar { value: Some(json!(5)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(int_match.status, ResultStatus::Healthy);
        let float_match = classify(&RawOutcome::SqlScalar { value: Some(json!(5.0)), meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(float_match.status, ResultStatus::Healthy);
    }

    #[test]
    fn null_scalar_with_null_expected_is_healthy() {
        let query = QueryDefinition {
            name: "q".into(),
            sql: "select null".into(),
            result_kind: crate::models::QueryResultKind::Scalar,
            expected_value: Some(Value::Null),
            comparison_operator: Some(ComparisonOperator::Eq),
            warning_threshold: None,
            critical_threshold: None,
            timeout_seconds: None,
            description: String::new(),
        };
        let c = classify(&RawOutcome::SqlScalar { value: None, meta: SqlMeta::default() }, &[], Some(&query));
        assert_eq!(c.status, ResultStatus::Healthy);
    }

    #[test]
    fn error_outcome_is_always_error_regardless_of_config() {
        let c = classify(&RawOutcome::Error(ProbeError::Timeout(5000)), &[200], None);
        assert_eq!(c.status, ResultStatus::Error);
    }
}
