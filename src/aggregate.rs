use crate::reader::Record;
use crate::schema::Extraction;

/// Error text recorded when a batch job completed without returning a line
/// for a submitted record.
pub const MISSING_RESULT_ERROR: &str = "batch job returned no result for this record";

/// Terminal result of one record's attempt. Produced exactly once per
/// input record; never merged or retried afterwards.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Extraction),
    Failure(String),
    Missing,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn extraction(&self) -> Option<&Extraction> {
        match self {
            Outcome::Success(extraction) => Some(extraction),
            _ => None,
        }
    }

    pub fn error_text(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(message) => Some(message),
            Outcome::Missing => Some(MISSING_RESULT_ERROR),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub record: Record,
    pub outcome: Outcome,
}

/// Restores input order over an unordered outcome collection: result `i`
/// always corresponds to input record `i`, regardless of completion order.
/// Records with no reported outcome (a batch job can omit rows) are marked
/// `Missing` so the output is always complete. Pure: no I/O, no retries.
pub fn order_outcomes(records: Vec<Record>, unordered: Vec<(usize, Outcome)>) -> Vec<RecordOutcome> {
    let mut slots: Vec<Option<Outcome>> = records.iter().map(|_| None).collect();
    for (index, outcome) in unordered {
        if index < slots.len() {
            slots[index] = Some(outcome);
        }
    }
    records
        .into_iter()
        .zip(slots)
        .map(|(record, slot)| RecordOutcome {
            record,
            outcome: slot.unwrap_or(Outcome::Missing),
        })
        .collect()
}

pub fn count_successes(outcomes: &[RecordOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|entry| entry.outcome.is_success())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::normalise_extraction;
    use crate::template::{TemplateId, get_template};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record(id: &str) -> Record {
        Record {
            id: id.to_string(),
            text: format!("text for {id}"),
            row_data: BTreeMap::new(),
        }
    }

    fn success() -> Outcome {
        let template = get_template(TemplateId::Generic);
        Outcome::Success(normalise_extraction(&json!({ "exam_type": "CT" }), &template))
    }

    #[test]
    fn restores_input_order_from_completion_order() {
        let records = vec![record("1"), record("2"), record("3")];
        let unordered = vec![
            (2, Outcome::Failure("late failure".to_string())),
            (0, success()),
            (1, success()),
        ];
        let ordered = order_outcomes(records, unordered);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].record.id, "1");
        assert!(ordered[0].outcome.is_success());
        assert!(ordered[1].outcome.is_success());
        assert_eq!(ordered[2].outcome.error_text(), Some("late failure"));
        assert_eq!(count_successes(&ordered), 2);
    }

    #[test]
    fn unreported_records_become_missing() {
        let records = vec![record("a"), record("b"), record("c")];
        let unordered = vec![(0, success()), (2, success())];
        let ordered = order_outcomes(records, unordered);
        assert!(matches!(ordered[1].outcome, Outcome::Missing));
        assert_eq!(ordered[1].outcome.error_text(), Some(MISSING_RESULT_ERROR));
        assert_eq!(count_successes(&ordered), 2);
    }
}
