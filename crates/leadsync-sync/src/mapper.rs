use leadsync_core::{DedupSet, DestinationRow, RawRecord};
use tracing::debug;

use crate::normalize::{unique_id, LeadColumn};

/// Maps raw records onto `headers`, dropping records whose unique id is already in `seen`.
///
/// Ids of mapped records are added to `seen`; records without an id are always kept.
pub fn map_records(
    records: &[RawRecord],
    headers: &[String],
    seen: &mut DedupSet,
    first_seen: &str,
) -> Vec<DestinationRow> {
    let columns: Vec<LeadColumn> = headers.iter().map(|h| LeadColumn::from_header(h)).collect();
    let mut rows = Vec::with_capacity(records.len());
    let mut duplicates = 0usize;

    for record in records {
        let id = unique_id(record);
        if !id.is_empty() && seen.contains(&id) {
            duplicates += 1;
            continue;
        }
        seen.insert(&id);
        rows.push(
            columns
                .iter()
                .map(|column| column.cell(record, &id, first_seen))
                .collect(),
        );
    }

    debug!(records = records.len(), mapped = rows.len(), duplicates, "mapped records");
    rows
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value as JsonValue};

    use super::*;

    const FIRST_SEEN: &str = "24/02/2026, 9:00:00 am";

    fn headers() -> Vec<String> {
        ["Unique ID", "Business Name", "Comments", "Mystery Column", "AI Analysis", "Date First Added"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn records() -> Vec<RawRecord> {
        [
            json!({ "placeId": "p-1", "title": "Acme Plumbing" }),
            json!({ "place_id": "p-2", "name": "Beta Cafe", "website": "https://beta.test" }),
            json!({ "placeId": "p-1", "title": "Acme Plumbing (dup)" }),
            json!({ "title": "No Id One" }),
            json!({ "title": "No Id Two" }),
        ]
        .into_iter()
        .filter_map(|v| match v {
            JsonValue::Object(map) => Some(map),
            _ => None,
        })
        .collect()
    }

    #[test]
    fn rows_follow_destination_headers() {
        let mut seen = DedupSet::new();
        let rows = map_records(&records()[..2], &headers(), &mut seen, FIRST_SEEN);
        assert_eq!(
            rows[1],
            vec!["p-2", "Beta Cafe", "", "", "4", FIRST_SEEN]
        );
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn duplicates_within_batch_are_dropped_but_empty_ids_are_not() {
        let mut seen = DedupSet::new();
        let rows = map_records(&records(), &headers(), &mut seen, FIRST_SEEN);
        let names: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(names, vec!["Acme Plumbing", "Beta Cafe", "No Id One", "No Id Two"]);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn second_push_of_same_batch_adds_nothing() {
        let mut seen = DedupSet::new();
        let first = map_records(&records()[..3], &headers(), &mut seen, FIRST_SEEN);
        assert_eq!(first.len(), 2);

        let mut reseeded = DedupSet::from_ids(first.iter().map(|row| row[0].as_str()));
        let second = map_records(&records()[..3], &headers(), &mut reseeded, FIRST_SEEN);
        assert!(second.is_empty());
    }

    #[test]
    fn mapping_is_deterministic() {
        let a = map_records(&records(), &headers(), &mut DedupSet::new(), FIRST_SEEN);
        let b = map_records(&records(), &headers(), &mut DedupSet::new(), FIRST_SEEN);
        assert_eq!(a, b);
    }
}
