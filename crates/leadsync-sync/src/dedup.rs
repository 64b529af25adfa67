use leadsync_adapters::{TableError, TableService};
use leadsync_core::{cell_at, DedupSet, HeaderIndex};
use tracing::debug;

pub const UNIQUE_ID_HEADER: &str = "Unique ID";

/// Reads every existing `Unique ID` below the header row of the leads tab, `page_size` rows per read.
///
/// Paging stops at the first empty page. A leads tab without that column seeds an empty set.
pub async fn seed_unique_ids(
    table: &dyn TableService,
    spreadsheet_id: &str,
    leads_tab: &str,
    leads_headers: &[String],
    page_size: u32,
) -> Result<DedupSet, TableError> {
    let col = HeaderIndex::new(leads_headers).column(UNIQUE_ID_HEADER);
    if col == 0 {
        return Ok(DedupSet::new());
    }
    let page_size = page_size.max(1);
    let mut seed = DedupSet::new();
    let mut start_row = 2u32;
    let mut scanned = 0usize;
    loop {
        let rows = table
            .get_rows(spreadsheet_id, leads_tab, start_row, page_size)
            .await?;
        if rows.is_empty() {
            break;
        }
        scanned += rows.len();
        for row in &rows {
            seed.insert(cell_at(row, col));
        }
        let Some(next) = start_row.checked_add(page_size) else {
            break;
        };
        start_row = next;
    }
    debug!(leads_tab, scanned, seeded = seed.len(), "seeded unique ids");
    Ok(seed)
}
