use std::collections::{BTreeMap, HashMap};

use crate::types::ColumnHeader;

/// Per-sheet mapping of column index to header text.
#[derive(Debug, Clone, Default)]
pub struct HeaderCache {
    sheets: HashMap<String, BTreeMap<u32, String>>,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about `sheet` with a fresh header row.
    /// Blank headers are dropped; those columns are untracked.
    pub fn refresh(&mut self, sheet: &str, headers: Vec<ColumnHeader>) {
        let columns = headers
            .into_iter()
            .filter(|h| !h.header.trim().is_empty())
            .map(|h| (h.index, h.header))
            .collect();
        self.sheets.insert(sheet.to_string(), columns);
    }

    pub fn get(&self, sheet: &str, col: u32) -> Option<&str> {
        self.sheets
            .get(sheet)
            .and_then(|columns| columns.get(&col))
            .map(String::as_str)
    }

    /// Patch a single header in place, as when the header row is edited.
    pub fn patch(&mut self, sheet: &str, col: u32, header: &str) {
        let columns = self.sheets.entry(sheet.to_string()).or_default();
        if header.trim().is_empty() {
            columns.remove(&col);
        } else {
            columns.insert(col, header.to_string());
        }
    }

    pub fn headers(&self, sheet: &str) -> Vec<ColumnHeader> {
        self.sheets
            .get(sheet)
            .map(|columns| {
                columns
                    .iter()
                    .map(|(index, header)| ColumnHeader {
                        index: *index,
                        header: header.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(index: u32, text: &str) -> ColumnHeader {
        ColumnHeader {
            index,
            header: text.to_string(),
        }
    }

    #[test]
    fn refresh_replaces_previous_headers() {
        let mut cache = HeaderCache::new();
        cache.refresh("Sheet1", vec![header(1, "Name"), header(2, "Amount")]);
        cache.refresh("Sheet1", vec![header(1, "Customer")]);

        assert_eq!(cache.get("Sheet1", 1), Some("Customer"));
        assert_eq!(cache.get("Sheet1", 2), None);
    }

    #[test]
    fn blank_headers_are_untracked() {
        let mut cache = HeaderCache::new();
        cache.refresh("Sheet1", vec![header(1, "Name"), header(2, "  ")]);
        assert_eq!(cache.get("Sheet1", 2), None);
        assert_eq!(cache.headers("Sheet1").len(), 1);
    }

    #[test]
    fn patch_updates_a_single_column() {
        let mut cache = HeaderCache::new();
        cache.refresh("Sheet1", vec![header(1, "Name"), header(2, "Amount")]);
        cache.patch("Sheet1", 2, "Total");
        cache.patch("Sheet2", 1, "Id");

        assert_eq!(cache.get("Sheet1", 1), Some("Name"));
        assert_eq!(cache.get("Sheet1", 2), Some("Total"));
        assert_eq!(cache.get("Sheet2", 1), Some("Id"));
    }
}
