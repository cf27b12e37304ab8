//! Parser for the terminals' line-oriented record listing
//!
//! Grammar (one assignment per line, CR/LF tolerant):
//!
//! ```text
//! response   := line*
//! line       := record_kv | scalar_kv | blank
//! record_kv  := "records[" index "]." field "=" value
//! scalar_kv  := name "=" value          (e.g. "found=12", "totalCount=12")
//! value      := everything after the first '=' up to end of line
//! ```
//!
//! Record assignments are grouped by index into `RawRecord`s; `DeviceRecord`s are
//! built from the `RecNo`, `UserID` and `CardName` fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One enrolled identity as reported by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device-side record number, used for deletion
    pub remote_record_id: String,
    pub identity_id: String,
    pub display_name: String,
}

/// Field/value pairs of one `records[i]` group, in line order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub index: usize,
    pub fields: Vec<(String, String)>,
}

impl RawRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }
}

/// Parsed find response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindResponse {
    /// `found=` scalar when present
    pub found: Option<usize>,
    pub records: Vec<RawRecord>,
    /// Lines that matched neither production
    pub malformed_lines: usize,
}

/// Parse the raw body of a `recordFinder` reply
pub fn parse_find_response(body: &str) -> FindResponse {
    let mut groups: BTreeMap<usize, RawRecord> = BTreeMap::new();
    let mut response = FindResponse::default();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            response.malformed_lines += 1;
            continue;
        };

        match parse_record_key(key) {
            Some((index, field)) => {
                groups
                    .entry(index)
                    .or_insert_with(|| RawRecord {
                        index,
                        fields: Vec::new(),
                    })
                    .fields
                    .push((field.to_string(), value.to_string()));
            }
            None if key.starts_with("records") => response.malformed_lines += 1,
            None => {
                if key == "found" {
                    response.found = value.trim().parse().ok();
                }
            }
        }
    }

    response.records = groups.into_values().collect();
    response
}

/// `records[12].UserID` → `(12, "UserID")`
fn parse_record_key(key: &str) -> Option<(usize, &str)> {
    let rest = key.strip_prefix("records[")?;
    let (index, rest) = rest.split_once(']')?;
    let field = rest.strip_prefix('.')?;
    if field.is_empty() {
        return None;
    }
    Some((index.parse().ok()?, field))
}

impl DeviceRecord {
    /// Build from a raw group; `None` when RecNo or UserID is missing
    pub fn from_raw(raw: &RawRecord) -> Option<Self> {
        let remote_record_id = raw.get("RecNo").filter(|v| !v.is_empty())?;
        let identity_id = raw.get("UserID").filter(|v| !v.is_empty())?;
        Some(Self {
            remote_record_id: remote_record_id.to_string(),
            identity_id: identity_id.to_string(),
            display_name: raw.get("CardName").unwrap_or_default().to_string(),
        })
    }
}

/// Parse a find reply straight into device records, skipping incomplete groups
pub fn parse_device_records(body: &str) -> Vec<DeviceRecord> {
    let response = parse_find_response(body);
    if response.malformed_lines > 0 {
        tracing::debug!(
            malformed_lines = response.malformed_lines,
            "Ignoring malformed lines in record listing"
        );
    }

    response
        .records
        .iter()
        .filter_map(|raw| {
            let record = DeviceRecord::from_raw(raw);
            if record.is_none() {
                tracing::warn!(index = raw.index, "Skipping record without RecNo/UserID");
            }
            record
        })
        .collect()
}
