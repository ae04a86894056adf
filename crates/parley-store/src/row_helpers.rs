use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 column into UTC, returning CorruptRow on failure.
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

/// Escape LIKE special characters for safe pattern matching.
pub fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::messages::Role;

    #[test]
    fn escape_like_special_chars() {
        assert_eq!(escape_like("hello"), "hello");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("foo_bar"), "foo\\_bar");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn parse_enum_roles() {
        let role: Role = parse_enum("tool", "messages", "role").unwrap();
        assert_eq!(role, Role::Tool);
        let result: Result<Role, _> = parse_enum("system", "messages", "role");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "role", .. })
        ));
    }

    #[test]
    fn timestamps_are_fixed_width_and_parse_back() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let raw = format_timestamp(&ts);
        assert_eq!(raw, "2026-03-01T10:00:00.000000Z");
        assert_eq!(parse_timestamp(&raw, "sessions", "created_at").unwrap(), ts);
        assert!(parse_timestamp("yesterday", "sessions", "created_at").is_err());
    }

    #[test]
    fn parse_json_failure_is_corrupt_row() {
        assert_eq!(
            parse_json(r#"{"k":1}"#, "messages", "tool_arguments").unwrap()["k"],
            1
        );
        let result = parse_json("not valid json", "messages", "tool_result");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "tool_result", .. })
        ));
    }
}
