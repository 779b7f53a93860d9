// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cursor-based pagination helpers.
//!
//! The cursor is the id of the last row of the previous page; an invalid
//! cursor is ignored rather than rejected. Queries fetch `limit + 1` rows to
//! decide whether a next page exists.

use uuid::Uuid;

/// Default page size.
pub const DEFAULT_LIMIT: i64 = 50;

/// Page size ceiling.
pub const MAX_LIMIT: i64 = 500;

/// Clamp a requested limit into `[1, MAX_LIMIT]`.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Decode an id cursor; invalid cursors are ignored.
pub fn parse_cursor(cursor: Option<&str>) -> Option<Uuid> {
    cursor.and_then(|raw| raw.parse().ok())
}

/// Trim an over-fetched page down to `limit` rows and return the cursor for
/// the next page, if any.
pub fn next_cursor<T>(items: &mut Vec<T>, limit: i64, id_of: impl Fn(&T) -> Uuid) -> Option<String> {
    if items.len() as i64 > limit {
        items.truncate(limit as usize);
        items.last().map(|item| id_of(item).to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(200)), 200);
        assert_eq!(clamp_limit(Some(9000)), 500);
    }

    #[test]
    fn test_parse_cursor_ignores_garbage() {
        assert!(parse_cursor(None).is_none());
        assert!(parse_cursor(Some("not-a-uuid")).is_none());
        let id = Uuid::new_v4();
        assert_eq!(parse_cursor(Some(&id.to_string())), Some(id));
    }

    #[test]
    fn test_next_cursor_over_fetch() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let mut items = vec![a, b, c];
        let cursor = next_cursor(&mut items, 2, |id| *id);
        assert_eq!(items, vec![a, b]);
        assert_eq!(cursor, Some(b.to_string()));

        let mut exact = vec![a, b];
        assert!(next_cursor(&mut exact, 2, |id| *id).is_none());
        assert_eq!(exact.len(), 2);
    }
}
