use drover_common::error::Error;

pub mod actions;
pub mod clusters;
pub mod events;
pub mod locks;
pub mod nodes;
pub mod policies;
pub mod profiles;
pub mod schema;

/// `status_reason` columns are capped at 255 chars; longer messages (stack
/// traces, driver errors) are cut rather than rejected.
pub const REASON_MAX: usize = 255;

pub fn truncate_reason(reason: &str) -> String {
    if reason.chars().count() <= REASON_MAX {
        return reason.to_string();
    }
    reason.chars().take(REASON_MAX).collect()
}

/// Validate a caller-supplied sort direction.
pub fn parse_sort_dir(sort_dir: Option<&str>) -> Result<&'static str, Error> {
    match sort_dir {
        None => Ok("ASC"),
        Some(s) if s.eq_ignore_ascii_case("asc") => Ok("ASC"),
        Some(s) if s.eq_ignore_ascii_case("desc") => Ok("DESC"),
        Some(other) => Err(Error::Invalid(format!("invalid sort direction: {other}"))),
    }
}

/// Map caller-visible sort keys onto columns through a whitelist. Unknown
/// keys fail the whole request instead of being silently dropped. `id` is
/// appended as the final key so listings stay totally ordered even when the
/// requested keys are not unique.
pub fn sort_columns(
    sort_keys: &[String],
    whitelist: &'static [(&'static str, &'static str)],
) -> Result<Vec<&'static str>, Error> {
    let mut cols: Vec<&'static str> = Vec::with_capacity(sort_keys.len() + 1);
    for key in sort_keys {
        match whitelist.iter().find(|(k, _)| k == key) {
            Some((_, col)) => cols.push(col),
            None => return Err(Error::Invalid(format!("invalid sort key: {key}"))),
        }
    }
    if !cols.contains(&"id") {
        cols.push("id");
    }
    Ok(cols)
}

pub fn order_by_clause(cols: &[&str], dir: &str) -> String {
    cols.iter()
        .map(|c| format!("{c} {dir}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITELIST: &[(&str, &str)] = &[
        ("name", "name"),
        ("status", "status"),
        ("created_time", "created_time"),
    ];

    #[test]
    fn reason_is_truncated_to_255() {
        let long = "x".repeat(1000);
        assert_eq!(truncate_reason(&long).chars().count(), REASON_MAX);
        assert_eq!(truncate_reason("short"), "short");
    }

    #[test]
    fn unknown_sort_key_is_invalid() {
        let err = sort_columns(&["size; DROP TABLE clusters".into()], WHITELIST).unwrap_err();
        assert_eq!(err.tag(), "Invalid");
    }

    #[test]
    fn id_is_appended_as_tiebreak() {
        let cols = sort_columns(&["name".into()], WHITELIST).unwrap();
        assert_eq!(cols, vec!["name", "id"]);
        assert_eq!(order_by_clause(&cols, "DESC"), "name DESC, id DESC");
    }

    #[test]
    fn sort_dir_is_validated() {
        assert_eq!(parse_sort_dir(None).unwrap(), "ASC");
        assert_eq!(parse_sort_dir(Some("DESC")).unwrap(), "DESC");
        assert!(parse_sort_dir(Some("sideways")).is_err());
    }
}
