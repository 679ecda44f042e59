//! Data API path templates
//!
//! Pure mappings from (layout, id, field) tuples to relative paths under the
//! database base URL.

/// Records collection, or a single record when `id` is given
pub fn records(layout: &str, id: Option<i64>) -> String {
    match id {
        Some(id) => format!("layouts/{}/records/{}", layout, id),
        None => format!("layouts/{}/records", layout),
    }
}

/// Find endpoint for a layout
pub fn find(layout: &str) -> String {
    format!("layouts/{}/_find", layout)
}

/// Global fields endpoint
pub fn globals() -> String {
    "globals".to_string()
}

/// Container field upload endpoint for one record
pub fn container(layout: &str, record_id: i64, field: &str) -> String {
    format!(
        "layouts/{}/records/{}/containers/{}/1",
        layout, record_id, field
    )
}

/// Session collection (token minting)
pub fn sessions() -> String {
    "sessions".to_string()
}

/// A single session (logout)
pub fn session(token: &str) -> String {
    format!("sessions/{}", token)
}

/// Layout metadata (field names)
pub fn metadata(layout: &str) -> String {
    format!("layouts/{}", layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_paths() {
        assert_eq!(records("people", None), "layouts/people/records");
        assert_eq!(records("people", Some(42)), "layouts/people/records/42");
    }

    #[test]
    fn test_find_and_globals() {
        assert_eq!(find("people"), "layouts/people/_find");
        assert_eq!(globals(), "globals");
    }

    #[test]
    fn test_container_path() {
        assert_eq!(
            container("people", 42, "photo"),
            "layouts/people/records/42/containers/photo/1"
        );
    }

    #[test]
    fn test_session_paths() {
        assert_eq!(sessions(), "sessions");
        assert_eq!(session("abc"), "sessions/abc");
        assert_eq!(metadata("people"), "layouts/people");
    }
}
