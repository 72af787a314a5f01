use serde::{Deserialize, Serialize};

/// Events streamed to clients, discriminated by the `Type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Event {
    /// A result that entered the current top-10. Carries the rewritten
    /// backend result object (blended ranking, package name).
    #[serde(rename = "result")]
    Result(serde_json::Value),
    #[serde(rename = "progress")]
    Progress {
        #[serde(rename = "QueryId")]
        query_id: String,
        #[serde(rename = "FilesProcessed")]
        files_processed: u64,
        #[serde(rename = "FilesTotal")]
        files_total: u64,
        #[serde(rename = "Results")]
        results: usize,
    },
    #[serde(rename = "pagination")]
    Pagination {
        #[serde(rename = "QueryId")]
        query_id: String,
        #[serde(rename = "ResultPages")]
        result_pages: usize,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "ErrorType")]
        error_type: ErrorKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    BackendUnavailable,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = Event::Pagination {
            query_id: "abc".into(),
            result_pages: 3,
        };
        let s = serde_json::to_string(&ev).unwrap();
        assert_eq!(
            s,
            r#"{"Type":"pagination","QueryId":"abc","ResultPages":3}"#
        );

        let ev = Event::Error {
            error_type: ErrorKind::BackendUnavailable,
        };
        let s = serde_json::to_string(&ev).unwrap();
        assert_eq!(s, r#"{"Type":"error","ErrorType":"backendunavailable"}"#);
    }

    #[test]
    fn result_event_inlines_the_object() {
        let v = serde_json::json!({"Path": "pkg_1.0/main.c", "Ranking": 0.5});
        let s = serde_json::to_string(&Event::Result(v)).unwrap();
        let back: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(back["Type"], "result");
        assert_eq!(back["Path"], "pkg_1.0/main.c");
    }
}
