//! Work items as seen by the supervisor.
//!
//! The supervisor only needs per-state counts; storage is behind
//! [`WorkItemSource`]. The default source reads `<project>/.fleet/items.jsonl`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::SupervisorError;
use crate::records::{AGGREGATE_SESSION, paths};

/// State of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    InProgress,
    Complete,
    Blocked,
}

/// A unit of work, tagged with the sessions allowed to pick it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub state: WorkItemState,
    #[serde(default)]
    pub sessions: Vec<String>,
}

impl WorkItem {
    /// Whether this item counts toward `session_id`. The aggregate session
    /// counts every item.
    pub fn belongs_to(&self, session_id: &str) -> bool {
        session_id == AGGREGATE_SESSION || self.sessions.iter().any(|s| s == session_id)
    }
}

/// Per-state item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub blocked: usize,
}

impl ItemCounts {
    /// Count the items belonging to `session_id`.
    pub fn for_session(items: &[WorkItem], session_id: &str) -> Self {
        let mut counts = Self::default();
        for item in items.iter().filter(|i| i.belongs_to(session_id)) {
            match item.state {
                WorkItemState::Pending => counts.pending += 1,
                WorkItemState::InProgress => counts.in_progress += 1,
                WorkItemState::Complete => counts.complete += 1,
                WorkItemState::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    /// Pending or in-progress work exists.
    pub fn has_open_work(&self) -> bool {
        self.pending + self.in_progress > 0
    }
}

/// Supplies the work items of a project.
#[async_trait]
pub trait WorkItemSource: Send + Sync {
    async fn load(&self, project: &Path) -> Result<Vec<WorkItem>, SupervisorError>;
}

/// Reads one JSON object per line from `<project>/.fleet/items.jsonl`.
#[derive(Debug, Clone, Default)]
pub struct JsonlWorkItems;

impl JsonlWorkItems {
    pub const FILE_NAME: &'static str = "items.jsonl";

    pub fn path(project: &Path) -> PathBuf {
        project.join(paths::FLEET_DIR).join(Self::FILE_NAME)
    }
}

#[async_trait]
impl WorkItemSource for JsonlWorkItems {
    async fn load(&self, project: &Path) -> Result<Vec<WorkItem>, SupervisorError> {
        let path = Self::path(project);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SupervisorError::WorkItems {
                    project: project.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| SupervisorError::WorkItems {
                    project: project.to_path_buf(),
                    reason: format!("line {}: {e}", n + 1),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(id: &str, state: WorkItemState, sessions: &[&str]) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            title: String::new(),
            state,
            sessions: sessions.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn counts_only_tagged_items() {
        let items = vec![
            item("a", WorkItemState::Pending, &["s1"]),
            item("b", WorkItemState::InProgress, &["s1", "s2"]),
            item("c", WorkItemState::Complete, &["s2"]),
            item("d", WorkItemState::Blocked, &[]),
        ];
        let s1 = ItemCounts::for_session(&items, "s1");
        assert_eq!(
            s1,
            ItemCounts {
                pending: 1,
                in_progress: 1,
                complete: 0,
                blocked: 0
            }
        );
        assert!(s1.has_open_work());

        let s2 = ItemCounts::for_session(&items, "s2");
        assert_eq!(s2.in_progress, 1);
        assert_eq!(s2.complete, 1);
    }

    #[test]
    fn aggregate_counts_everything() {
        let items = vec![
            item("a", WorkItemState::Pending, &["s1"]),
            item("d", WorkItemState::Blocked, &[]),
        ];
        let all = ItemCounts::for_session(&items, AGGREGATE_SESSION);
        assert_eq!(all.pending, 1);
        assert_eq!(all.blocked, 1);
    }

    #[test]
    fn finished_work_is_not_open() {
        let items = vec![item("c", WorkItemState::Complete, &["s1"])];
        assert!(!ItemCounts::for_session(&items, "s1").has_open_work());
    }

    #[tokio::test]
    async fn jsonl_source_reads_items() {
        let dir = TempDir::new().unwrap();
        let path = JsonlWorkItems::path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            concat!(
                r#"{"id": "b1", "title": "Parser", "state": "pending", "sessions": ["s1"]}"#,
                "\n\n",
                r#"{"id": "b2", "state": "in_progress"}"#,
                "\n"
            ),
        )
        .unwrap();

        let items = JsonlWorkItems.load(dir.path()).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].sessions, vec!["s1"]);
        assert_eq!(items[1].state, WorkItemState::InProgress);
    }

    #[tokio::test]
    async fn jsonl_source_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(JsonlWorkItems.load(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jsonl_source_reports_bad_line() {
        let dir = TempDir::new().unwrap();
        let path = JsonlWorkItems::path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"id\": \"b1\", \"state\": \"pending\"}\nnope\n").unwrap();

        let err = JsonlWorkItems.load(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
