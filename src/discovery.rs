//! Session discovery across known projects.

use std::path::PathBuf;

use tokio::fs;

use crate::records::{self, AGGREGATE_SESSION, SessionKey};

/// Every session with an on-disk directory, projects in the given order and
/// session ids sorted within each project.
///
/// A project without a sessions directory contributes nothing. Any other
/// read failure is logged and that project is skipped.
pub async fn discover_sessions(projects: &[PathBuf]) -> Vec<SessionKey> {
    let mut keys = Vec::new();
    for project in projects {
        match project_sessions(project).await {
            Ok(ids) => keys.extend(ids.into_iter().map(|id| SessionKey::new(project, id))),
            Err(e) => {
                tracing::warn!(project = %project.display(), error = %e, "Failed to list sessions");
            }
        }
    }
    keys
}

/// Session ids of one project, aggregate id excluded.
pub async fn project_sessions(project: &std::path::Path) -> std::io::Result<Vec<String>> {
    let root = records::sessions_root(project);
    let mut read_dir = match fs::read_dir(&root).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut ids = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == AGGREGATE_SESSION || name.starts_with('.') {
            continue;
        }
        ids.push(name);
    }
    ids.sort();
    Ok(ids)
}
