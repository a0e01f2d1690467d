//! Flat-file stores for the problem catalog and interview sessions.
//!
//! Both stores are explicit instances owned by the caller. The execution core
//! only sees them through the narrow `ProblemSource` / `SessionRepository`
//! traits, so tests can substitute in-memory fakes.

use crate::types::{Problem, ProblemSummary, Session, SessionUpdate};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PROBLEM_INDEX_FILE: &str = "problem_index.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode session {id}: {source}")]
    Encode {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Read access to problem definitions.
pub trait ProblemSource: Send + Sync {
    fn get_problem(&self, id: &str) -> Option<Arc<Problem>>;
}

/// Read/write access to sessions.
pub trait SessionRepository: Send + Sync {
    fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
    fn save_session(&self, session: &Session) -> Result<(), StoreError>;
}

#[derive(Debug, Deserialize)]
struct ProblemIndex {
    problems: Vec<ProblemIndexEntry>,
}

#[derive(Debug, Deserialize)]
struct ProblemIndexEntry {
    file: String,
}

type ProblemMap = HashMap<String, Arc<Problem>>;

/// Problem catalog loaded from `problem_index.json` and the files it lists.
pub struct ProblemCatalog {
    data_dir: PathBuf,
    problems: RwLock<Arc<ProblemMap>>,
}

impl ProblemCatalog {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let problems = load_problems(&data_dir)?;
        info!(
            data_dir = %data_dir.display(),
            problems = problems.len(),
            "Problem catalog loaded"
        );
        Ok(Self {
            data_dir,
            problems: RwLock::new(Arc::new(problems)),
        })
    }

    /// Re-read the catalog from disk. The previous contents stay in place if
    /// loading fails.
    pub fn reload(&self) -> Result<usize> {
        let fresh = load_problems(&self.data_dir)?;
        let count = fresh.len();
        *self.problems.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(fresh);
        info!(problems = count, "Problem catalog reloaded");
        Ok(count)
    }

    fn snapshot(&self) -> Arc<ProblemMap> {
        self.problems.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Problem>> {
        self.snapshot().get(id).cloned()
    }

    pub fn list(&self, category: Option<&str>, difficulty: Option<&str>) -> Vec<ProblemSummary> {
        let snapshot = self.snapshot();
        let mut summaries: Vec<ProblemSummary> = snapshot
            .values()
            .filter(|p| category.map_or(true, |c| p.category == c))
            .filter(|p| difficulty.map_or(true, |d| p.difficulty == d))
            .map(|p| p.summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl ProblemSource for ProblemCatalog {
    fn get_problem(&self, id: &str) -> Option<Arc<Problem>> {
        self.get(id)
    }
}

fn load_problems(data_dir: &Path) -> Result<ProblemMap> {
    let index_path = data_dir.join(PROBLEM_INDEX_FILE);
    let content = fs::read_to_string(&index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;
    let index: ProblemIndex = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", index_path.display()))?;

    let mut problems = HashMap::new();
    for entry in index.problems {
        let file_path = data_dir.join(&entry.file);
        let content = fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read {}", file_path.display()))?;
        let problem: Problem = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", file_path.display()))?;

        debug!(
            id = %problem.id,
            fixtures = problem.test_cases.len(),
            hidden = problem.test_cases.iter().filter(|tc| tc.is_hidden).count(),
            "Loaded problem"
        );

        if problems.contains_key(&problem.id) {
            bail!("Duplicate problem id '{}' in {}", problem.id, file_path.display());
        }
        problems.insert(problem.id.clone(), Arc::new(problem));
    }

    Ok(problems)
}

/// One JSON file per session under `sessions_dir`.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn create(&self, problem: &Problem) -> Result<Session, StoreError> {
        let session = Session::new(problem);
        self.save(&session)?;
        info!(session_id = %session.id, problem_id = %problem.id, "Session created");
        Ok(session)
    }

    /// Ids that are not UUIDs never reach the filesystem.
    pub fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let Ok(id) = Uuid::parse_str(id) else {
            return Ok(None);
        };
        let path = self.path_for(&id);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|source| StoreError::Decode { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub fn update(&self, id: &str, update: SessionUpdate) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.get(id)? else {
            return Ok(None);
        };
        update.apply(&mut session);
        self.save(&session)?;
        Ok(Some(session))
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<Session>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<Session>(&content).ok());
            match parsed {
                Some(session) => sessions.push(session),
                None => warn!(path = %path.display(), "Skipping unreadable session file"),
            }
        }

        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    /// Write through a temp file in the same directory and rename it into
    /// place, so readers see either the old or the new session.
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.path_for(&session.id);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let payload = serde_json::to_vec_pretty(session).map_err(|source| StoreError::Encode {
            id: session.id,
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&payload).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl SessionRepository for SessionStore {
    fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.get(id)
    }

    fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.save(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;
    use tempfile::TempDir;

    fn write_problem(dir: &Path, file: &str, id: &str, category: &str) {
        let problem = serde_json::json!({
            "id": id,
            "title": id.to_uppercase(),
            "category": category,
            "difficulty": "easy",
            "description": "",
            "starter_code": "def solve():\n    pass\n",
            "test_cases": [
                {"input": "solve()", "expected": "None"},
                {"input": "solve()", "expected": "None", "is_hidden": true}
            ]
        });
        fs::write(dir.join(file), problem.to_string()).unwrap();
    }

    fn write_index(dir: &Path, files: &[&str]) {
        let entries: Vec<_> = files.iter().map(|f| serde_json::json!({ "file": f })).collect();
        let index = serde_json::json!({ "problems": entries });
        fs::write(dir.join(PROBLEM_INDEX_FILE), index.to_string()).unwrap();
    }

    #[test]
    fn test_catalog_loads_and_filters() {
        let dir = TempDir::new().unwrap();
        write_problem(dir.path(), "a.json", "alpha", "algorithms");
        write_problem(dir.path(), "b.json", "beta", "fastapi");
        write_index(dir.path(), &["b.json", "a.json"]);

        let catalog = ProblemCatalog::open(dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);

        let all = catalog.list(None, None);
        assert_eq!(all[0].id, "alpha");
        assert_eq!(all[1].id, "beta");

        let algos = catalog.list(Some("algorithms"), None);
        assert_eq!(algos.len(), 1);
        assert!(catalog.list(None, Some("hard")).is_empty());

        let alpha = catalog.get_problem("alpha").unwrap();
        assert_eq!(alpha.visible_fixtures().count(), 1);
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn test_catalog_rejects_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        write_problem(dir.path(), "a.json", "alpha", "algorithms");
        write_problem(dir.path(), "b.json", "alpha", "algorithms");
        write_index(dir.path(), &["a.json", "b.json"]);

        assert!(ProblemCatalog::open(dir.path()).is_err());
    }

    #[test]
    fn test_catalog_reload_picks_up_changes_and_survives_failure() {
        let dir = TempDir::new().unwrap();
        write_problem(dir.path(), "a.json", "alpha", "algorithms");
        write_index(dir.path(), &["a.json"]);
        let catalog = ProblemCatalog::open(dir.path()).unwrap();

        write_problem(dir.path(), "b.json", "beta", "algorithms");
        write_index(dir.path(), &["a.json", "b.json"]);
        assert_eq!(catalog.reload().unwrap(), 2);
        assert!(catalog.get("beta").is_some());

        fs::write(dir.path().join(PROBLEM_INDEX_FILE), "{ not json").unwrap();
        assert!(catalog.reload().is_err());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_session_round_trip_and_update() {
        let dir = TempDir::new().unwrap();
        let catalog_dir = TempDir::new().unwrap();
        write_problem(catalog_dir.path(), "a.json", "alpha", "algorithms");
        write_index(catalog_dir.path(), &["a.json"]);
        let catalog = ProblemCatalog::open(catalog_dir.path()).unwrap();
        let problem = catalog.get("alpha").unwrap();

        let store = SessionStore::open(dir.path().join("sessions")).unwrap();
        let session = store.create(&problem).unwrap();

        let loaded = store.get(&session.id.to_string()).unwrap().unwrap();
        assert_eq!(loaded.code, problem.starter_code);

        let updated = store
            .update(
                &session.id.to_string(),
                SessionUpdate {
                    code: Some("def solve():\n    return None\n".to_string()),
                    status: Some(SessionStatus::Scored),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Scored);

        let reloaded = store.get_session(&session.id.to_string()).unwrap().unwrap();
        assert!(reloaded.code.contains("return None"));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_session_lookup_rejects_non_uuid_ids() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        assert!(store.get("../../etc/passwd").unwrap().is_none());
        assert!(store.get(&Uuid::new_v4().to_string()).unwrap().is_none());
        assert!(store.update("nope", SessionUpdate::default()).unwrap().is_none());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let problem: Problem = serde_json::from_value(serde_json::json!({
            "id": "p", "title": "P", "category": "algorithms", "difficulty": "easy",
            "description": "", "starter_code": "", "test_cases": []
        }))
        .unwrap();

        let session = store.create(&problem).unwrap();
        store.save(&session).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("{}.json", session.id)]);
    }
}
