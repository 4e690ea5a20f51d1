//! Process-wide session state (C12).
//!
//! `provctl` operates on one selected database at a time — a single
//! `<name>.db` file under the configured storage root. [`Session`] holds the
//! currently selected [`Store`]/[`VectorIndex`] pair (if any) plus the
//! loaded [`Config`]. `select` opens and migrates the target database before
//! replacing the current selection, so a bad name never clobbers a working
//! session; `create` makes a fresh database file and only touches the
//! current selection once creation has actually succeeded. Grounded on the
//! teacher's own config-as-snapshot pattern (`Config` loaded once, handed
//! around by reference) generalized to a swappable, lazily-opened handle.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::Config;
use crate::error::ProvenanceError;
use crate::schema;
use crate::store::Store;
use crate::vector::VectorIndex;

/// A selected database: its name plus the opened, migrated pool wrapped as
/// a [`Store`]/[`VectorIndex`] pair sharing one connection pool.
struct Selected {
    name: String,
    store: Store,
    vector_index: VectorIndex,
}

pub struct Session {
    config: Config,
    storage_path: PathBuf,
    selected: Option<Selected>,
}

fn db_path(storage_path: &Path, name: &str) -> PathBuf {
    storage_path.join(format!("{name}.db"))
}

/// Open and migrate the database at `path`, used both to select an existing
/// database and to verify a freshly created one is healthy before it
/// becomes the current selection.
async fn open_and_migrate(path: &Path) -> Result<(Store, VectorIndex)> {
    let cfg = Config {
        db: crate::config::DbConfig { path: path.to_path_buf() },
        default_ocr_mode: Default::default(),
        max_concurrent: 3,
        embedding_batch_size: 32,
        embedding_device: None,
        image_optimization: Default::default(),
        default_storage_path: path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let pool = schema::connect(&cfg).await?;
    schema::migrate(&pool).await?;
    Ok((Store::new(pool.clone()), VectorIndex::new(pool)))
}

impl Session {
    pub fn new(config: Config) -> Self {
        let storage_path = config.default_storage_path.clone();
        Session { config, storage_path, selected: None }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn selected_name(&self) -> Option<&str> {
        self.selected.as_ref().map(|s| s.name.as_str())
    }

    pub fn list_databases(&self) -> Result<Vec<String>> {
        if !self.storage_path.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.storage_path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("db") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Open `name`'s database, migrate it, and only then replace the
    /// current selection — the prior selection is left untouched if
    /// opening or migrating fails (§4.12).
    pub async fn select(&mut self, name: &str) -> Result<()> {
        let path = db_path(&self.storage_path, name);
        if !path.exists() {
            return Err(ProvenanceError::DatabaseNotFound { name: name.to_string() }.into());
        }
        let (store, vector_index) = open_and_migrate(&path).await?;
        self.selected = Some(Selected { name: name.to_string(), store, vector_index });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.selected = None;
    }

    /// Create a fresh `<name>.db`, optionally selecting it. The previous
    /// selection is only closed if creation (and, when `auto_select` is
    /// set, the subsequent open) succeeds (§4.12).
    pub async fn create(&mut self, name: &str, auto_select: bool) -> Result<()> {
        let path = db_path(&self.storage_path, name);
        if path.exists() {
            return Err(ProvenanceError::DatabaseAlreadyExists { name: name.to_string() }.into());
        }
        std::fs::create_dir_all(&self.storage_path)?;
        let (store, vector_index) = open_and_migrate(&path).await?;
        if auto_select {
            self.selected = Some(Selected { name: name.to_string(), store, vector_index });
        }
        Ok(())
    }

    /// Delete `name`'s database file (and WAL/SHM siblings). Clears the
    /// current selection first if it is the one being deleted.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let path = db_path(&self.storage_path, name);
        if !path.exists() {
            return Err(ProvenanceError::DatabaseNotFound { name: name.to_string() }.into());
        }
        if self.selected_name() == Some(name) {
            self.clear();
        }
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// The selected store/vector pair, or `database_not_selected` (§4.12).
    pub fn require(&self) -> Result<(&Store, &VectorIndex)> {
        match &self.selected {
            Some(s) => Ok((&s.store, &s.vector_index)),
            None => Err(ProvenanceError::DatabaseNotSelected.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(storage: PathBuf) -> Config {
        let mut cfg = Config::for_test(storage.join("unused.db"));
        cfg.default_storage_path = storage;
        cfg
    }

    #[tokio::test]
    async fn require_fails_without_selection() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path().to_path_buf()));
        let err = session.require().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProvenanceError>().unwrap().category(),
            "database_not_selected"
        );
    }

    #[tokio::test]
    async fn create_then_select_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(test_config(dir.path().to_path_buf()));
        session.create("alpha", false).await.unwrap();
        assert!(session.selected_name().is_none());

        session.select("alpha").await.unwrap();
        assert_eq!(session.selected_name(), Some("alpha"));
        assert!(session.require().is_ok());
    }

    #[tokio::test]
    async fn create_with_auto_select_selects_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(test_config(dir.path().to_path_buf()));
        session.create("beta", true).await.unwrap();
        assert_eq!(session.selected_name(), Some("beta"));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(test_config(dir.path().to_path_buf()));
        session.create("gamma", false).await.unwrap();
        let err = session.create("gamma", false).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProvenanceError>().unwrap().category(),
            "database_already_exists"
        );
    }

    #[tokio::test]
    async fn select_missing_database_preserves_prior_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(test_config(dir.path().to_path_buf()));
        session.create("kept", true).await.unwrap();

        let err = session.select("missing").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProvenanceError>().unwrap().category(),
            "database_not_found"
        );
        assert_eq!(session.selected_name(), Some("kept"));
    }

    #[tokio::test]
    async fn list_databases_returns_sorted_stems() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(test_config(dir.path().to_path_buf()));
        session.create("zeta", false).await.unwrap();
        session.create("alpha", false).await.unwrap();
        assert_eq!(session.list_databases().unwrap(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[tokio::test]
    async fn delete_clears_selection_if_selected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(test_config(dir.path().to_path_buf()));
        session.create("delme", true).await.unwrap();
        session.delete("delme").unwrap();
        assert!(session.selected_name().is_none());
        assert!(session.list_databases().unwrap().is_empty());
    }
}
