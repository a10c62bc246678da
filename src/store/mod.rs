// Persistent per-document JSON blobs.
//
// Layout: `<data>/<collection>/<id>.json`, each file holding the full
// document (id, data, created_at, updated_at, version). Writes go through a
// temp file and rename so readers never observe a torn blob.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::document::Document;
use crate::error::{DbError, Result};

/// On-disk document store rooted at the engine data directory.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DiskStore { root })
    }

    /// Path of a document's backing file.
    pub fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(collection).join(format!("{id}.json"))
    }

    /// Writes (or replaces) a document blob. Returns the backing path.
    pub fn save(&self, collection: &str, doc: &Document) -> Result<PathBuf> {
        let dir = self.root.join(collection);
        fs::create_dir_all(&dir)?;
        let path = self.document_path(collection, &doc.id);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(serde_json::to_string_pretty(doc)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Loads one document blob.
    pub fn load(&self, collection: &str, id: &str) -> Result<Document> {
        let path = self.document_path(collection, id);
        let file = File::open(&path)
            .map_err(|_| DbError::not_found(format!("{collection}/{id} on disk")))?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Removes a document blob; missing files are fine.
    pub fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let path = self.document_path(collection, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a whole collection directory.
    pub fn remove_collection(&self, collection: &str) -> Result<()> {
        let dir = self.root.join(collection);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads every document of a collection. Unreadable blobs are skipped
    /// with a warning rather than failing the hydrate.
    pub fn load_collection(&self, collection: &str) -> Result<Vec<Document>> {
        let dir = self.root.join(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut docs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::open(&path).map_err(DbError::from).and_then(|f| {
                serde_json::from_reader::<_, Document>(f).map_err(DbError::from)
            }) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable blob"),
            }
        }
        Ok(docs)
    }

    /// Collection directory names present on disk.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
