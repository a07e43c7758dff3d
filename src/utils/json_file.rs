use crate::error::{AppError, Result};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Records kept in a [`JsonCollection`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Reads a JSON array file. A missing file is an empty collection.
///
/// Records that do not decode are written to `<name>.corrupt-<ts>` and
/// skipped; the rest load normally. A file that is not a JSON array at all
/// (including bytes that are not UTF-8) is moved aside whole. Any other
/// read error is returned, so the caller never starts empty over data it
/// could not see.
pub async fn load<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist yet, starting empty", path.display());
            return Ok(Vec::new());
        }
        Err(e) => {
            error!("Failed to read {}: {}", path.display(), e);
            return Err(AppError::persistence(format!("read {}: {}", path.display(), e)));
        }
    };

    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let values = match serde_json::from_slice::<Vec<serde_json::Value>>(&raw) {
        Ok(values) => values,
        Err(e) => {
            error!("Failed to parse {}: {}", path.display(), e);
            let aside = corrupt_path(path);
            tokio::fs::rename(path, &aside)
                .await
                .map_err(|e| AppError::persistence(format!("move {} aside: {}", path.display(), e)))?;
            warn!("Moved unreadable file to {}", aside.display());
            return Ok(Vec::new());
        }
    };

    let mut items = Vec::with_capacity(values.len());
    let mut rejected = Vec::new();
    for value in values {
        match T::deserialize(&value) {
            Ok(item) => items.push(item),
            Err(e) => {
                let id = value.get("id").map(|id| id.to_string()).unwrap_or_else(|| "?".to_string());
                error!("Skipping record {} in {}: {}", id, path.display(), e);
                rejected.push(value);
            }
        }
    }

    if !rejected.is_empty() {
        let aside = corrupt_path(path);
        let content = serde_json::to_vec_pretty(&rejected)?;
        tokio::fs::write(&aside, &content)
            .await
            .map_err(|e| AppError::persistence(format!("write {}: {}", aside.display(), e)))?;
        warn!(
            "Quarantined {} unreadable records from {} in {}",
            rejected.len(),
            path.display(),
            aside.display()
        );
    }

    Ok(items)
}

/// Overwrites the whole file: written to a sibling temp file, then renamed.
pub async fn save<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::persistence(format!("create {}: {}", parent.display(), e)))?;
    }

    let content = serde_json::to_vec_pretty(items)?;
    let tmp = path.with_extension("json.tmp");

    tokio::fs::write(&tmp, &content)
        .await
        .map_err(|e| AppError::persistence(format!("write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AppError::persistence(format!("rename to {}: {}", path.display(), e)))?;

    Ok(())
}

fn corrupt_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "collection.json".to_string());
    path.with_file_name(format!("{}.corrupt-{}", name, Utc::now().format("%Y%m%d%H%M%S")))
}

/// A whole JSON file held in memory. Every mutation runs under one lock:
/// apply in memory, write the file, and restore the previous state if the
/// write fails.
pub struct JsonCollection<T: Record> {
    path: PathBuf,
    items: Mutex<Vec<T>>,
}

impl<T: Record> JsonCollection<T> {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = load(&path).await?;
        debug!("Loaded {} records from {}", items.len(), path.display());
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    pub async fn snapshot(&self) -> Vec<T> {
        self.items.lock().await.clone()
    }

    pub async fn find(&self, id: &str) -> Option<T> {
        self.items.lock().await.iter().find(|r| r.id() == id).cloned()
    }

    pub async fn find_by<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.items
            .lock()
            .await
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    pub async fn insert(&self, mut record: T) -> Result<T> {
        let mut items = self.items.lock().await;
        if items.iter().any(|r| r.id() == record.id()) {
            return Err(AppError::conflict("Registro com este id já existe"));
        }

        record.set_version(1);
        items.push(record.clone());

        if let Err(e) = save(&self.path, &items).await {
            items.pop();
            return Err(e);
        }
        Ok(record)
    }

    /// Applies `mutation` to the record with `id`. Returns `Ok(None)` when
    /// no such record exists. An error from the mutation leaves the
    /// collection untouched.
    pub async fn modify<F>(&self, id: &str, mutation: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let mut items = self.items.lock().await;
        let Some(index) = items.iter().position(|r| r.id() == id) else {
            return Ok(None);
        };

        let previous = items[index].clone();
        let mut updated = previous.clone();
        mutation(&mut updated)?;
        updated.set_version(previous.version() + 1);
        items[index] = updated.clone();

        if let Err(e) = save(&self.path, &items).await {
            items[index] = previous;
            return Err(e);
        }
        Ok(Some(updated))
    }

    pub async fn remove(&self, id: &str) -> Result<Option<T>> {
        let mut items = self.items.lock().await;
        let Some(index) = items.iter().position(|r| r.id() == id) else {
            return Ok(None);
        };

        let removed = items.remove(index);
        if let Err(e) = save(&self.path, &items).await {
            items.insert(index, removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    pub async fn replace_all(&self, records: Vec<T>) -> Result<()> {
        let mut items = self.items.lock().await;
        save(&self.path, &records).await?;
        *items = records;
        Ok(())
    }

    /// Writes the in-memory state back out, e.g. at shutdown.
    pub async fn flush(&self) -> Result<()> {
        let items = self.items.lock().await;
        save(&self.path, &items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        value: i32,
        #[serde(default)]
        versao: u64,
    }

    impl Record for Item {
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.versao
        }
        fn set_version(&mut self, version: u64) {
            self.versao = version;
        }
    }

    fn item(id: &str, value: i32) -> Item {
        Item { id: id.to_string(), value, versao: 0 }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<Item> = load(&dir.path().join("nada.json")).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agendamentos.json");
        tokio::fs::write(&path, "[{not json").await.unwrap();

        let items: Vec<Item> = load(&path).await.unwrap();
        assert!(items.is_empty());
        assert!(!path.exists());

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        let aside = entries.next().unwrap().unwrap().file_name();
        assert!(aside.to_string_lossy().starts_with("agendamentos.json.corrupt-"));
    }

    #[tokio::test]
    async fn test_bad_records_quarantined_good_ones_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let mixed = serde_json::json!([
            { "id": "a", "value": 1 },
            { "id": "b", "value": "muito" },
            { "id": "c", "value": 3 }
        ]);
        tokio::fs::write(&path, mixed.to_string()).await.unwrap();

        let collection = JsonCollection::<Item>::open(&path).await.unwrap();
        let ids: Vec<String> = collection.snapshot().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let aside = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.to_string_lossy().contains(".corrupt-"))
            .unwrap();
        let quarantined: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&aside).unwrap()).unwrap();
        assert_eq!(quarantined, serde_json::json!([{ "id": "b", "value": "muito" }]));

        // the next write keeps the good records
        collection.insert(item("d", 4)).await.unwrap();
        let reopened = JsonCollection::<Item>::open(&path).await.unwrap();
        assert_eq!(reopened.snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn test_non_utf8_file_moved_aside_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agendamentos.json");
        let latin1 = b"[{\"id\": \"a\", \"value\": 1, \"nota\": \"audi\xEAncia\"}]".to_vec();
        tokio::fs::write(&path, &latin1).await.unwrap();

        let collection = JsonCollection::<Item>::open(&path).await.unwrap();
        assert!(collection.snapshot().await.is_empty());
        collection.insert(item("b", 2)).await.unwrap();

        let aside = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.to_string_lossy().contains(".corrupt-"))
            .unwrap();
        assert_eq!(std::fs::read(aside).unwrap(), latin1);
    }

    #[tokio::test]
    async fn test_unreadable_path_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::create_dir(&path).unwrap();

        let result = JsonCollection::<Item>::open(&path).await;
        assert!(matches!(result, Err(AppError::Persistence(_))));
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        save(&path, &[item("a", 1), item("b", 2)]).await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();

        let loaded: Vec<Item> = load(&path).await.unwrap();
        save(&path, &loaded).await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_modify_bumps_version_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let collection = JsonCollection::<Item>::open(&path).await.unwrap();

        collection.insert(item("a", 1)).await.unwrap();
        let updated = collection
            .modify("a", |i| {
                i.value = 5;
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.versao, 2);

        let reopened = JsonCollection::<Item>::open(&path).await.unwrap();
        assert_eq!(reopened.find("a").await.unwrap().value, 5);
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state() {
        let dir = tempfile::tempdir().unwrap();
        let collection = JsonCollection::<Item>::open(dir.path().join("items.json")).await.unwrap();
        collection.insert(item("a", 1)).await.unwrap();

        let result = collection
            .modify("a", |i| {
                i.value = 99;
                Err(AppError::validation("nope"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(collection.find("a").await.unwrap().value, 1);
        assert!(collection.modify("zzz", |_| Ok(())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every write fail
        let path = dir.path().join("blocked.json");
        let collection = JsonCollection::<Item>::open(&path).await.unwrap();
        std::fs::create_dir(&path).unwrap();

        let result = collection.insert(item("a", 1)).await;
        assert!(matches!(result, Err(AppError::Persistence(_))));
        assert!(collection.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_modifications_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let collection = std::sync::Arc::new(
            JsonCollection::<Item>::open(dir.path().join("items.json")).await.unwrap(),
        );
        collection.insert(item("a", 0)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let c = collection.clone();
            handles.push(tokio::spawn(async move {
                c.modify("a", |i| {
                    i.value += 1;
                    Ok(())
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let final_item = collection.find("a").await.unwrap();
        assert_eq!(final_item.value, 20);
        assert_eq!(final_item.versao, 21);
    }
}
