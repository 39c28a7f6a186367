// Directory-backed store: one JSON object file per collection, locked read-modify-write,
// polling watches.
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::ids::auto_id;
use crate::core::record::{Fields, Filter, Record};
use crate::core::store::{
    DocSnapshot, QuerySnapshot, Store, Subscription, validate_collection_name, validate_record_id,
};

const EXTENSION: &str = "json";
const LOCK_RETRY: Duration = Duration::from_millis(5);

type Collection = BTreeMap<String, Fields>;

#[derive(Clone, Copy, Debug)]
pub struct FileStoreOptions {
    pub poll_interval: Duration,
    /// How long to wait for a contended collection lock before failing with `Unavailable`.
    pub lock_timeout: Duration,
}

impl FileStoreOptions {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct FileStore {
    root: Arc<PathBuf>,
    options: FileStoreOptions,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::open_with_options(root, FileStoreOptions::default())
    }

    pub fn open_with_options(
        root: impl Into<PathBuf>,
        options: FileStoreOptions,
    ) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to create store directory")
                .with_path(&root)
                .with_source(err)
        })?;
        Ok(Self {
            root: Arc::new(root),
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: &str) -> Result<PathBuf, Error> {
        validate_collection_name(collection)?;
        Ok(self.root.join(format!("{collection}.{EXTENSION}")))
    }

    async fn read<T, F>(&self, collection: &str, read: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Collection) -> T + Send + 'static,
    {
        let path = self.collection_path(collection)?;
        let lock_timeout = self.options.lock_timeout;
        blocking(move || {
            let records = read_collection(&path, lock_timeout)?;
            Ok(read(&records))
        })
        .await
    }

    async fn write<T, F>(&self, collection: &str, write: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut Collection) -> Result<T, Error> + Send + 'static,
    {
        let path = self.collection_path(collection)?;
        let lock_timeout = self.options.lock_timeout;
        blocking(move || {
            let mut file = open_locked(&path, lock_timeout)?;
            let mut records = decode_collection(&mut file, &path)?;
            let out = write(&mut records)?;
            encode_collection(&mut file, &path, &records)?;
            // Lock is released when `file` closes.
            Ok(out)
        })
        .await
    }

    fn spawn_poller<T, F>(&self, collection: &str, project: F) -> Result<Subscription<T>, Error>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn(&Collection) -> T + Send + Sync + 'static,
    {
        let path = self.collection_path(collection)?;
        let poll_interval = self.options.poll_interval;
        let lock_timeout = self.options.lock_timeout;
        let (tx, subscription) = Subscription::channel();
        let collection = collection.to_string();
        tokio::spawn(async move {
            let project = Arc::new(project);
            let mut last: Option<T> = None;
            let mut last_error: Option<String> = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let read_path = path.clone();
                let read_project = Arc::clone(&project);
                let result = blocking(move || {
                    read_collection(&read_path, lock_timeout).map(|c| (*read_project)(&c))
                })
                .await;
                match result {
                    Ok(snapshot) => {
                        last_error = None;
                        if last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        last = Some(snapshot.clone());
                        if tx.send(Ok(snapshot)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // Each distinct failure is reported once; polling continues quietly.
                        let description = err.to_string();
                        if last_error.as_deref() == Some(description.as_str()) {
                            continue;
                        }
                        last_error = Some(description);
                        last = None;
                        warn!(collection = %collection, error = %err, "store poll failed");
                        if tx.send(Err(err)).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(collection = %collection, "store watcher stopped");
        });
        Ok(subscription)
    }
}

impl Store for FileStore {
    async fn get(&self, collection: &str, id: &str) -> Result<DocSnapshot, Error> {
        validate_record_id(collection, id)?;
        let id = id.to_string();
        self.read(collection, move |records| doc_snapshot(records, &id))
            .await
    }

    async fn query(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> Result<QuerySnapshot, Error> {
        let filter = filter.cloned();
        self.read(collection, move |records| {
            query_snapshot(records, filter.as_ref())
        })
        .await
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<String, Error> {
        self.write(collection, move |records| {
            let mut id = auto_id()?;
            while records.contains_key(&id) {
                id = auto_id()?;
            }
            records.insert(id.clone(), fields);
            Ok(id)
        })
        .await
    }

    async fn update(&self, collection: &str, id: &str, changes: Fields) -> Result<(), Error> {
        validate_record_id(collection, id)?;
        let owned_collection = collection.to_string();
        let id = id.to_string();
        self.write(collection, move |records| {
            let existing = records.get_mut(&id).ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message("cannot update a missing record")
                    .with_collection(owned_collection)
                    .with_id(id.clone())
            })?;
            existing.extend(changes);
            Ok(())
        })
        .await
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), Error> {
        validate_record_id(collection, id)?;
        let id = id.to_string();
        self.write(collection, move |records| {
            records.insert(id, fields);
            Ok(())
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error> {
        validate_record_id(collection, id)?;
        let id = id.to_string();
        self.write(collection, move |records| {
            records.remove(&id);
            Ok(())
        })
        .await
    }

    async fn watch(&self, collection: &str, id: &str) -> Result<Subscription<DocSnapshot>, Error> {
        validate_record_id(collection, id)?;
        let id = id.to_string();
        self.spawn_poller(collection, move |records| doc_snapshot(records, &id))
    }

    async fn watch_query(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> Result<Subscription<QuerySnapshot>, Error> {
        let filter = filter.cloned();
        self.spawn_poller(collection, move |records| {
            query_snapshot(records, filter.as_ref())
        })
    }
}

fn doc_snapshot(records: &Collection, id: &str) -> DocSnapshot {
    records
        .get(id)
        .map(|fields| Record::new(id, fields.clone()))
}

fn query_snapshot(records: &Collection, filter: Option<&Filter>) -> QuerySnapshot {
    records
        .iter()
        .filter(|(_, fields)| filter.is_none_or(|filter| filter.matches(fields)))
        .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
        .collect()
}

async fn blocking<T, F>(work: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("store worker failed")
            .with_source(err)
    })?
}

fn read_collection(path: &Path, lock_timeout: Duration) -> Result<Collection, Error> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Collection::new()),
        Err(err) => {
            return Err(Error::new(io_error_kind(&err))
                .with_path(path)
                .with_source(err));
        }
    };
    lock_with_retry(path, lock_timeout, || FileExt::try_lock_shared(&file))?;
    decode_collection(&mut file, path)
}

fn open_locked(path: &Path, lock_timeout: Duration) -> Result<File, Error> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_path(path)
                .with_source(err)
        })?;
    lock_with_retry(path, lock_timeout, || FileExt::try_lock_exclusive(&file))?;
    Ok(file)
}

/// Retries a non-blocking lock until it is granted or `timeout` passes.
fn lock_with_retry(
    path: &Path,
    timeout: Duration,
    mut try_lock: impl FnMut() -> std::io::Result<()>,
) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        match try_lock() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(lock_error(path, err)
                        .with_hint("Another process holds the collection lock; retry shortly."));
                }
                std::thread::sleep(LOCK_RETRY);
            }
            Err(err) => return Err(lock_error(path, err)),
        }
    }
}

fn lock_error(path: &Path, err: std::io::Error) -> Error {
    Error::new(io_error_kind(&err))
        .with_message("failed to lock collection file")
        .with_path(path)
        .with_source(err)
}

fn decode_collection(file: &mut File, path: &Path) -> Result<Collection, Error> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut text))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    if text.trim().is_empty() {
        return Ok(Collection::new());
    }
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("collection file is not valid JSON")
            .with_path(path)
            .with_source(err)
    })?;
    let Value::Object(entries) = value else {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("collection file must hold a JSON object")
            .with_path(path));
    };
    let mut records = Collection::new();
    for (id, fields) in entries {
        let Value::Object(fields) = fields else {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("record must be a JSON object")
                .with_path(path)
                .with_id(id));
        };
        records.insert(id, fields);
    }
    Ok(records)
}

fn encode_collection(file: &mut File, path: &Path, records: &Collection) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(records).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode collection")
            .with_source(err)
    })?;
    file.set_len(0)
        .and_then(|_| file.seek(SeekFrom::Start(0)))
        .and_then(|_| file.write_all(&bytes))
        .and_then(|_| file.flush())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))
}
