//! Directory catalog: shares the regular files of one directory, writes downloads to another.
//!
//! Ids are file names. Hashes are computed the first time a file is seen and cached by
//! size and modification time; the directory itself is re-read on every listing.
//! Each download writes its own hidden `.part` file and is linked into place under a free
//! name on commit, so concurrent downloads of the same name never share or clobber a file.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use p2share_core::{hash_reader, ByteSource, Catalog, ContentHash, FileId, FileSink, SharedFileEntry};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Copy)]
struct CachedHash {
    size: u64,
    modified: Option<SystemTime>,
    hash: ContentHash,
}

pub struct DirCatalog {
    share_dir: PathBuf,
    download_dir: PathBuf,
    hashes: Mutex<HashMap<String, CachedHash>>,
}

impl DirCatalog {
    pub fn new(share_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            share_dir: share_dir.into(),
            download_dir: download_dir.into(),
            hashes: Mutex::new(HashMap::new()),
        }
    }

    pub fn share_dir(&self) -> &Path {
        &self.share_dir
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn describe(&self, name: &str, meta: &Metadata) -> io::Result<SharedFileEntry> {
        let size = meta.len();
        let modified = meta.modified().ok();
        let cached = self
            .hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .filter(|c| c.size == size && c.modified == modified);
        let hash = match cached {
            Some(c) => c.hash,
            None => {
                let file = File::open(self.share_dir.join(name)).await?;
                let (hash, _) = hash_reader(BufReader::new(file)).await?;
                debug!(file = name, size, %hash, "hashed shared file");
                self.hashes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), CachedHash { size, modified, hash });
                hash
            }
        };
        Ok(SharedFileEntry {
            id: FileId::new(name),
            name: name.to_string(),
            size,
            hash,
        })
    }
}

/// A shareable name: a single visible path component.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(|c: char| c == '/' || c == '\\')
}

#[async_trait]
impl Catalog for DirCatalog {
    async fn list_entries(&self) -> io::Result<Vec<SharedFileEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.share_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if !is_plain_name(&name) {
                continue;
            }
            let meta = tokio::fs::metadata(item.path()).await?;
            if !meta.is_file() {
                continue;
            }
            entries.push(self.describe(&name, &meta).await?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn entry(&self, id: &FileId) -> io::Result<Option<SharedFileEntry>> {
        if !is_plain_name(id.as_str()) {
            return Ok(None);
        }
        match tokio::fs::metadata(self.share_dir.join(id.as_str())).await {
            Ok(meta) if meta.is_file() => Ok(Some(self.describe(id.as_str(), &meta).await?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn open_for_read(&self, id: &FileId) -> io::Result<Option<ByteSource>> {
        if !is_plain_name(id.as_str()) {
            return Ok(None);
        }
        match File::open(self.share_dir.join(id.as_str())).await {
            Ok(file) => Ok(Some(Box::new(BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn open_for_write(&self, entry: &SharedFileEntry) -> io::Result<Box<dyn FileSink>> {
        let name = Path::new(&entry.name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| is_plain_name(n))
            .unwrap_or("download")
            .to_string();
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let part = self
            .download_dir
            .join(format!(".{name}.{}.part", Uuid::new_v4().simple()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)
            .await?;
        Ok(Box::new(PartFile {
            file: BufWriter::new(file),
            part,
            dir: self.download_dir.clone(),
            name,
        }))
    }
}

/// Download in progress: a hidden `.part` file renamed into place on commit.
struct PartFile {
    file: BufWriter<File>,
    part: PathBuf,
    dir: PathBuf,
    name: String,
}

/// Candidate names for `name`: `name`, then `stem (1).ext`, `stem (2).ext`, ...
fn candidate(dir: &Path, name: &str, counter: u32) -> PathBuf {
    if counter == 0 {
        return dir.join(name);
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| format!(".{s}"))
        .unwrap_or_default();
    dir.join(format!("{stem} ({counter}){ext}"))
}

/// Move `part` to the first free name in `dir`. Linking fails instead of replacing an
/// existing file, so a name taken meanwhile just moves on to the next candidate.
async fn publish(part: &Path, dir: &Path, name: &str) -> io::Result<PathBuf> {
    let mut counter = 0;
    loop {
        let target = candidate(dir, name, counter);
        match tokio::fs::hard_link(part, &target).await {
            Ok(()) => {
                tokio::fs::remove_file(part).await?;
                return Ok(target);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl FileSink for PartFile {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        let PartFile {
            mut file,
            part,
            dir,
            name,
        } = *self;
        file.flush().await?;
        file.get_ref().sync_all().await?;
        drop(file);
        let target = publish(&part, &dir, &name).await?;
        info!(path = %target.display(), "download saved");
        Ok(())
    }

    async fn discard(self: Box<Self>) -> io::Result<()> {
        let PartFile { file, part, .. } = *self;
        drop(file);
        match tokio::fs::remove_file(&part).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
