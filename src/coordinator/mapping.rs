use anyhow::{Context, Result, bail};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::splitter::part_index;
use crate::discovery::types::StorageNodeAddress;

/// Primary location of one part of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub file_name: String,
    pub part_name: String,
    pub node: StorageNodeAddress,
}

impl MappingEntry {
    pub fn new(
        file_name: impl Into<String>,
        part_name: impl Into<String>,
        node: StorageNodeAddress,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            part_name: part_name.into(),
            node,
        }
    }

    /// `fileName,partName,host:port`
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.file_name, self.part_name, self.node)
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.splitn(3, ',').map(str::trim);
        let (Some(file_name), Some(part_name), Some(node)) =
            (fields.next(), fields.next(), fields.next())
        else {
            bail!("expected 3 comma-separated fields");
        };
        if file_name.is_empty() || part_name.is_empty() {
            bail!("empty file or part name");
        }

        Ok(Self::new(file_name, part_name, node.parse()?))
    }
}

/// File names must survive the line format of the mapping file and stay inside a
/// scratch directory when used as a path component.
pub fn validate_file_name(file_name: &str) -> Result<()> {
    if file_name.trim().is_empty() {
        bail!("empty file name");
    }
    if file_name == "." || file_name == ".." {
        bail!("'{}' is not a file name", file_name);
    }
    if let Some(bad) = file_name
        .chars()
        .find(|c| matches!(c, ',' | '\n' | '\r' | '/' | '\\'))
    {
        bail!("file name contains {:?}", bad);
    }
    if file_name.trim() != file_name {
        bail!("file name has surrounding whitespace");
    }
    Ok(())
}

/// Durable index of where every part of every file lives.
///
/// The file is the record; the in-memory copy is rebuilt from it on open. Appends
/// write the file first, deletes rewrite it through a temporary file and a rename,
/// and both happen under one lock.
pub struct MappingIndex {
    path: PathBuf,
    entries: Mutex<Vec<MappingEntry>>,
}

impl MappingIndex {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse_mapping(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&path, b"").await?;
                Vec::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading mapping {}", path.display()));
            }
        };
        tracing::info!("Loaded {} mapping entries from {}", entries.len(), path.display());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, new_entries: &[MappingEntry]) -> Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.lock().await;

        let mut text = String::new();
        // A hand-edited file may lack its final newline
        if lacks_final_newline(&self.path).await? {
            text.push('\n');
        }
        for entry in new_entries {
            text.push_str(&entry.to_line());
            text.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening mapping {}", self.path.display()))?;
        file.write_all(text.as_bytes()).await?;
        file.sync_all().await?;

        entries.extend_from_slice(new_entries);
        Ok(())
    }

    /// Entries of `file_name`, ordered by part index.
    pub async fn entries_for(&self, file_name: &str) -> Vec<MappingEntry> {
        let entries = self.entries.lock().await;
        let mut found: Vec<MappingEntry> = entries
            .iter()
            .filter(|entry| entry.file_name == file_name)
            .cloned()
            .collect();
        found.sort_by_key(|entry| part_index(file_name, &entry.part_name).unwrap_or(usize::MAX));
        found
    }

    pub async fn contains_file(&self, file_name: &str) -> bool {
        self.entries
            .lock()
            .await
            .iter()
            .any(|entry| entry.file_name == file_name)
    }

    /// Distinct file names, in the order they first appear.
    pub async fn file_names(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut names: Vec<String> = Vec::new();
        for entry in entries.iter() {
            if !names.contains(&entry.file_name) {
                names.push(entry.file_name.clone());
            }
        }
        names
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Removes every entry of `file_name` and returns them.
    pub async fn remove_file(&self, file_name: &str) -> Result<Vec<MappingEntry>> {
        let mut entries = self.entries.lock().await;
        let (removed, kept): (Vec<MappingEntry>, Vec<MappingEntry>) = entries
            .iter()
            .cloned()
            .partition(|entry| entry.file_name == file_name);
        if removed.is_empty() {
            return Ok(removed);
        }

        let text: String = kept.iter().map(|entry| entry.to_line() + "\n").collect();
        let tmp = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(text.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("replacing mapping {}", self.path.display()));
        }

        *entries = kept;
        tracing::info!("Removed {} mapping entries of {}", removed.len(), file_name);
        Ok(removed)
    }
}

async fn lacks_final_newline(path: &Path) -> Result<bool> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    Ok(file.read_u8().await? != b'\n')
}

/// Parses the mapping file, skipping lines that do not hold a valid entry.
pub fn parse_mapping(text: &str) -> Vec<MappingEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match MappingEntry::parse_line(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping mapping line '{}': {}", line, e);
                None
            }
        })
        .collect()
}
