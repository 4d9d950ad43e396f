use anyhow::{Context, Result, bail};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::protocol::codec::copy_exact;

/// Prefix of in-flight files; never visible as parts.
const INCOMING_PREFIX: &str = ".incoming-";

/// Local directory of parts owned by one storage node.
///
/// Part names are relative paths under the root. A part becomes visible only once
/// all of its bytes are on disk: writes go to a hidden sibling and are renamed
/// into place.
pub struct PartStore {
    root: PathBuf,
}

impl PartStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating storage directory {}", root.display()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a part name to its file, refusing anything that escapes the root.
    pub fn part_path(&self, part_name: &str) -> Result<PathBuf> {
        validate_part_name(part_name)?;
        Ok(self.root.join(part_name))
    }

    /// Receives exactly `size` bytes from `reader` into the named part.
    pub async fn write_part<R>(
        &self,
        part_name: &str,
        reader: &mut R,
        size: u64,
        idle: Duration,
    ) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.part_path(part_name)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let tmp = parent.join(format!("{}{}", INCOMING_PREFIX, Uuid::new_v4()));
        let received = async {
            let mut file = File::create(&tmp).await?;
            copy_exact(reader, &mut file, size, idle).await?;
            file.sync_all().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(e) = received {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                tracing::debug!("Could not remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e.context(format!("receiving part {}", part_name)));
        }

        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("moving part {} into place", part_name))?;

        Ok(path)
    }

    /// Opens a part for reading. `None` when the part does not exist.
    pub async fn open_part(&self, part_name: &str) -> Result<Option<(File, u64)>> {
        let path = self.part_path(part_name)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("opening part {}", part_name)),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some((file, metadata.len())))
    }

    /// Removes a part. Returns `false` when there was nothing to remove.
    pub async fn delete_part(&self, part_name: &str) -> Result<bool> {
        let path = self.part_path(part_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("deleting part {}", part_name)),
        }
    }

    pub async fn contains(&self, part_name: &str) -> bool {
        match self.part_path(part_name) {
            Ok(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Names of all complete parts, sorted.
    pub async fn list_parts(&self) -> Result<Vec<String>> {
        let mut parts = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file()
                    && !entry.file_name().to_string_lossy().starts_with(INCOMING_PREFIX)
                    && let Ok(relative) = path.strip_prefix(&self.root)
                {
                    let name: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    parts.push(name.join("/"));
                }
            }
        }

        parts.sort();
        Ok(parts)
    }
}

/// Accepts only relative names made of normal path components.
pub fn validate_part_name(part_name: &str) -> Result<()> {
    if part_name.trim().is_empty() {
        bail!("empty part name");
    }

    let path = Path::new(part_name);
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("part name '{}' is not a plain relative path", part_name);
    }

    let hidden_incoming = path
        .file_name()
        .map(|name| name.to_string_lossy().starts_with(INCOMING_PREFIX))
        .unwrap_or(true);
    if hidden_incoming {
        bail!("part name '{}' is reserved", part_name);
    }

    Ok(())
}
