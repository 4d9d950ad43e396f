use anyhow::{Context, Result};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;

use crate::protocol::codec::copy_exact;

/// Target size of one part. A file is cut into at most one part per started MiB.
pub const PART_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// Number of parts for a file of `size` bytes over `nodes` known nodes.
///
/// One part per started MiB, capped by the node count, never fewer than one.
pub fn part_count(size: u64, nodes: usize) -> usize {
    let wanted = size.div_ceil(PART_SIZE_THRESHOLD);
    wanted.min(nodes as u64).max(1) as usize
}

/// Contiguous byte ranges covering `0..size`. The first `size % count` ranges are
/// one byte longer than the rest.
pub fn part_ranges(size: u64, count: usize) -> Vec<Range<u64>> {
    let count = count.max(1) as u64;
    let base = size / count;
    let extra = size % count;

    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0;
    for i in 0..count {
        let len = base + u64::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

pub fn part_name(file_name: &str, index: usize) -> String {
    format!("{}.part{}", file_name, index)
}

/// Index of `part_name` as a part of `file_name`, if it is one.
pub fn part_index(file_name: &str, part_name: &str) -> Option<usize> {
    part_name
        .strip_prefix(file_name)?
        .strip_prefix(".part")?
        .parse()
        .ok()
}

/// One part cut from a local file, waiting to be sent.
#[derive(Debug, Clone)]
pub struct LocalPart {
    pub index: usize,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Cuts `source` into `count` part files inside `dir`.
pub async fn split_file(
    source: &Path,
    dir: &Path,
    file_name: &str,
    count: usize,
    idle: Duration,
) -> Result<Vec<LocalPart>> {
    let mut reader = File::open(source)
        .await
        .with_context(|| format!("opening {}", source.display()))?;
    let size = reader.metadata().await?.len();

    let mut parts = Vec::with_capacity(count);
    for (index, range) in part_ranges(size, count).into_iter().enumerate() {
        let name = part_name(file_name, index);
        let path = dir.join(&name);
        let len = range.end - range.start;

        let mut out = File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        copy_exact(&mut reader, &mut out, len, idle).await?;
        out.sync_all().await?;

        parts.push(LocalPart {
            index,
            name,
            path,
            size: len,
        });
    }

    tracing::debug!("Split {} ({} bytes) into {} part(s)", file_name, size, parts.len());
    Ok(parts)
}
