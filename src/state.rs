use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tracing::{debug, warn};

/// Path of the fragment that tracks range `index` of `target`: `<target>-<index>`.
///
/// The fragment's length is its byte count and it never holds data, so it costs no disk
/// space where files can be sparse. Filesystems without sparse files (exFAT, NTFS
/// without the sparse flag) allocate the full length, which doubles disk use during a
/// download, and FAT32 cannot record a count above 4 GiB.
pub fn fragment_path(target: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(format!("-{}", index));
    PathBuf::from(name)
}

/// Per-range byte counts persisted by an earlier run.
///
/// A fragment is a marker file whose length equals the number of bytes of its range
/// that have already been written to the output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialState {
    pub persisted: Vec<u64>,
}

impl PartialState {
    pub fn fresh(ranges: usize) -> Self {
        Self { persisted: vec![0; ranges] }
    }

    /// Reads the fragments of `target` for a run with `ranges` workers.
    ///
    /// Every run creates all of its fragments up front, so a usable set is exactly
    /// `0..ranges`. Anything else was left by a run with a different worker count (or
    /// its output was removed) and is discarded.
    pub async fn load(target: &Path, ranges: usize) -> io::Result<Self> {
        let mut persisted = Vec::with_capacity(ranges);
        let mut present = 0;
        for index in 0..ranges {
            match fs::metadata(fragment_path(target, index)).await {
                Ok(meta) => {
                    present += 1;
                    persisted.push(meta.len());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => persisted.push(0),
                Err(e) => return Err(e),
            }
        }

        if present == 0 {
            return Ok(Self::fresh(ranges));
        }

        let stray = fs::try_exists(fragment_path(target, ranges)).await?;
        let output_exists = fs::try_exists(target).await?;
        if present != ranges || stray || !output_exists {
            warn!(
                target = %target.display(),
                present,
                expected = ranges,
                "discarding fragments from an incompatible earlier run"
            );
            let mut upper = ranges;
            while fs::try_exists(fragment_path(target, upper)).await? {
                upper += 1;
            }
            clear(target, upper).await?;
            return Ok(Self::fresh(ranges));
        }

        debug!(target = %target.display(), ?persisted, "found fragments");
        Ok(Self { persisted })
    }

    pub fn total(&self) -> u64 {
        self.persisted.iter().sum()
    }
}

/// Sets the fragment of each range to its planned persisted count, so the set on disk
/// matches the plan before any worker starts.
pub async fn prepare(target: &Path, persisted: &[u64]) -> io::Result<()> {
    for (index, count) in persisted.iter().enumerate() {
        record(target, index, *count).await?;
    }
    Ok(())
}

/// Records that `persisted` bytes of range `index` are on disk.
pub async fn record(target: &Path, index: usize, persisted: u64) -> io::Result<()> {
    let fragment = OpenOptions::new()
        .create(true)
        .write(true)
        .open(fragment_path(target, index))
        .await?;
    fragment.set_len(persisted).await
}

/// Removes the fragments `0..ranges` of `target`, ignoring missing ones.
pub async fn clear(target: &Path, ranges: usize) -> io::Result<()> {
    for index in 0..ranges {
        match fs::remove_file(fragment_path(target, index)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_names_derive_from_target() {
        let target = Path::new("/tmp/out/file.iso");
        assert_eq!(fragment_path(target, 0), PathBuf::from("/tmp/out/file.iso-0"));
        assert_eq!(fragment_path(target, 12), PathBuf::from("/tmp/out/file.iso-12"));
    }

    #[tokio::test]
    async fn no_fragments_means_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");

        let state = PartialState::load(&target, 4).await.unwrap();
        assert_eq!(state, PartialState::fresh(4));
        assert_eq!(state.total(), 0);
    }

    #[tokio::test]
    async fn recorded_sizes_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"").unwrap();

        prepare(&target, &[0, 0, 0]).await.unwrap();
        record(&target, 0, 100).await.unwrap();
        record(&target, 2, 7).await.unwrap();

        let state = PartialState::load(&target, 3).await.unwrap();
        assert_eq!(state.persisted, vec![100, 0, 7]);
        assert_eq!(state.total(), 107);
    }

    #[tokio::test]
    async fn fragments_from_other_worker_count_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"").unwrap();

        prepare(&target, &[0, 50, 0, 0]).await.unwrap();
        record(&target, 1, 50).await.unwrap();

        let state = PartialState::load(&target, 2).await.unwrap();
        assert_eq!(state, PartialState::fresh(2));
        for index in 0..4 {
            assert!(!fragment_path(&target, index).exists());
        }
    }

    #[tokio::test]
    async fn fragments_without_output_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");

        prepare(&target, &[10, 0]).await.unwrap();
        record(&target, 0, 10).await.unwrap();

        let state = PartialState::load(&target, 2).await.unwrap();
        assert_eq!(state.total(), 0);
        assert!(!fragment_path(&target, 0).exists());
    }

    #[tokio::test]
    async fn prepare_resets_stale_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"").unwrap();

        record(&target, 0, 900).await.unwrap();
        prepare(&target, &[0]).await.unwrap();
        let state = PartialState::load(&target, 1).await.unwrap();
        assert_eq!(state.persisted, vec![0]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn recorded_fragment_allocates_no_data() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");

        record(&target, 0, 64 << 20).await.unwrap();
        let meta = std::fs::metadata(fragment_path(&target, 0)).unwrap();
        assert_eq!(meta.len(), 64 << 20);
        assert!(meta.blocks() * 512 < 1 << 20);
    }

    #[tokio::test]
    async fn clear_removes_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");

        prepare(&target, &[5, 5, 5]).await.unwrap();
        clear(&target, 3).await.unwrap();
        for index in 0..3 {
            assert!(!fragment_path(&target, index).exists());
        }
        clear(&target, 3).await.unwrap();
    }
}
