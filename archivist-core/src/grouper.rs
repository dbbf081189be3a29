/*!
Partitioning of staged files into size- and count-bounded groups.

Each group becomes one archive. Grouping is a greedy single pass over the
files in arrival order, so concatenating the groups reproduces the input.
*/

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A file that has been downloaded into a user's working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
}

impl StagedFile {
    pub fn new<P: AsRef<Path>>(path: P, size: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            size,
        }
    }
}

/// An ordered batch of files destined for a single archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileGroup {
    pub files: Vec<StagedFile>,
    pub total_size: u64,
}

impl FileGroup {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    fn push(&mut self, file: StagedFile) {
        self.total_size = self.total_size.saturating_add(file.size);
        self.files.push(file);
    }
}

/// Split `files` into groups of at most `max_size` bytes and `max_count` files.
///
/// A group is closed when the next file would push it over `max_size`, or
/// when it already holds `max_count` files. A single file larger than
/// `max_size` still gets a group of its own. An empty input yields no groups.
pub fn group_files(files: &[StagedFile], max_size: u64, max_count: usize) -> Vec<FileGroup> {
    let mut groups = Vec::new();
    let mut current = FileGroup::default();

    for file in files {
        let over_size = current.total_size.saturating_add(file.size) > max_size;
        let full = current.len() >= max_count;

        if !current.is_empty() && (over_size || full) {
            groups.push(std::mem::take(&mut current));
        }
        current.push(file.clone());
    }

    if !current.is_empty() {
        groups.push(current);
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn staged(sizes: &[u64]) -> Vec<StagedFile> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| StagedFile::new(format!("/work/1/file{i}.bin"), *size))
            .collect()
    }

    fn sizes_of(groups: &[FileGroup]) -> Vec<Vec<u64>> {
        groups
            .iter()
            .map(|g| g.files.iter().map(|f| f.size).collect())
            .collect()
    }

    #[test]
    fn test_empty_input_yields_no_groups() {
        assert!(group_files(&[], 100, 10).is_empty());
    }

    #[test]
    fn test_single_group_when_under_limits() {
        let groups = group_files(&staged(&[10, 20, 30]), 100, 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].total_size, 60);
    }

    #[test]
    fn test_size_limit_closes_group() {
        let groups = group_files(&staged(&[40, 40, 40, 10]), 100, 10);
        assert_eq!(sizes_of(&groups), vec![vec![40, 40], vec![40, 10]]);
    }

    #[test]
    fn test_exact_size_fits() {
        let groups = group_files(&staged(&[50, 50, 1]), 100, 10);
        assert_eq!(sizes_of(&groups), vec![vec![50, 50], vec![1]]);
    }

    #[test]
    fn test_count_limit_closes_group() {
        let groups = group_files(&staged(&[1, 1, 1, 1, 1]), 100, 2);
        assert_eq!(sizes_of(&groups), vec![vec![1, 1], vec![1, 1], vec![1]]);
    }

    #[test]
    fn test_oversized_file_gets_own_group() {
        let groups = group_files(&staged(&[500, 10, 700]), 100, 10);
        assert_eq!(sizes_of(&groups), vec![vec![500], vec![10], vec![700]]);
        assert!(groups.iter().all(|g| !g.is_empty()));
    }

    #[test]
    fn test_random_inputs_respect_bounds_and_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let max_size = rng.gen_range(1..=1_000u64);
            let max_count = rng.gen_range(1..=8usize);
            let count = rng.gen_range(0..=60usize);
            let sizes: Vec<u64> = (0..count).map(|_| rng.gen_range(0..=1_500u64)).collect();
            let files = staged(&sizes);

            let groups = group_files(&files, max_size, max_count);

            for group in &groups {
                assert!(!group.is_empty());
                assert!(group.len() <= max_count);
                let sum: u64 = group.files.iter().map(|f| f.size).sum();
                assert_eq!(sum, group.total_size);
                if group.len() > 1 {
                    assert!(group.total_size <= max_size);
                } else if group.total_size > max_size {
                    assert!(group.files[0].size > max_size);
                }
            }

            let flattened: Vec<StagedFile> =
                groups.into_iter().flat_map(|g| g.files).collect();
            assert_eq!(flattened, files);
        }
    }
}
