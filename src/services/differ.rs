use crate::models::{DiffResult, LocalFileRecord};
use crate::services::remote_index::RemoteIndex;

/// Splits local files into new and changed ones; unchanged files are dropped.
///
/// A file is new when the archive has nothing at its path and updated when
/// the archive's digest differs. Digests compare case-insensitively.
pub fn diff_against_archive(
    local: &[LocalFileRecord],
    remote: &RemoteIndex,
    ignore_case: bool,
) -> DiffResult {
    let mut result = DiffResult::default();

    if remote.is_empty() {
        for record in local {
            result.total_bytes_to_upload += record.size_bytes;
            result.new_files.push(record.clone());
        }
        result.count_new = result.new_files.len();
        return result;
    }

    for record in local {
        let address = record.item_address();
        match remote.digest_for(&address, ignore_case) {
            None => {
                result.total_bytes_to_upload += record.size_bytes;
                result.new_files.push(record.clone());
            }
            Some(digest) if !digest.eq_ignore_ascii_case(&record.content_digest) => {
                tracing::debug!("Changed since last archive: {}", address);
                result.total_bytes_to_upload += record.size_bytes;
                result.updated_files.push(record.clone());
            }
            Some(_) => {}
        }
    }

    result.count_new = result.new_files.len();
    result.count_updated = result.updated_files.len();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteFileRecord;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn local(dir: &str, name: &str, digest: &str, size: u64) -> LocalFileRecord {
        LocalFileRecord {
            relative_directory: dir.to_string(),
            file_name: name.to_string(),
            size_bytes: size,
            content_digest: digest.to_string(),
            creation_timestamp: Utc::now(),
            absolute_path: PathBuf::from("/data").join(dir).join(name),
        }
    }

    fn remote(path: &str, digest: &str) -> RemoteFileRecord {
        RemoteFileRecord {
            relative_path: path.to_string(),
            content_digest: digest.to_string(),
        }
    }

    fn digest(n: u8) -> String {
        format!("{:02x}", n).repeat(20)
    }

    #[test]
    fn test_empty_remote_means_everything_is_new() {
        let files = vec![
            local("", "a.raw", &digest(1), 10),
            local("QC", "b.png", &digest(2), 32),
            local("QC", "c.xml", &digest(3), 8),
        ];
        let result = diff_against_archive(&files, &RemoteIndex::empty(), false);

        assert_eq!(result.count_new, 3);
        assert_eq!(result.count_updated, 0);
        assert_eq!(result.total_bytes_to_upload, 50);
        assert_eq!(result.new_files, files);
    }

    #[test]
    fn test_all_matching_means_nothing_to_upload() {
        let files = vec![
            local("", "a.raw", &digest(1), 10),
            local("QC", "b.png", &digest(2), 32),
        ];
        let index = RemoteIndex::from_records(vec![
            remote("a.raw", &digest(1)),
            remote("QC/b.png", &digest(2).to_uppercase()),
        ]);
        let result = diff_against_archive(&files, &index, false);

        assert!(result.is_empty());
        assert_eq!(result.total_bytes_to_upload, 0);
    }

    #[test]
    fn test_new_updated_and_unchanged() {
        let files = vec![
            local("", "same.raw", &digest(1), 10),
            local("", "changed.raw", &digest(2), 20),
            local("QC", "added.png", &digest(3), 30),
        ];
        let index = RemoteIndex::from_records(vec![
            remote("same.raw", &digest(1)),
            remote("changed.raw", &digest(9)),
            remote("old_only.txt", &digest(4)),
        ]);
        let result = diff_against_archive(&files, &index, false);

        assert_eq!(result.count_new, 1);
        assert_eq!(result.new_files[0].item_address(), "QC/added.png");
        assert_eq!(result.count_updated, 1);
        assert_eq!(result.updated_files[0].file_name, "changed.raw");
        assert_eq!(result.total_bytes_to_upload, 50);
    }

    #[test]
    fn test_case_insensitive_paths() {
        let files = vec![local("QC", "TIC.png", &digest(1), 5)];
        let index = RemoteIndex::from_records(vec![remote("qc/tic.png", &digest(1))]);

        assert_eq!(diff_against_archive(&files, &index, false).count_new, 1);
        assert!(diff_against_archive(&files, &index, true).is_empty());
    }

    /// new and updated never overlap and together are exactly the files
    /// whose digest is missing from or different in the archive
    #[test]
    fn test_partition_property() {
        for seed in 0u8..16 {
            let files: Vec<_> = (0u8..12)
                .map(|i| local("d", &format!("f{}", i), &digest(i ^ seed), u64::from(i)))
                .collect();
            let index = RemoteIndex::from_records(
                (0u8..12)
                    .filter(|i| (i + seed) % 3 != 0)
                    .map(|i| remote(&format!("d/f{}", i), &digest(i))),
            );
            let result = diff_against_archive(&files, &index, false);

            let new: HashSet<_> = result.new_files.iter().map(|f| f.item_address()).collect();
            let updated: HashSet<_> =
                result.updated_files.iter().map(|f| f.item_address()).collect();
            assert!(new.is_disjoint(&updated));

            let expected: HashSet<_> = files
                .iter()
                .filter(|f| {
                    index.digest_for(&f.item_address(), false) != Some(f.content_digest.as_str())
                })
                .map(|f| f.item_address())
                .collect();
            let union: HashSet<_> = new.union(&updated).cloned().collect();
            assert_eq!(union, expected);
        }
    }
}
