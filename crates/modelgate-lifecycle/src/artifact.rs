// GGUF artifact resolution
//
// A configured local_path may point at a single file, the first part of a
// multi-part set, or a directory to scan. The resolved path is the one the
// engine loads; for multi-part sets that is always the -00001- file and the
// whole set must be present on disk.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use modelgate_core::LifecycleError;
use regex::Regex;

/// `<base>-00001-of-00003.gguf` style part name
fn multipart_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(.+)-(\d{5})-of-(\d{5})\.gguf$").unwrap())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArtifact {
    /// Path relative to the models directory, as mounted in the container
    pub relative_path: String,
    /// Absolute path on the gateway's mount, for size/metadata reads
    pub host_path: PathBuf,
}

/// Resolve `local_path` (relative to `models_dir`) to the GGUF file the
/// engine should load.
pub fn resolve_gguf_artifact(
    models_dir: &Path,
    local_path: &str,
) -> Result<ResolvedArtifact, LifecycleError> {
    let host_path = models_dir.join(local_path);

    if local_path.to_lowercase().ends_with(".gguf") {
        if !host_path.is_file() {
            return Err(LifecycleError::InvalidArtifact(format!(
                "GGUF file not found: {local_path}"
            )));
        }
        // Prefer the first part of a multi-part set living alongside the
        // selected file; the engine auto-loads the remainder.
        let parent = host_path.parent().unwrap_or(models_dir);
        if let Some(first_part) = find_first_part(parent)? {
            let resolved = parent.join(&first_part);
            verify_all_parts(parent, &first_part)?;
            return Ok(ResolvedArtifact {
                relative_path: relative_to(models_dir, &resolved),
                host_path: resolved,
            });
        }
        if let Some(name) = host_path.file_name().and_then(|n| n.to_str()) {
            if multipart_re().is_match(name) {
                verify_all_parts(parent, name)?;
            }
        }
        return Ok(ResolvedArtifact {
            relative_path: local_path.to_string(),
            host_path,
        });
    }

    if host_path.is_dir() {
        let mut gguf_files: Vec<String> = std::fs::read_dir(&host_path)
            .map_err(|e| {
                LifecycleError::InvalidArtifact(format!("cannot read directory {local_path}: {e}"))
            })?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.to_lowercase().ends_with(".gguf"))
            .collect();
        gguf_files.sort();

        let chosen = match gguf_files.len() {
            0 => {
                return Err(LifecycleError::InvalidArtifact(format!(
                    "no GGUF files found in directory: {local_path}"
                )))
            }
            1 => gguf_files.remove(0),
            n => {
                tracing::warn!(
                    directory = %local_path,
                    count = n,
                    chosen = %gguf_files[0],
                    "multiple GGUF files found, using the first"
                );
                gguf_files.remove(0)
            }
        };

        if multipart_re().is_match(&chosen) {
            verify_all_parts(&host_path, &chosen)?;
        }
        let resolved = host_path.join(&chosen);
        return Ok(ResolvedArtifact {
            relative_path: relative_to(models_dir, &resolved),
            host_path: resolved,
        });
    }

    Err(LifecycleError::InvalidArtifact(format!(
        "invalid local_path: {local_path} - must be a .gguf file or a directory containing GGUF files"
    )))
}

/// First `-00001-of-NNNNN` file in a directory, if any (sorted for stability)
fn find_first_part(dir: &Path) -> Result<Option<String>, LifecycleError> {
    let mut candidates: Vec<String> = std::fs::read_dir(dir)
        .map_err(|e| LifecycleError::InvalidArtifact(format!("cannot read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| {
            multipart_re()
                .captures(name)
                .map(|c| c[2].parse::<u32>() == Ok(1))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Require every part of a multi-part set to be present
fn verify_all_parts(dir: &Path, any_part: &str) -> Result<(), LifecycleError> {
    let caps = match multipart_re().captures(any_part) {
        Some(c) => c,
        None => return Ok(()),
    };
    let base = caps[1].to_string();
    let total: usize = caps[3].parse().unwrap_or(0);
    if total == 0 {
        return Err(LifecycleError::InvalidArtifact(format!(
            "malformed multi-part name: {any_part}"
        )));
    }

    let mut found = 0;
    for part in 1..=total {
        let name = format!("{base}-{part:05}-of-{total:05}.gguf");
        if dir.join(&name).is_file() {
            found += 1;
        }
    }
    if found != total {
        return Err(LifecycleError::IncompleteMultipart {
            base,
            found,
            expected: total,
        });
    }
    Ok(())
}

fn relative_to(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn single_file_resolves_as_is() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "model-q4.gguf");

        let artifact = resolve_gguf_artifact(tmp.path(), "model-q4.gguf").unwrap();
        assert_eq!(artifact.relative_path, "model-q4.gguf");
    }

    #[test]
    fn missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        let err = resolve_gguf_artifact(tmp.path(), "absent.gguf").unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidArtifact(_)));
    }

    #[test]
    fn peer_multipart_set_takes_priority_over_the_selected_file() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "m.gguf");
        touch(tmp.path(), "m-00001-of-00003.gguf");
        touch(tmp.path(), "m-00002-of-00003.gguf");
        touch(tmp.path(), "m-00003-of-00003.gguf");

        let artifact = resolve_gguf_artifact(tmp.path(), "m.gguf").unwrap();
        assert_eq!(artifact.relative_path, "m-00001-of-00003.gguf");
    }

    #[test]
    fn incomplete_multipart_fails_fast() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "m-00001-of-00003.gguf");
        touch(tmp.path(), "m-00003-of-00003.gguf");

        let err = resolve_gguf_artifact(tmp.path(), "m-00001-of-00003.gguf").unwrap_err();
        match err {
            LifecycleError::IncompleteMultipart { found, expected, .. } => {
                assert_eq!(found, 2);
                assert_eq!(expected, 3);
            }
            other => panic!("expected IncompleteMultipart, got {other:?}"),
        }
    }

    #[test]
    fn directory_with_one_gguf_resolves_it() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("llama")).unwrap();
        touch(&tmp.path().join("llama"), "weights.gguf");
        touch(&tmp.path().join("llama"), "README.md");

        let artifact = resolve_gguf_artifact(tmp.path(), "llama").unwrap();
        assert_eq!(artifact.relative_path, "llama/weights.gguf");
    }

    #[test]
    fn directory_with_many_ggufs_takes_lexicographic_first() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        touch(&tmp.path().join("d"), "b-q8.gguf");
        touch(&tmp.path().join("d"), "a-q4.gguf");

        let artifact = resolve_gguf_artifact(tmp.path(), "d").unwrap();
        assert_eq!(artifact.relative_path, "d/a-q4.gguf");
    }

    #[test]
    fn empty_directory_fails() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("empty")).unwrap();
        let err = resolve_gguf_artifact(tmp.path(), "empty").unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidArtifact(_)));
    }

    #[test]
    fn directory_multipart_set_is_validated() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("parts")).unwrap();
        touch(&tmp.path().join("parts"), "m-00001-of-00002.gguf");

        let err = resolve_gguf_artifact(tmp.path(), "parts").unwrap_err();
        assert!(matches!(err, LifecycleError::IncompleteMultipart { .. }));
    }
}
