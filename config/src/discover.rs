//! Find candidate project files in a workspace directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const PROJECT_EXTENSION: &str = "qbs";

/// Top-level `*.qbs` files in `dir`, sorted by path.
pub fn discover_projects(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut projects = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == PROJECT_EXTENSION) {
            projects.push(path);
        }
    }
    projects.sort();
    Ok(projects)
}

/// The project to open when none was chosen: the file named after the
/// directory if there is one, else the first candidate.
#[must_use]
pub fn default_project(dir: &Path, candidates: &[PathBuf]) -> Option<PathBuf> {
    let dir_name = dir.file_name()?;
    candidates
        .iter()
        .find(|p| p.file_stem() == Some(dir_name))
        .or_else(|| candidates.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_only_top_level_qbs_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.qbs"), "Project {}").unwrap();
        fs::write(dir.path().join("a.qbs"), "Project {}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.qbs"), "").unwrap();

        let found = discover_projects(dir.path()).unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("a.qbs"), dir.path().join("b.qbs")]
        );
    }

    #[test]
    fn default_prefers_directory_name() {
        let dir = Path::new("/src/myapp");
        let candidates = vec![
            PathBuf::from("/src/myapp/aaa.qbs"),
            PathBuf::from("/src/myapp/myapp.qbs"),
        ];
        assert_eq!(
            default_project(dir, &candidates),
            Some(PathBuf::from("/src/myapp/myapp.qbs"))
        );
        assert_eq!(
            default_project(dir, &candidates[..1]),
            Some(PathBuf::from("/src/myapp/aaa.qbs"))
        );
        assert_eq!(default_project(dir, &[]), None);
    }
}
