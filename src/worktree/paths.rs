//! Worktree root resolution and path safety checks.
//!
//! Every create/remove goes through [`is_allowed`] first. The check is
//! purely lexical (component-wise on normalized absolute paths) so it also
//! covers paths that do not exist yet, and it can never be bypassed by a
//! dangling symlink trick on a path we are about to create.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where managed worktrees live relative to the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeRootMode {
    /// `<repo>/.patchwork/worktrees` — kept out of the index via the
    /// repository's own ignore rules.
    InRepo,
    /// `<repo>/../<repo-name>-worktrees` — sibling of the checkout.
    Sibling,
    /// An explicit absolute path from configuration.
    Custom,
}

impl Default for WorktreeRootMode {
    fn default() -> Self {
        WorktreeRootMode::Sibling
    }
}

/// Resolve the configured root mode to an absolute directory.
///
/// `custom_root` is only consulted for [`WorktreeRootMode::Custom`]; a
/// missing custom path falls back to the sibling layout rather than
/// guessing.
pub fn compute_root(
    mode: &WorktreeRootMode,
    custom_root: Option<&Path>,
    repo_path: &Path,
) -> PathBuf {
    let repo = normalize(repo_path);
    match mode {
        WorktreeRootMode::InRepo => repo.join(".patchwork").join("worktrees"),
        WorktreeRootMode::Custom => match custom_root {
            Some(p) => normalize(p),
            None => sibling_root(&repo),
        },
        WorktreeRootMode::Sibling => sibling_root(&repo),
    }
}

fn sibling_root(repo: &Path) -> PathBuf {
    let name = repo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    match repo.parent() {
        Some(parent) => parent.join(format!("{name}-worktrees")),
        None => repo.join(format!("{name}-worktrees")),
    }
}

/// Whether `candidate` is a safe target for create/remove operations.
///
/// Rejects the repository itself, any ancestor of it, and anything that does
/// not resolve under `root`. The root itself and every proper descendant are
/// allowed.
pub fn is_allowed(candidate: &Path, root: &Path, repo_path: &Path) -> bool {
    let candidate = normalize(candidate);
    let root = normalize(root);
    let repo = normalize(repo_path);

    if candidate == repo {
        return false;
    }
    // An ancestor of the repo (removing it would take the checkout with it).
    if repo.starts_with(&candidate) {
        return false;
    }
    candidate.starts_with(&root)
}

/// Lexically normalize a path: drop `.` components and resolve `..` against
/// the accumulated prefix. No filesystem access.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_repo_itself() {
        let repo = Path::new("/home/u/proj");
        let root = Path::new("/home/u/proj-worktrees");
        assert!(!is_allowed(repo, root, repo));
    }

    #[test]
    fn test_rejects_repo_ancestors() {
        let repo = Path::new("/home/u/proj");
        let root = Path::new("/");
        assert!(!is_allowed(Path::new("/home/u"), root, repo));
        assert!(!is_allowed(Path::new("/home"), root, repo));
        assert!(!is_allowed(Path::new("/"), root, repo));
    }

    #[test]
    fn test_rejects_outside_root() {
        let repo = Path::new("/home/u/proj");
        let root = Path::new("/home/u/proj-worktrees");
        assert!(!is_allowed(Path::new("/tmp/evil"), root, repo));
        assert!(!is_allowed(Path::new("/home/u/other"), root, repo));
    }

    #[test]
    fn test_accepts_root_and_descendants() {
        let repo = Path::new("/home/u/proj");
        let root = Path::new("/home/u/proj-worktrees");
        assert!(is_allowed(root, root, repo));
        assert!(is_allowed(&root.join("card-1"), root, repo));
        assert!(is_allowed(&root.join("a/b/c"), root, repo));
    }

    #[test]
    fn test_dotdot_cannot_escape_root() {
        let repo = Path::new("/home/u/proj");
        let root = Path::new("/home/u/proj-worktrees");
        let sneaky = root.join("../proj");
        assert!(!is_allowed(&sneaky, root, repo));
        let sneaky_out = root.join("../../etc");
        assert!(!is_allowed(&sneaky_out, root, repo));
    }

    #[test]
    fn test_compute_root_modes() {
        let repo = Path::new("/home/u/proj");
        assert_eq!(
            compute_root(&WorktreeRootMode::InRepo, None, repo),
            PathBuf::from("/home/u/proj/.patchwork/worktrees")
        );
        assert_eq!(
            compute_root(&WorktreeRootMode::Sibling, None, repo),
            PathBuf::from("/home/u/proj-worktrees")
        );
        assert_eq!(
            compute_root(
                &WorktreeRootMode::Custom,
                Some(Path::new("/var/patchwork/wt")),
                repo
            ),
            PathBuf::from("/var/patchwork/wt")
        );
        // Custom without a path falls back to sibling.
        assert_eq!(
            compute_root(&WorktreeRootMode::Custom, None, repo),
            PathBuf::from("/home/u/proj-worktrees")
        );
    }

    #[test]
    fn test_in_repo_root_is_allowed_under_itself() {
        let repo = Path::new("/home/u/proj");
        let root = compute_root(&WorktreeRootMode::InRepo, None, repo);
        // The in-repo root is under the repo but is NOT the repo or an
        // ancestor, so worktrees under it are fine.
        assert!(is_allowed(&root.join("card-9"), &root, repo));
        assert!(!is_allowed(repo, &root, repo));
    }
}
