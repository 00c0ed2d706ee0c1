//! Git subprocess integration.
//!
//! All version-control access goes through [`gateway::GitGateway`] — a thin
//! async wrapper over the `git` binary. Nothing in this crate links libgit2;
//! worktree support, credential-prompt suppression, and error reporting all
//! behave exactly like the command-line tool because they *are* the
//! command-line tool.

pub mod gateway;

pub use gateway::{AddWorktreeOpts, GitError, GitGateway, GitWorktreeEntry};
