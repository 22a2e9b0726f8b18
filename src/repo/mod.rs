//! Repository acquisition and code extraction collaborators.

pub mod clone;
pub mod extract;

pub use clone::{
    CheckedOutRepo, CloneOptions, GitRepositorySource, RepositorySource, validate_repo_url,
};
pub use extract::{CodeExtractor, CodeSnapshot, FsExtractor, SourceFile};
