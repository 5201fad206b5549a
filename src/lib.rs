//! Backs up a GitHub-hosted discussion forum: issues, comments, their
//! reactions and the repository labels, into a zip or SQLite archive.

pub mod archive;
pub mod backup;
pub mod cli;
pub mod github;
