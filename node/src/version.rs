pub use arbor_types::ARBOR_VERSION;

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}

pub fn version_line() -> String {
    format!("arbor-node {} (commit {})", ARBOR_VERSION, git_commit_hash())
}
