//! phab-mirror - daemon that reconciles git-notes review annotations with
//! a Phabricator instance.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirror_core::phab::Phabricator;
use mirror_core::scm::git::{is_git_repo, GitRepo};
use mirror_core::scm::Repo;
use mirror_core::sync::SyncController;

#[derive(Debug, Parser)]
#[command(name = "phab-mirror", about, version)]
struct Cli {
    /// Directory under which to search for git repos.
    #[arg(long, default_value = "/var/repo")]
    search_dir: PathBuf,

    /// Seconds between subsequent syncs of a repo.
    #[arg(long, default_value_t = 30)]
    sync_period: u64,

    /// Sync the local repos (including git notes) to their remotes.
    #[arg(long)]
    sync_to_remote: bool,
}

/// Recursively find git repositories under `dir`. Once a repository is
/// found its subdirectories are not traversed further.
fn find_repos(dir: &Path, repos: &mut Vec<GitRepo>) {
    if is_git_repo(dir) {
        repos.push(GitRepo::new(dir.to_path_buf()));
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "cannot read directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            find_repos(&path, repos);
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut controller = SyncController::new(Phabricator::new(), cli.sync_to_remote);

    info!(
        search_dir = %cli.search_dir.display(),
        sync_period = cli.sync_period,
        sync_to_remote = cli.sync_to_remote,
        "starting mirror loop"
    );

    // Repos are re-discovered on every tick so that repos added after
    // startup get picked up without a restart.
    loop {
        let mut repos = Vec::new();
        find_repos(&cli.search_dir, &mut repos);
        controller.tick(repos.iter().map(|repo| repo as &dyn Repo))?;
        thread::sleep(Duration::from_secs(cli.sync_period));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_find_repos_skips_nested_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo_dir = dir.path().join("project");
        let nested = repo_dir.join("src/deep");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::create_dir_all(dir.path().join("not-a-repo")).expect("mkdir");
        let status = Command::new("git")
            .args(["init", "-q"])
            .current_dir(&repo_dir)
            .status()
            .expect("git init");
        assert!(status.success());

        let mut repos = Vec::new();
        find_repos(dir.path(), &mut repos);

        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].path(), repo_dir.as_path());
    }

    #[test]
    fn test_find_repos_in_missing_directory() {
        let mut repos = Vec::new();
        find_repos(Path::new("/definitely/not/a/real/dir"), &mut repos);
        assert!(repos.is_empty());
    }
}
