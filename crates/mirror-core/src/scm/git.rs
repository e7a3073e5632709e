//! Git-backed implementation of [`Repo`], shelling out to the `git`
//! command-line tool.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

use crate::exec::{self, REMOTE_TIMEOUT};
use crate::scm::{CommitDetails, Note, Repo, Revision};

/// Remote used for pulling and pushing annotation updates.
const ORIGIN: &str = "origin";

/// Glob covering every notes ref this system reads or writes.
const NOTES_REF_GLOB: &str = "refs/notes/devtools/*";

/// Where pushed-over remote notes land locally before merging.
const REMOTE_NOTES_PREFIX: &str = "refs/notes/origin/devtools";

#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn git_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root).args(args);
        cmd
    }

    fn run_git(&self, args: &[&str]) -> Result<String> {
        let out = exec::run_checked(self.git_command(args), None, None)
            .with_context(|| format!("git command failed: {args:?}"))?;
        Ok(out.trim_end_matches('\n').to_string())
    }

    fn run_git_with_timeout(&self, args: &[&str]) -> Result<String> {
        let out = exec::run_checked(self.git_command(args), None, Some(REMOTE_TIMEOUT))
            .with_context(|| format!("git command failed: {args:?}"))?;
        Ok(out.trim_end_matches('\n').to_string())
    }

    fn run_git_as_user(&self, author: &str, args: &[&str]) -> Result<String> {
        let mut cmd = self.git_command(args);
        cmd.env("GIT_AUTHOR_NAME", author)
            .env("GIT_AUTHOR_EMAIL", author)
            .env("GIT_COMMITTER_NAME", author)
            .env("GIT_COMMITTER_EMAIL", author);
        let out = exec::run_checked(cmd, None, None)
            .with_context(|| format!("git command failed as {author}: {args:?}"))?;
        Ok(out.trim_end_matches('\n').to_string())
    }

    fn show_format(&self, revision: &Revision, format: &str) -> Result<String> {
        self.run_git(&[
            "show",
            "-s",
            revision.as_str(),
            &format!("--format=tformat:{format}"),
        ])
    }
}

/// Whether the given path is inside a git repository.
#[must_use]
pub fn is_git_repo(path: &Path) -> bool {
    let mut cmd = Command::new("git");
    cmd.current_dir(path).arg("rev-parse");
    exec::run(cmd, None, None)
        .map(|output| output.status.success())
        .unwrap_or(false)
}

impl Repo for GitRepo {
    fn path(&self) -> &Path {
        &self.root
    }

    fn state_fingerprint(&self) -> String {
        // An error here simply means the repo has no refs yet; the
        // fingerprint of an empty repo is the hash of the empty string.
        let refs = self.run_git(&["show-ref"]).unwrap_or_default();
        hex::encode(Sha1::digest(refs.as_bytes()))
    }

    fn notes(&self, notes_ref: &str, revision: &Revision) -> Vec<Note> {
        // Failure is expected when the revision carries no annotations.
        let Ok(raw) = self.run_git(&["notes", "--ref", notes_ref, "show", revision.as_str()])
        else {
            return Vec::new();
        };
        raw.lines().map(Note::from).collect()
    }

    fn append_note(
        &self,
        notes_ref: &str,
        revision: &Revision,
        note: &Note,
        author: &str,
    ) -> Result<()> {
        self.run_git_as_user(
            author,
            &[
                "notes",
                "--ref",
                notes_ref,
                "append",
                "-m",
                &note.as_text(),
                revision.as_str(),
            ],
        )?;
        Ok(())
    }

    fn list_annotated_revisions(&self, notes_ref: &str) -> Vec<Revision> {
        let Ok(listing) = self.run_git(&["notes", "--ref", notes_ref, "list"]) else {
            return Vec::new();
        };
        let mut revisions = Vec::new();
        for line in listing.lines() {
            let Some((_, annotated)) = line.split_once(' ') else {
                continue;
            };
            // Notes can point at objects we have not fetched yet, or at
            // non-commit objects; both are skipped.
            if let Ok(obj_type) = self.run_git(&["cat-file", "-t", annotated]) {
                if obj_type == "commit" {
                    revisions.push(Revision::new(annotated));
                }
            }
        }
        revisions
    }

    fn merge_base(&self, from: &Revision, to: &Revision) -> Result<Revision> {
        let base = self.run_git(&["merge-base", from.as_str(), to.as_str()])?;
        Ok(Revision::new(base))
    }

    fn raw_diff(&self, from: &Revision, to: &Revision) -> Result<String> {
        // The review service cannot show surrounding context unless the
        // raw diff contains the entire file, hence the huge -U value.
        self.run_git(&[
            "diff",
            "-M",
            "--no-ext-diff",
            "--no-textconv",
            "--src-prefix=a/",
            "--dst-prefix=b/",
            "-U32767",
            "--no-color",
            &format!("{from}..{to}"),
        ])
    }

    fn commit_details(&self, revision: &Revision) -> Result<CommitDetails> {
        // Machine-safe fields come out as JSON in one invocation; free-text
        // fields are read separately so they cannot corrupt the JSON.
        let json =
            self.show_format(revision, "{\"commit\": \"%H\", \"tree\": \"%T\", \"time\": \"%at\"}")?;
        let mut details: CommitDetails =
            serde_json::from_str(&json).context("Unexpected git show output")?;
        details.author = self.show_format(revision, "%an")?;
        details.author_email = self.show_format(revision, "%ae")?;
        details.summary = self.show_format(revision, "%s")?;
        let parents = self.show_format(revision, "%P")?;
        details.parents = parents
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        Ok(details)
    }

    fn pull(&self) -> Result<()> {
        self.run_git_with_timeout(&["fetch", ORIGIN, "+refs/*:refs/*"])?;
        Ok(())
    }

    fn push(&self) -> Result<()> {
        // Fetch the remote's notes to a staging namespace, merge each ref
        // with cat_sort_uniq (append-only union), then push the result.
        self.run_git_with_timeout(&[
            "fetch",
            ORIGIN,
            &format!("+{NOTES_REF_GLOB}:{REMOTE_NOTES_PREFIX}/*"),
        ])?;

        let remote_notes = self.run_git_with_timeout(&["ls-remote", ORIGIN, NOTES_REF_GLOB])?;
        for line in remote_notes.lines() {
            let Some((_, notes_ref)) = line.split_once('\t') else {
                continue;
            };
            let staged = notes_ref.replacen("refs/notes/devtools", REMOTE_NOTES_PREFIX, 1);
            self.run_git(&["notes", "--ref", notes_ref, "merge", &staged, "-s", "cat_sort_uniq"])?;
        }

        self.run_git_with_timeout(&[
            "push",
            ORIGIN,
            &format!("{NOTES_REF_GLOB}:{NOTES_REF_GLOB}"),
        ])?;
        Ok(())
    }
}
