//! Local Git repository operations via `git2`.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use git2::{
    build::CheckoutBuilder, Cred, CredentialType, ErrorCode, FetchOptions, Oid, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

/// Credentials from the ssh agent, or git's defaults for other transports.
/// Gives up after the first rejected attempt instead of letting libgit2 loop.
fn remote_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |_url, username, allowed| {
        attempts += 1;
        if attempts > 1 {
            return Err(git2::Error::from_str("git authentication failed"));
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username.unwrap_or("git"))
        } else {
            Cred::default()
        }
    });
    callbacks
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Clone `url` into `path` under the remote name `remote_name`.
    ///
    /// Done as init + fetch so that empty remotes, and remotes whose HEAD
    /// names a branch that does not exist, clone cleanly.
    #[instrument(fields(path = %path.display()))]
    pub fn clone_repo(url: &str, path: &Path, remote_name: &str) -> Result<Self, GitError> {
        info!("cloning git repository");
        let client = Self::init(path)?;
        client.ensure_remote(remote_name, url)?;
        client.fetch(remote_name)?;
        info!("clone completed");
        Ok(client)
    }

    /// Create a fresh repository with no remote.
    #[instrument(fields(path = %path.display()))]
    pub fn init(path: &Path) -> Result<Self, GitError> {
        info!("initialising local git repository");
        let repo = Repository::init(path)?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Open the working copy at `path`, cloning `url` or initialising an
    /// empty repository if there is none yet.
    pub fn open_or_create(
        path: &Path,
        url: Option<&str>,
        remote_name: &str,
    ) -> Result<Self, GitError> {
        if path.join(".git").exists() {
            return Self::new(path);
        }
        std::fs::create_dir_all(path)?;
        match url {
            Some(url) => Self::clone_repo(url, path, remote_name),
            None => Self::init(path),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Point remote `name` at `url`, creating it if needed.
    pub fn ensure_remote(&self, name: &str, url: &str) -> Result<(), GitError> {
        match self.repo.find_remote(name) {
            Ok(remote) if remote.url() == Some(url) => Ok(()),
            Ok(_) => {
                info!(remote = name, url, "updating remote url");
                self.repo.remote_set_url(name, url)?;
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                info!(remote = name, url, "adding remote");
                self.repo.remote(name, url)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch from a named remote.
    #[instrument(skip(self))]
    pub fn fetch(&self, remote_name: &str) -> Result<(), GitError> {
        info!(remote = remote_name, "fetching");
        let mut remote = self.repo.find_remote(remote_name)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks());
        remote.fetch(&[] as &[&str], Some(&mut fetch_opts), None)?;
        debug!("fetch completed");
        Ok(())
    }

    /// Hard-reset `branch` to the fetched remote branch and check it out.
    ///
    /// When the remote has no such branch yet, HEAD is pointed at the
    /// (possibly unborn) local branch and nothing is reset. Returns the
    /// remote commit the branch now sits on.
    #[instrument(skip(self))]
    pub fn reset_to_remote(&self, remote_name: &str, branch: &str) -> Result<Option<Oid>, GitError> {
        let local_ref = format!("refs/heads/{}", branch);
        let remote_ref = format!("refs/remotes/{}/{}", remote_name, branch);

        let remote_commit = match self.repo.find_reference(&remote_ref) {
            Ok(reference) => reference.peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(remote_ref, "remote branch does not exist yet");
                self.repo.set_head(&local_ref)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.repo
            .reference(&local_ref, remote_commit.id(), true, "histsync: reset to remote")?;
        self.repo.set_head(&local_ref)?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))?;
        debug!(sha = %remote_commit.id(), "reset to remote");
        Ok(Some(remote_commit.id()))
    }

    /// Stage `rel_path` and commit it on HEAD.
    ///
    /// Returns `None` without committing when the tree is unchanged.
    #[instrument(skip(self, message))]
    pub fn commit_file(
        &self,
        rel_path: &Path,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Option<Oid>, GitError> {
        let mut index = self.repo.index()?;
        index.add_path(rel_path)?;
        index.write()?;
        let tree_oid = index.write_tree()?;

        let parent_commit = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = &parent_commit {
            if parent.tree_id() == tree_oid {
                debug!("tree unchanged, nothing to commit");
                return Ok(None);
            }
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let signature = Signature::now(author_name, author_email)?;
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(Some(oid))
    }

    /// Push a local branch to a remote.
    ///
    /// A non-fast-forward or a ref update refused by the server is reported
    /// as [`GitError::PushRejected`].
    #[instrument(skip(self))]
    pub fn push(&self, remote_name: &str, branch: &str) -> Result<(), GitError> {
        info!(remote = remote_name, branch, "pushing");
        let mut remote = self.repo.find_remote(remote_name)?;

        let rejection = RefCell::new(None::<String>);
        let mut callbacks = remote_callbacks();
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                *rejection.borrow_mut() = Some(msg.to_string());
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{}:refs/heads/{}", branch, branch);
        if let Err(e) = remote.push(&[&refspec], Some(&mut push_opts)) {
            if e.code() == ErrorCode::NotFastForward {
                warn!(error = %e, "push rejected");
                return Err(GitError::PushRejected {
                    branch: branch.to_string(),
                    detail: e.message().to_string(),
                });
            }
            return Err(e.into());
        }

        if let Some(detail) = rejection.borrow_mut().take() {
            return Err(GitError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    /// Return the SHA of HEAD, or `None` on an unborn branch.
    pub fn head_sha(&self) -> Result<Option<String>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id().to_string())),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
