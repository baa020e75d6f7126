use std::fs;
use std::path::{Path, PathBuf};

use coffer_id::ObjectId;
use coffer_odb::{ObjectDirectory, OdbOptions};
use coffer_refs::{RefDirectory, RefLogPolicy, RefName};
use coffer_util::Ident;
use tracing::debug;

use crate::OdbWalker;

/// Errors from opening or initializing a repository.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("{0} is not a repository (missing HEAD, objects/ or refs/)")]
    NotARepository(PathBuf),

    #[error(transparent)]
    Odb(#[from] coffer_odb::OdbError),

    #[error(transparent)]
    Refs(#[from] coffer_refs::RefError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const DEFAULT_CONFIG: &str = "[core]\n\trepositoryformatversion = 0\n\tbare = true\n";

/// A bare repository directory: the object database plus the reference
/// database, sharing one filesystem layout.
pub struct Repository {
    git_dir: PathBuf,
    odb: ObjectDirectory,
    refs: RefDirectory,
}

impl Repository {
    /// Create the standard layout at `git_dir` and open it.
    ///
    /// `HEAD` starts as a symbolic ref to an unborn `refs/heads/main`.
    /// Initializing an existing repository is a no-op open.
    pub fn init(git_dir: impl AsRef<Path>) -> Result<Self, RepoError> {
        let git_dir = git_dir.as_ref().to_path_buf();
        if is_repository(&git_dir) {
            return Self::open(git_dir);
        }

        for sub in [
            "objects/pack",
            "objects/info",
            "refs/heads",
            "refs/tags",
            "logs",
        ] {
            fs::create_dir_all(git_dir.join(sub))?;
        }
        fs::write(git_dir.join("HEAD"), "ref: refs/heads/main\n")?;
        fs::write(git_dir.join("config"), DEFAULT_CONFIG)?;
        debug!(dir = %git_dir.display(), "initialized repository");

        Self::open(git_dir)
    }

    /// Open an existing repository directory.
    pub fn open(git_dir: impl AsRef<Path>) -> Result<Self, RepoError> {
        Self::open_with(git_dir, &OdbOptions::default(), RefLogPolicy::default())
    }

    /// Open with explicit tuning from the caller's configuration layer.
    pub fn open_with(
        git_dir: impl AsRef<Path>,
        odb_options: &OdbOptions,
        policy: RefLogPolicy,
    ) -> Result<Self, RepoError> {
        let git_dir = git_dir.as_ref().to_path_buf();
        if !is_repository(&git_dir) {
            return Err(RepoError::NotARepository(git_dir));
        }
        let odb = ObjectDirectory::open_with(git_dir.join("objects"), odb_options)?;
        let refs = RefDirectory::with_policy(&git_dir, policy);
        Ok(Self {
            git_dir,
            odb,
            refs,
        })
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn odb(&self) -> &ObjectDirectory {
        &self.odb
    }

    pub fn refs(&self) -> &RefDirectory {
        &self.refs
    }

    pub fn refs_mut(&mut self) -> &mut RefDirectory {
        &mut self.refs
    }

    /// Identity used for reflog lines written through this repository.
    pub fn set_ident(&mut self, ident: Ident) {
        self.refs.set_ident(ident);
    }

    /// The walker collaborator over this repository's objects.
    pub fn walker(&self) -> OdbWalker<'_> {
        OdbWalker::new(&self.odb)
    }

    /// Resolve any ref name to the object it ultimately points at.
    pub fn resolve(&self, name: &str) -> Result<Option<ObjectId>, RepoError> {
        let name = match RefName::new(name) {
            Ok(name) => name,
            Err(_) => return Ok(None),
        };
        Ok(self.refs.resolve(&name)?)
    }

    /// The commit `HEAD` points at, if born.
    pub fn head(&self) -> Result<Option<ObjectId>, RepoError> {
        self.resolve("HEAD")
    }
}

fn is_repository(git_dir: &Path) -> bool {
    git_dir.join("HEAD").is_file()
        && git_dir.join("objects").is_dir()
        && git_dir.join("refs").is_dir()
}
