//! Repository discovery, initialization, and central access to the arbor
//! subsystems: object store, dircache location, configuration, work tree.

use std::fs;
use std::path::{Path, PathBuf};

use arbor_config::ConfigSet;
use arbor_hash::HashAlgorithm;
use arbor_odb::ObjectStore;

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("not a repository: {0}")]
    NotFound(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error(transparent)]
    Config(#[from] arbor_config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Type of repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    /// Normal repo with a working tree.
    Normal,
    /// Bare repo (no working tree).
    Bare,
}

/// The central repository struct.
pub struct Repository {
    /// Path to the repository directory (`.arbor`).
    git_dir: PathBuf,
    /// Path to the working tree (None for bare repos).
    work_tree: Option<PathBuf>,
    /// Object store.
    odb: ObjectStore,
    /// Parsed configuration.
    config: ConfigSet,
    /// Path to the dircache file.
    index_path: PathBuf,
    /// Hash algorithm.
    hash_algo: HashAlgorithm,
    kind: RepositoryKind,
}

/// Name of the repository directory inside a working tree.
pub const REPO_DIR: &str = ".arbor";

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("git_dir", &self.git_dir)
            .field("work_tree", &self.work_tree)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Initialize a new repository with a working tree at `path`.
    pub fn init(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let work_tree = path.as_ref().to_path_buf();
        let git_dir = work_tree.join(REPO_DIR);
        if git_dir.exists() {
            return Err(RepoError::AlreadyExists(git_dir));
        }

        fs::create_dir_all(git_dir.join("objects"))?;
        fs::write(
            git_dir.join("config"),
            b"[core]\n\trepositoryformatversion = 0\n\tbare = false\n",
        )?;

        Self::open(&work_tree)
    }

    /// Open an existing repository.
    ///
    /// `path` may be the working tree root or the repository directory
    /// itself (a bare repository).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let path = path.as_ref();

        let (git_dir, work_tree) = if path.join(REPO_DIR).is_dir() {
            (path.join(REPO_DIR), Some(path.to_path_buf()))
        } else if path.join("objects").is_dir() {
            (path.to_path_buf(), None)
        } else {
            return Err(RepoError::NotFound(path.to_path_buf()));
        };

        let config = ConfigSet::load(Some(&git_dir))?;

        // A bare flag in config overrides the directory-shape guess.
        let work_tree = match config.get_bool("core.bare") {
            Ok(Some(true)) => None,
            _ => work_tree,
        };
        let kind = if work_tree.is_some() {
            RepositoryKind::Normal
        } else {
            RepositoryKind::Bare
        };

        let hash_algo = match config.get_string("extensions.objectformat") {
            Ok(Some(ref name)) => HashAlgorithm::from_name(name).unwrap_or(HashAlgorithm::Sha1),
            _ => HashAlgorithm::Sha1,
        };

        let odb = ObjectStore::open_with_algo(git_dir.join("objects"), hash_algo);
        let index_path = git_dir.join("index");

        Ok(Self {
            git_dir,
            work_tree,
            odb,
            config,
            index_path,
            hash_algo,
            kind,
        })
    }

    /// Path to the repository directory.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Path to the working tree (None for bare repos).
    pub fn work_tree(&self) -> Option<&Path> {
        self.work_tree.as_deref()
    }

    /// Repository kind.
    pub fn kind(&self) -> RepositoryKind {
        self.kind
    }

    /// Is this a bare repository?
    pub fn is_bare(&self) -> bool {
        self.kind == RepositoryKind::Bare
    }

    /// Access the object store.
    pub fn odb(&self) -> &ObjectStore {
        &self.odb
    }

    /// Access the configuration.
    pub fn config(&self) -> &ConfigSet {
        &self.config
    }

    /// Access the configuration mutably.
    pub fn config_mut(&mut self) -> &mut ConfigSet {
        &mut self.config
    }

    /// Path of the dircache file.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Hash algorithm in use.
    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }
}
