//! Fileserver and pillar compilation for the brine master.
//!
//! The fileserver serves environment-scoped files to minions. The pillar
//! compiler turns `pillar_roots` SLS files and external providers into the
//! per-minion data tree.

use thiserror::Error;

mod ext;
mod fileserver;
mod merge;
mod pillar;

pub use ext::{build_ext_pillars, ExtPillarProvider, PerMinionProvider, YamlFileProvider};
pub use fileserver::{relative_path, FileEntry, Fileserver, FileserverBackend, RootsBackend};
pub use merge::{merge, untag};
pub use pillar::{PillarCompiler, PillarOptions, ERRORS_KEY};

#[derive(Debug, Error)]
pub enum PillarError {
    #[error("unknown fileserver backend: {0}")]
    UnknownBackend(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Provider(String),
}
