//! Publishes signed APT and RPM package repositories to a remote mirror.
//!
//! One APT tree serves several distribution codenames from a single shared
//! artifact pool. Each run pulls the mirror, filters the pool per codename,
//! regenerates `Packages` indices and a signed `Release` for every codename,
//! restores the pool and pushes the tree back.
//!
//! # Architecture
//!
//! ```text
//! repo-publisher (binary)
//!     │
//!     ├── config     TOML configuration and validation
//!     ├── preflight  host tool checks
//!     └── publish    run orchestration, lock, run manifest
//!             │
//!             ├── mirror    pull/push (aws s3 sync, rsync, local)
//!             ├── pool      shared artifacts, codename filter/restore
//!             ├── index     Packages / Packages.gz per architecture
//!             ├── release   Release descriptor with checksums
//!             └── signer    Release.pgp + InRelease
//!
//! rpm  createrepo + signed repomd.xml, same mirror and signer
//! ```
//!
//! External collaborators sit behind the [`mirror::Mirror`],
//! [`index::IndexTool`] and [`signer::Signer`] traits.

pub mod config;
pub mod filesystem;
pub mod index;
pub mod mirror;
pub mod pool;
pub mod preflight;
pub mod process;
pub mod publish;
pub mod release;
pub mod rpm;
pub mod signer;

pub use config::{load_config, PublishConfig};
pub use publish::{AptPublisher, PublishContext, PublishError, PublishReport, Step};
pub use rpm::RpmPublisher;
