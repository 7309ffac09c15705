//! Lantern Storage: evidence persistence for plugins.
//!
//! Plugins never see the host evidence store directly. They receive a
//! [`ScopedEvidenceStore`] bound to their own namespace, so one plugin cannot
//! read or overwrite artifacts stored by another.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryEvidenceStore`]: in-process map, used by tests and ephemeral hosts
//! - [`FsEvidenceStore`]: one directory per namespace under a configured root

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod evidence;
pub mod fs;

pub use error::{StorageError, StorageResult};
pub use evidence::{EvidenceRecord, EvidenceStore, MemoryEvidenceStore, ScopedEvidenceStore};
pub use fs::FsEvidenceStore;
