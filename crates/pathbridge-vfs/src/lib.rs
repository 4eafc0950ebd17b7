// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! FUSE filesystem for pathbridge mounts
//!
//! Serves a source directory with host paths inside eligible files
//! rewritten to their container spelling, and back again on write.

#![deny(missing_docs)]

mod error;
mod fuse;
mod mount;

pub use error::{Error, Result};
pub use fuse::{DirEntry, Filesystem, ROOT_INODE, Session, SetAttr};
pub use fuser::MountOption;
pub use mount::{MountHandle, Mounter, Unmounter, mount};
