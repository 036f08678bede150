mod overlay;
mod probe;

pub use overlay::{apply, detach};
pub use probe::{needs_userxattr, supports_dtype, supports_index};

use std::path::PathBuf;
use thiserror::Error;

/// A single page is all the kernel accepts for mount data; overlay option
/// strings at or beyond this length are rejected by `mount(2)`.
pub const OPTIONS_PAGE_SIZE: usize = 4096;

/// A snapshot mount as composed by the snapshotter: `overlay` with a
/// lowerdir/upperdir/workdir option list, or `bind` exposing a single
/// layer directory.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn new(mount_type: &str, source: &str, options: Vec<String>) -> Self {
        Self {
            mount_type: mount_type.to_string(),
            source: source.to_string(),
            options,
        }
    }

    /// The comma-joined option string handed to the kernel.
    pub fn data(&self) -> String {
        self.options.join(",")
    }

    /// How many layers the `lowerdir=` option stacks; zero for bind mounts.
    pub fn lower_layers(&self) -> usize {
        self.options
            .iter()
            .find_map(|o| o.strip_prefix("lowerdir="))
            .map(|dirs| dirs.split(':').count())
            .unwrap_or(0)
    }
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("unsupported snapshot mount type: {0}")]
    UnsupportedType(String),

    #[error("kernel rejected overlay mount at {target:?} ({errno}); option string was {bytes} bytes")]
    OverlayRejected {
        target: PathBuf,
        bytes: usize,
        errno: nix::errno::Errno,
    },

    #[error("failed to bind layer {src:?} at {target:?}: {errno}")]
    BindFailed {
        src: PathBuf,
        target: PathBuf,
        errno: nix::errno::Errno,
    },

    #[error("failed to remount {target:?} read-only: {errno}")]
    RemountReadOnly {
        target: PathBuf,
        errno: nix::errno::Errno,
    },

    #[error("failed to detach snapshot mount at {target:?}: {errno}")]
    Detach {
        target: PathBuf,
        errno: nix::errno::Errno,
    },

    #[error("probing kernel capabilities failed: {0}")]
    Probe(#[from] nix::errno::Errno),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
