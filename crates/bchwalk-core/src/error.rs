/// Typed failure domains for the reader
use std::io;

/// Errors surfaced while opening an image and parsing its superblock.
#[derive(Debug)]
pub enum OpenError {
    /// The underlying image read failed.
    Io(io::Error),
    /// The superblock magic does not match the bcachefs magic.
    InvalidMagic,
    /// The superblock's declared size extends past the end of the image.
    ShortSuperblock,
    /// No `clean` superblock field: the image was not cleanly unmounted.
    NoCleanField,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::Io(e) => write!(f, "IO error: {}", e),
            OpenError::InvalidMagic => write!(f, "superblock magic mismatch"),
            OpenError::ShortSuperblock => {
                write!(f, "superblock size exceeds the image")
            }
            OpenError::NoCleanField => {
                write!(f, "no clean superblock field (image not cleanly unmounted)")
            }
        }
    }
}

impl std::error::Error for OpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OpenError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OpenError {
    fn from(error: io::Error) -> Self {
        OpenError::Io(error)
    }
}

/// Errors from requesting a per-btree iterator.
#[derive(Debug)]
pub enum LookupError {
    /// The clean snapshot records no root for the requested btree.
    UnknownBtree,
    /// Loading the root node failed.
    Iter(IterError),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::UnknownBtree => write!(f, "no root recorded for btree"),
            LookupError::Iter(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LookupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LookupError::Iter(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IterError> for LookupError {
    fn from(error: IterError) -> Self {
        LookupError::Iter(error)
    }
}

/// Errors observed while iterating a btree.
#[derive(Debug)]
pub enum IterError {
    /// A btree node read came back short or out of bounds.
    NodeReadFailed(io::Error),
    /// A packed bkey uses a non-zero field offset or an unknown format.
    UnsupportedBkeyFormat,
    /// A packed field width outside {0, 8, 16, 32, 64} bits.
    UnsupportedBkeyWidth(u8),
}

impl std::fmt::Display for IterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterError::NodeReadFailed(e) => write!(f, "btree node read failed: {}", e),
            IterError::UnsupportedBkeyFormat => write!(f, "unsupported packed bkey format"),
            IterError::UnsupportedBkeyWidth(bits) => {
                write!(f, "unsupported packed bkey field width: {} bits", bits)
            }
        }
    }
}

impl std::error::Error for IterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IterError::NodeReadFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for IterError {
    fn from(error: io::Error) -> Self {
        IterError::NodeReadFailed(error)
    }
}

/// Errors from projecting a typed value out of a returned key.
#[derive(Debug)]
pub enum ProjectionError {
    /// The key does not carry a directory entry.
    NotDirent,
    /// The key carries neither an extent nor inline data.
    NotExtent,
    /// The key itself could not be unpacked.
    Key(IterError),
}

impl std::fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectionError::NotDirent => write!(f, "key is not a dirent"),
            ProjectionError::NotExtent => write!(f, "key is not an extent"),
            ProjectionError::Key(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProjectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProjectionError::Key(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IterError> for ProjectionError {
    fn from(error: IterError) -> Self {
        ProjectionError::Key(error)
    }
}
