#[derive(Debug)]
pub enum DedupError {
    CreateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Open {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Append {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    InvalidKey(String),
}

impl std::fmt::Display for DedupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDir { path, source } => {
                write!(f, "failed to create dedup dir '{}': {source}", path.display())
            }
            Self::Open { path, source } => {
                write!(f, "failed to open dedup file '{}': {source}", path.display())
            }
            Self::Read { path, source } => {
                write!(f, "failed to read dedup file '{}': {source}", path.display())
            }
            Self::Append { path, source } => {
                write!(f, "failed to append to dedup file '{}': {source}", path.display())
            }
            Self::InvalidKey(key) => write!(f, "dedup key contains a line break: {key:?}"),
        }
    }
}

impl std::error::Error for DedupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDir { source, .. }
            | Self::Open { source, .. }
            | Self::Read { source, .. }
            | Self::Append { source, .. } => Some(source),
            Self::InvalidKey(_) => None,
        }
    }
}
