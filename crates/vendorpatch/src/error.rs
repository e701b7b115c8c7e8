use std::fmt;

/// Broad failure class. Callers branch on this to decide whether a retry,
/// a patch regeneration or a manual cleanup is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Other,
    /// Pinning fetch failed; usually transient and safe to retry.
    Sync,
    /// The patch no longer applies to the pinned upstream revision.
    PatchApply,
    /// A dual workspace from an earlier cycle is still on disk.
    WorkspaceExists,
    /// A manifest entry does not exist in the checkout.
    MissingSource,
    /// The native configure/build step failed.
    Build,
    /// The checkout is neither pristine nor fully patched.
    InconsistentCheckout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Other => "error",
            ErrorKind::Sync => "sync error",
            ErrorKind::PatchApply => "patch apply error",
            ErrorKind::WorkspaceExists => "workspace exists",
            ErrorKind::MissingSource => "missing source",
            ErrorKind::Build => "build error",
            ErrorKind::InconsistentCheckout => "inconsistent checkout",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn sync<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Sync, msg)
    }

    pub fn patch_apply<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::PatchApply, msg)
    }

    pub fn workspace_exists<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::WorkspaceExists, msg)
    }

    pub fn missing_source<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::MissingSource, msg)
    }

    pub fn build<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Build, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Re-tag a lower-level failure (typically a subprocess error) with the
    /// kind of the stage that ran it. Already-classified errors keep their kind.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        if self.kind == ErrorKind::Other {
            self.kind = kind;
        }
        self
    }

    pub fn context(self, prefix: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{prefix}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
