use crate::core::models::ErrorPosition;
use thiserror::Error;

/// Advisory code logged by the queue watchdog; never a hard error.
pub const CODE_TOO_SLOW: u32 = 20005;

#[derive(Error, Debug)]
pub enum TsbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TS2307 at the import site.
    #[error("Cannot find module '{mpath}'")]
    ModuleNotFound {
        mpath: String,
        importer: String,
        pos: Option<ErrorPosition>,
    },

    /// 20001: syntax the bundler refuses to rewrite.
    #[error("{message}")]
    Unsupported {
        message: String,
        importer: String,
        pos: Option<ErrorPosition>,
    },

    /// 20002: diagnostic forwarded from the compiler.
    #[error("{message}")]
    JsError { message: String, importer: String },

    /// 20003: two entries claim one output path.
    #[error("Output path is already in use: {output}")]
    Duplicated { output: String },

    /// 20004: misuse of the reflection markers.
    #[error("{message}")]
    WrongUsage {
        message: String,
        importer: String,
        pos: Option<ErrorPosition>,
    },

    /// 20000: invariant violation; reported, build continues.
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    /// A previous failure already poisoned the concurrency queue.
    #[error("Queue poisoned: {0}")]
    Poisoned(String),
}

impl TsbError {
    pub fn config(message: impl Into<String>) -> Self {
        TsbError::Config(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        TsbError::Cache(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TsbError::InternalError(message.into())
    }

    /// The symbolic diagnostic code, where one exists.
    pub fn code(&self) -> Option<u32> {
        match self {
            TsbError::ModuleNotFound { .. } => Some(2307),
            TsbError::InternalError(_) => Some(20000),
            TsbError::Unsupported { .. } => Some(20001),
            TsbError::JsError { .. } => Some(20002),
            TsbError::Duplicated { .. } => Some(20003),
            TsbError::WrongUsage { .. } => Some(20004),
            _ => None,
        }
    }

    fn site(&self) -> (Option<&str>, Option<&ErrorPosition>) {
        match self {
            TsbError::ModuleNotFound { importer, pos, .. }
            | TsbError::Unsupported { importer, pos, .. }
            | TsbError::WrongUsage { importer, pos, .. } => (Some(importer), pos.as_ref()),
            TsbError::JsError { importer, .. } => (Some(importer), None),
            _ => (None, None),
        }
    }

    /// `path(line,col): error TS2307: message`, followed by the offending
    /// line and a caret run when the position is known.
    pub fn report(&self) -> String {
        let (importer, pos) = self.site();
        let mut out = String::new();
        if let Some(importer) = importer {
            out.push_str(importer);
            if let Some(pos) = pos {
                out.push_str(&format!("({},{})", pos.line, pos.column));
            }
            out.push_str(": ");
        }
        match self.code() {
            Some(code) => out.push_str(&format!("error TS{}: {}", code, self)),
            None => out.push_str(&format!("error: {}", self)),
        }
        if let Some(pos) = pos {
            out.push('\n');
            out.push_str(&pos.line_text);
            out.push('\n');
            out.push_str(&" ".repeat(pos.column.saturating_sub(1) as usize));
            out.push_str(&"^".repeat((pos.width.max(1)) as usize));
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, TsbError>;
