use std::io;

/// Output of an external tool did not match the expected shape.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("parse error: {message}, seen '{seen}', expected '{expected}'")]
pub struct ParseError {
    pub message: String,
    pub seen: String,
    pub expected: String,
}

impl ParseError {
    pub fn new(
        message: impl Into<String>,
        seen: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        ParseError {
            message: message.into(),
            seen: seen.into(),
            expected: expected.into(),
        }
    }
}

/// Running an external tool failed.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("failed to execute '{command}': {source}")]
    CouldNotExecute {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command '{command}' failed:\n\nstderr:\n{stderr}\n\nexit code:\n{code}")]
    Failed {
        command: String,
        stderr: String,
        code: i32,
    },

    #[error("no mockup entry for command '{key}'")]
    NoMockup { key: String },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Reading a file (possibly through the mockup) failed.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("no mockup entry for file '{path}'")]
    NoMockup { path: String },
}
