use crate::{errors::FileError, mockup};

/// Read a file as lines, honoring the mockup mode.
pub fn read_lines(path: &str) -> Result<Vec<String>, FileError> {
    mockup::read_file(path)
}

/// Like `read_lines` but an absent file yields no lines.
pub fn read_lines_if_exists(path: &str) -> Result<Vec<String>, FileError> {
    match mockup::read_file(path) {
        Ok(lines) => Ok(lines),
        Err(FileError::Io { ref source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(Vec::new())
        }
        Err(FileError::NoMockup { .. }) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
