//! Error types for the Hemlock front-end
//!
//! Each pipeline stage has its own error enum so callers can propagate with
//! `?` and still report precise diagnostics at the CLI boundary.

use std::path::PathBuf;

/// A lexing or parsing failure with its source position
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        ParseError {
            message: message.into(),
            file: None,
            line,
            column,
        }
    }

    pub fn with_file(mut self, file: PathBuf) -> Self {
        self.file = Some(file);
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(path) => write!(
                f,
                "{}:{}:{}: {}",
                path.display(),
                self.line,
                self.column,
                self.message
            ),
            None => write!(f, "{}:{}: {}", self.line, self.column, self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Error while reading or writing a `.hmlc` stream
#[derive(Debug, PartialEq)]
pub enum CodecError {
    /// The first four bytes were not `HMLC`
    BadMagic([u8; 4]),
    /// The stream declares a version this reader does not speak.
    /// There is no cross-version tolerance.
    UnsupportedVersion(u16),
    /// Stream ended inside a record
    UnexpectedEof,
    /// A tag byte did not name a known statement/expression kind
    InvalidTag { what: &'static str, value: u8 },
    /// A string payload was not valid UTF-8
    InvalidUtf8,
    /// Bytes remained after the declared statement count
    TrailingBytes(usize),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::BadMagic(found) => {
                write!(f, "not a .hmlc file (magic {:02x?}, expected \"HMLC\")", found)
            }
            CodecError::UnsupportedVersion(v) => {
                write!(f, "unsupported .hmlc version {} (this runtime speaks version 1)", v)
            }
            CodecError::UnexpectedEof => write!(f, "truncated .hmlc stream"),
            CodecError::InvalidTag { what, value } => {
                write!(f, "invalid {} tag 0x{:02x}", what, value)
            }
            CodecError::InvalidUtf8 => write!(f, "string payload is not valid UTF-8"),
            CodecError::TrailingBytes(n) => {
                write!(f, "{} trailing bytes after final statement", n)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Error while resolving or compiling a module
#[derive(Debug)]
pub enum ModuleError {
    /// Import resolution produced no usable path
    Resolve(String),
    /// The module file could not be read
    Io { path: PathBuf, source: std::io::Error },
    /// The module file failed to parse
    Parse(ParseError),
    /// A module in LOADING state was re-entered by `import`
    Cycle(PathBuf),
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::Resolve(msg) => write!(f, "cannot resolve import: {}", msg),
            ModuleError::Io { path, source } => {
                write!(f, "cannot read module {}: {}", path.display(), source)
            }
            ModuleError::Parse(e) => write!(f, "module parse error: {}", e),
            ModuleError::Cycle(path) => {
                write!(f, "Cycle detected: module {} imports itself transitively", path.display())
            }
        }
    }
}

impl std::error::Error for ModuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModuleError::Io { source, .. } => Some(source),
            ModuleError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for ModuleError {
    fn from(e: ParseError) -> Self {
        ModuleError::Parse(e)
    }
}

/// Error type for C code generation.
///
/// Allows `?` propagation for both logical errors (unsupported constructs)
/// and formatting errors while writing the translation unit.
#[derive(Debug)]
pub enum CodeGenError {
    Logic(String),
    Format(std::fmt::Error),
}

impl std::fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeGenError::Logic(s) => write!(f, "{}", s),
            CodeGenError::Format(e) => write!(f, "C generation error: {}", e),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError::Logic(s)
    }
}

impl From<std::fmt::Error> for CodeGenError {
    fn from(e: std::fmt::Error) -> Self {
        CodeGenError::Format(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("unexpected token", 4, 12).with_file(PathBuf::from("m.hml"));
        assert_eq!(err.to_string(), "m.hml:4:12: unexpected token");
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::UnsupportedVersion(999);
        assert!(err.to_string().contains("999"));
        let err = CodecError::BadMagic(*b"ELF\x7f");
        assert!(err.to_string().contains("HMLC"));
    }

    #[test]
    fn test_module_cycle_display() {
        let err = ModuleError::Cycle(PathBuf::from("/tmp/a.hml"));
        assert!(err.to_string().starts_with("Cycle detected"));
    }
}
