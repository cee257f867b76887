//! Compile error types

use std::fmt;

/// Stage of compilation that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// A base template could not be parsed (template or YAML syntax)
    Syntax,
    /// The mode overlay could not be applied to the base documents
    Overlay,
    /// A slot could not be bound from the data values
    Data,
    /// The instance itself is invalid
    Validation,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Syntax => "syntax",
            Self::Overlay => "overlay",
            Self::Data => "data",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// Error raised by whichever compilation stage fails
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileError {
    /// Failing stage
    pub kind: CompileErrorKind,
    /// What went wrong
    pub message: String,
    /// Template being processed, when known
    pub template_name: Option<String>,
    /// 1-based line in the template or rendered output, when known
    pub line: Option<usize>,
    /// 1-based column, when known
    pub column: Option<usize>,
}

impl CompileError {
    /// Create an error with no source location
    pub fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            template_name: None,
            line: None,
            column: None,
        }
    }

    /// Create a validation error for bad instance input
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::Validation, message)
    }

    /// Create an overlay error
    pub fn overlay(message: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::Overlay, message)
    }

    /// Create a data binding error
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::Data, message)
    }

    /// Attach the template name
    pub fn in_template(mut self, name: impl Into<String>) -> Self {
        self.template_name = Some(name.into());
        self
    }

    /// Attach a source location
    pub fn at(mut self, line: Option<usize>, column: Option<usize>) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    /// True for input problems the caller must fix, false for template defects
    pub fn is_caller_error(&self) -> bool {
        self.kind == CompileErrorKind::Validation
    }

    /// Convert a minijinja error, resolving its byte range against `source`
    pub(crate) fn from_render(err: &minijinja::Error, template_name: &str, source: &str) -> Self {
        let kind = match err.kind() {
            minijinja::ErrorKind::SyntaxError => CompileErrorKind::Syntax,
            _ => CompileErrorKind::Data,
        };
        let message = match err.detail() {
            Some(detail) => format!("{}: {}", err.kind(), detail),
            None => err.kind().to_string(),
        };
        let column = err.range().map(|range| column_of(source, range.start));
        Self::new(kind, message)
            .in_template(err.name().unwrap_or(template_name))
            .at(err.line(), column)
    }

    /// Convert a YAML error raised while parsing rendered output
    pub(crate) fn from_yaml(err: &serde_yaml::Error, template_name: &str) -> Self {
        let location = err.location();
        Self::new(CompileErrorKind::Syntax, format!("rendered YAML is invalid: {err}"))
            .in_template(template_name)
            .at(
                location.as_ref().map(|l| l.line()),
                location.as_ref().map(|l| l.column()),
            )
    }
}

/// 1-based column of the byte offset within its line
fn column_of(source: &str, offset: usize) -> usize {
    let offset = offset.min(source.len());
    let line_start = source[..offset].rfind('\n').map_or(0, |i| i + 1);
    source[line_start..offset].chars().count() + 1
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        match (&self.template_name, self.line, self.column) {
            (Some(name), Some(line), Some(col)) => write!(f, " ({name}:{line}:{col})"),
            (Some(name), Some(line), None) => write!(f, " ({name}:{line})"),
            (Some(name), None, _) => write!(f, " ({name})"),
            _ => Ok(()),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location() {
        let err = CompileError::new(CompileErrorKind::Syntax, "unexpected end of block")
            .in_template("runner-set.yaml")
            .at(Some(12), Some(4));
        assert_eq!(
            err.to_string(),
            "syntax error: unexpected end of block (runner-set.yaml:12:4)"
        );
    }

    #[test]
    fn validation_is_caller_error() {
        assert!(CompileError::validation("name must not be empty").is_caller_error());
        assert!(!CompileError::overlay("no runner container").is_caller_error());
        assert!(!CompileError::data("undefined slot").is_caller_error());
    }

    #[test]
    fn column_counts_from_line_start() {
        let source = "a: 1\nbb: ${ x }\n";
        let offset = source.find("${").unwrap();
        assert_eq!(column_of(source, offset), 5);
        assert_eq!(column_of(source, 0), 1);
    }
}
