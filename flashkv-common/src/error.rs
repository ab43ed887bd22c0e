// Copyright 2026 flashkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// All kinds of [`Error`] raised by flashkv.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid configuration, detected when the cache is built or reconfigured.
    Config,
    /// The slab cannot reclaim enough pages for the request.
    NoSpace,
    /// A key or an object exceeds the configured maximum size.
    TooLarge,
    /// A request reached the `Bad` coherency state.
    Protocol,
    /// An internal consistency audit failed.
    Corrupted,
    /// The entry handle refers to an entry that no longer exists.
    Stale,
    /// The request is not valid for the given arguments.
    Invalid,
    /// Error raised by the backing store.
    External,
    /// The component has been closed.
    Closed,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::Config => "Config error",
            ErrorKind::NoSpace => "No space",
            ErrorKind::TooLarge => "Too large",
            ErrorKind::Protocol => "Protocol violation",
            ErrorKind::Corrupted => "Corrupted",
            ErrorKind::Stale => "Stale entry",
            ErrorKind::Invalid => "Invalid request",
            ErrorKind::External => "External error",
            ErrorKind::Closed => "Closed",
        }
    }
}

/// Error is the error struct returned by all flashkv functions.
///
/// `Display` prints the error in a single line:
///
/// ```shell
/// No space, context: { slab: 0, required: 12 } => not enough pages left
/// ```
///
/// `Debug` prints the kind, message, context, source and the backtrace (if captured) in multiple lines.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {}: {}", k, v)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{}: {}", k, v)?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    ///
    /// ```rust
    /// # use flashkv_common::error::{Error, ErrorKind};
    /// let io_error = std::io::Error::other("flash device unavailable");
    /// Error::new(ErrorKind::External, "write back failed").with_source(io_error);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Result type for flashkv.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating a [`ErrorKind::NoSpace`] error with context.
    pub fn no_space(slab: usize, pages: usize, required: usize) -> Self {
        Error::new(ErrorKind::NoSpace, "not enough pages left")
            .with_context("slab", slab)
            .with_context("pages", pages)
            .with_context("required", required)
    }

    /// Helper for creating a [`ErrorKind::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Config, message)
    }

    /// Helper for creating a [`ErrorKind::External`] error wrapping a backing store failure.
    pub fn external(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::External, "backing store error").with_source(source)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::external(e)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Error>();
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct FlashError(String);

    impl std::fmt::Display for FlashError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FlashError: {}", self.0)
        }
    }

    impl std::error::Error for FlashError {}

    #[test]
    fn test_error_display() {
        let err = Error::no_space(3, 16, 20);
        assert_eq!(
            "No space, context: { slab: 3, pages: 16, required: 20 } => not enough pages left",
            err.to_string()
        );
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_error_source() {
        let inner = FlashError("device gone".to_string());
        let err = Error::external(inner.clone()).with_context("cguid", 7);

        assert_eq!(err.downcast_ref::<FlashError>(), Some(&inner));
        assert_eq!(
            "External error, context: { cguid: 7 } => backing store error, source: FlashError: device gone",
            err.to_string()
        );
    }

    #[test]
    fn test_error_debug_format() {
        let e = Error::new(ErrorKind::Protocol, "bad state reached")
            .with_context("request", "RemoteUpdate")
            .with_context("state", "Modified");
        let debug = format!("{e:?}");
        assert!(debug.starts_with("Protocol violation => bad state reached"));
        assert!(debug.contains("request: RemoteUpdate"));
    }
}
