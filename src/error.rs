// Copyright (c) 2019 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures while turning image layers into Lambda archives.
#[derive(Debug, Error)]
pub enum RepackError {
    /// The stream does not start with a readable tar header.
    #[error("opening layer tar: {0}")]
    Decode(String),

    /// The stream is not gzip, so no tar decode was attempted on it.
    #[error("could not create gzip reader for layer: {0}")]
    GzipReader(String),

    /// Neither the plain nor the gzip attempt could decode the layer.
    #[error("could not read layer with tar nor tar.gz: {gzip}, {tar}")]
    UnreadableLayer {
        gzip: Box<RepackError>,
        tar: Box<RepackError>,
    },

    #[error("opening image layer {digest}: {source}")]
    OpenLayer {
        digest: String,
        #[source]
        source: io::Error,
    },

    #[error("repacking image layer {digest}: {source}")]
    Layer {
        digest: String,
        #[source]
        source: Box<RepackError>,
    },

    /// The tar header decoded but the archive broke afterwards.
    #[error("reading layer tar: {0}")]
    Stream(#[source] io::Error),

    #[error("walking {path} in layer tar: {source}")]
    Entry {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path}: unsupported entry type flag: {flag}")]
    UnsupportedEntryType { path: String, flag: char },

    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writing zip {}: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("{cause} (close error: {close})")]
    CloseAfterFailure {
        cause: Box<RepackError>,
        close: Box<RepackError>,
    },
}

impl RepackError {
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        RepackError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn zip(path: &Path, source: zip::result::ZipError) -> Self {
        RepackError::Zip {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Attaches the result of closing resources to an error that already
    /// happened.
    pub fn and_close(self, closed: Result<()>) -> RepackError {
        match closed {
            Ok(()) => self,
            Err(close) => RepackError::CloseAfterFailure {
                cause: Box::new(self),
                close: Box::new(close),
            },
        }
    }

    /// Merges the outcome of an operation with the outcome of closing the
    /// resources it used. Neither failure is dropped.
    pub fn merge_close<T>(outcome: Result<T>, closed: Result<()>) -> Result<T> {
        match outcome {
            Ok(value) => closed.map(|()| value),
            Err(cause) => Err(cause.and_close(closed)),
        }
    }
}

pub type Result<T> = std::result::Result<T, RepackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_layer_names_both_failures() {
        let err = RepackError::UnreadableLayer {
            gzip: Box::new(RepackError::GzipReader("invalid gzip header".into())),
            tar: Box::new(RepackError::Decode("unexpected EOF".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("gzip reader"));
        assert!(msg.contains("unexpected EOF"));
    }

    #[test]
    fn test_merge_close_keeps_both_errors() {
        let cause = RepackError::Decode("bad header".into());
        let close = RepackError::io(
            "closing",
            Path::new("/tmp/layer-1.zip"),
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        let merged = RepackError::merge_close::<()>(Err(cause), Err(close)).unwrap_err();
        let msg = merged.to_string();
        assert!(msg.contains("bad header"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_merge_close_surfaces_close_error_after_success() {
        let close = RepackError::io(
            "closing",
            Path::new("/tmp/function.zip"),
            io::Error::new(io::ErrorKind::Other, "flush failed"),
        );
        let merged = RepackError::merge_close(Ok(3), Err(close));
        assert!(merged.unwrap_err().to_string().contains("flush failed"));
        assert_eq!(RepackError::merge_close(Ok(3), Ok(())).unwrap(), 3);
    }
}
