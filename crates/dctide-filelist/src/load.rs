//! Background loading of remote listings.
//!
//! Parsing a browsed list can mean decompressing and walking megabytes
//! of XML, so it runs on the blocking worker pool; the await point is
//! the completion callback on the caller's context.

use std::path::PathBuf;

use tracing::debug;

use crate::error::ListError;
use crate::tree::FileTree;
use crate::xml;

/// Load and parse a listing file off the async runtime.
///
/// # Errors
///
/// I/O, decompression and parse failures from the worker, or
/// [`ListError::Cancelled`] when the runtime shuts down underneath it.
pub async fn load_file(path: PathBuf) -> Result<FileTree, ListError> {
    debug!(path = %path.display(), "loading file list");
    tokio::task::spawn_blocking(move || xml::parse_file(&path))
        .await
        .map_err(|_| ListError::Cancelled)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.xml.bz2");
        let xml_text = r#"<FileListing Version="1"><File Name="a" Size="3"/></FileListing>"#;
        let tree = xml::parse_bytes(xml_text.as_bytes()).unwrap();
        xml::save_file(&tree, &path).unwrap();

        let loaded = load_file(path).await.unwrap();
        assert_eq!(loaded, tree);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_file(PathBuf::from("/nonexistent/list.xml")).await;
        assert!(matches!(err, Err(ListError::Io(_))));
    }
}
