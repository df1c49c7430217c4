//! XML external form of file listings.
//!
//! A listing is a single `FileListing` root element with a `Version`
//! attribute. Directories carry `Name` and optionally `Incomplete`
//! (`"0"` or `"1"`); files carry `Name`, `Size` and optionally a
//! 39-character base32 `TTH`. Unknown elements and attributes are
//! skipped; structural violations (a file containing elements, a file
//! outside the root, a bad size or TTH) are hard errors.
//!
//! Listings on disk may be bzip2-compressed; detection is by the `.bz2`
//! filename suffix. Some producers emit the raw byte `0x1D` where a
//! character was unrepresentable; the reader rewrites each such byte to
//! `?` before the XML layer sees it.

use std::io::Read;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::debug;

use dctide_hash::Tth;

use crate::error::ListError;
use crate::tree::{FileTree, NodeId};

const ROOT_TAG: &[u8] = b"FileListing";
const DIR_TAG: &[u8] = b"Directory";
const FILE_TAG: &[u8] = b"File";

fn malformed(msg: impl Into<String>) -> ListError {
    ListError::Malformed(msg.into())
}

fn attr_string(
    e: &BytesStart<'_>,
    want: &[u8],
) -> Result<Option<String>, ListError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| malformed(format!("bad attribute: {e}")))?;
        if attr.key.as_ref() == want {
            let v = attr
                .unescape_value()
                .map_err(|e| malformed(format!("bad attribute value: {e}")))?;
            return Ok(Some(v.into_owned()));
        }
    }
    Ok(None)
}

struct FileAttrs {
    name: String,
    size: u64,
    tth: Option<Tth>,
}

fn parse_file_attrs(e: &BytesStart<'_>) -> Result<FileAttrs, ListError> {
    let name = attr_string(e, b"Name")?.ok_or_else(|| malformed("file without Name"))?;
    let size_text = attr_string(e, b"Size")?.ok_or_else(|| malformed("file without Size"))?;
    if size_text.is_empty() || !size_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(format!("non-decimal file size {size_text:?}")));
    }
    let size: u64 = size_text
        .parse()
        .map_err(|_| malformed(format!("file size out of range {size_text:?}")))?;
    let tth = match attr_string(e, b"TTH")? {
        Some(text) => {
            Some(Tth::from_base32(&text).map_err(|e| malformed(format!("bad TTH: {e}")))?)
        }
        None => None,
    };
    Ok(FileAttrs { name, size, tth })
}

fn parse_dir_attrs(e: &BytesStart<'_>) -> Result<(String, bool), ListError> {
    let name = attr_string(e, b"Name")?.ok_or_else(|| malformed("directory without Name"))?;
    let incomplete = match attr_string(e, b"Incomplete")?.as_deref() {
        None | Some("0") => false,
        Some("1") => true,
        Some(other) => {
            return Err(malformed(format!("unrecognized Incomplete {other:?}")));
        }
    };
    Ok((name, incomplete))
}

/// Parse a listing from raw (already decompressed) bytes.
///
/// # Errors
///
/// Fails on XML syntax errors and on the structural violations listed
/// in the module docs.
pub fn parse_bytes(input: &[u8]) -> Result<FileTree, ListError> {
    // 0x1D is an encoding-failure stand-in, not valid in XML text.
    let cleaned: Vec<u8>;
    let input = if input.contains(&0x1D) {
        cleaned = input
            .iter()
            .map(|&b| if b == 0x1D { b'?' } else { b })
            .collect();
        &cleaned[..]
    } else {
        input
    };

    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();

    let mut tree = FileTree::new();
    // Stack of open Directory elements; the listing root sits below it.
    let mut stack: Vec<NodeId> = Vec::new();
    let mut root_open = false;
    let mut root_seen = false;
    let mut in_file = false;
    let mut skip_depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Text(t) => {
                if skip_depth == 0 {
                    let text = t.unescape().map_err(|e| malformed(format!("bad text: {e}")))?;
                    if !text.trim().is_empty() {
                        return Err(malformed("unexpected text content"));
                    }
                }
            }
            Event::CData(_) => {
                if skip_depth == 0 {
                    return Err(malformed("unexpected CDATA"));
                }
            }
            Event::Start(e) => {
                if skip_depth > 0 {
                    skip_depth += 1;
                    continue;
                }
                if in_file {
                    return Err(malformed("element nested inside a file"));
                }
                match e.name().as_ref() {
                    tag if tag == ROOT_TAG => {
                        if root_seen {
                            return Err(malformed("multiple FileListing roots"));
                        }
                        if attr_string(&e, b"Version")?.is_none() {
                            return Err(malformed("FileListing without Version"));
                        }
                        root_seen = true;
                        root_open = true;
                        stack.push(tree.root());
                    }
                    tag if tag == DIR_TAG => {
                        let Some(&parent) = stack.last() else {
                            return Err(malformed("directory outside the root"));
                        };
                        let (name, incomplete) = parse_dir_attrs(&e)?;
                        let dir = tree.create_dir(&name, incomplete)?;
                        tree.add(parent, dir)?;
                        stack.push(dir);
                    }
                    tag if tag == FILE_TAG => {
                        let Some(&parent) = stack.last() else {
                            return Err(malformed("file outside the root"));
                        };
                        let attrs = parse_file_attrs(&e)?;
                        let file = tree.create_file(&attrs.name, attrs.size, attrs.tth, None)?;
                        tree.add(parent, file)?;
                        in_file = true;
                    }
                    other => {
                        debug!(tag = %String::from_utf8_lossy(other), "skipping unknown element");
                        skip_depth = 1;
                    }
                }
            }
            Event::Empty(e) => {
                if skip_depth > 0 {
                    continue;
                }
                if in_file {
                    return Err(malformed("element nested inside a file"));
                }
                match e.name().as_ref() {
                    tag if tag == DIR_TAG => {
                        let Some(&parent) = stack.last() else {
                            return Err(malformed("directory outside the root"));
                        };
                        let (name, incomplete) = parse_dir_attrs(&e)?;
                        let dir = tree.create_dir(&name, incomplete)?;
                        tree.add(parent, dir)?;
                    }
                    tag if tag == FILE_TAG => {
                        let Some(&parent) = stack.last() else {
                            return Err(malformed("file outside the root"));
                        };
                        let attrs = parse_file_attrs(&e)?;
                        let file = tree.create_file(&attrs.name, attrs.size, attrs.tth, None)?;
                        tree.add(parent, file)?;
                    }
                    tag if tag == ROOT_TAG => {
                        // An empty share serializes to an empty root.
                        if root_seen {
                            return Err(malformed("multiple FileListing roots"));
                        }
                        if attr_string(&e, b"Version")?.is_none() {
                            return Err(malformed("FileListing without Version"));
                        }
                        root_seen = true;
                    }
                    _ => {}
                }
            }
            Event::End(e) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                    continue;
                }
                match e.name().as_ref() {
                    tag if tag == FILE_TAG => {
                        if !in_file {
                            return Err(malformed("stray file end tag"));
                        }
                        in_file = false;
                    }
                    tag if tag == DIR_TAG => {
                        if stack.len() <= 1 {
                            return Err(malformed("stray directory end tag"));
                        }
                        stack.pop();
                    }
                    tag if tag == ROOT_TAG => {
                        if stack.len() != 1 {
                            return Err(malformed("unclosed directory at root end"));
                        }
                        stack.pop();
                        root_open = false;
                    }
                    _ => {}
                }
            }
        }
        buf.clear();
    }

    if !root_seen {
        return Err(malformed("no FileListing root"));
    }
    if root_open || !stack.is_empty() {
        return Err(malformed("truncated listing"));
    }

    let root = tree.root();
    tree.sort_recursive(root);
    Ok(tree)
}

fn write_node<W: std::io::Write>(
    tree: &FileTree,
    id: NodeId,
    w: &mut Writer<W>,
) -> Result<(), ListError> {
    let node = tree.node(id);
    if node.is_file() {
        let mut e = BytesStart::new("File");
        e.push_attribute(("Name", node.name()));
        e.push_attribute(("Size", node.size().to_string().as_str()));
        if let Some(tth) = node.tth() {
            e.push_attribute(("TTH", tth.to_base32().as_str()));
        }
        w.write_event(Event::Empty(e))?;
    } else {
        let mut e = BytesStart::new("Directory");
        e.push_attribute(("Name", node.name()));
        if node.incomplete() {
            e.push_attribute(("Incomplete", "1"));
        }
        if node.children().is_empty() {
            w.write_event(Event::Empty(e))?;
        } else {
            w.write_event(Event::Start(e))?;
            for &child in node.children() {
                write_node(tree, child, w)?;
            }
            w.write_event(Event::End(BytesEnd::new("Directory")))?;
        }
    }
    Ok(())
}

/// Serialize a listing to XML bytes.
///
/// The tree is written in stored child order; canonicalize with
/// [`FileTree::sort_recursive`] first if it may be unsorted.
///
/// # Errors
///
/// Only I/O failures from the underlying writer.
pub fn serialize(tree: &FileTree) -> Result<Vec<u8>, ListError> {
    let mut w = Writer::new(Vec::new());
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;
    let mut root = BytesStart::new("FileListing");
    root.push_attribute(("Version", "1"));
    root.push_attribute(("Base", "/"));
    root.push_attribute(("Generator", concat!("dctide ", env!("CARGO_PKG_VERSION"))));
    w.write_event(Event::Start(root))?;
    let root_id = tree.root();
    for &child in tree.node(root_id).children() {
        write_node(tree, child, &mut w)?;
    }
    w.write_event(Event::End(BytesEnd::new("FileListing")))?;
    Ok(w.into_inner())
}

fn is_bz2(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("bz2"))
}

/// Read and parse a listing file, decompressing by `.bz2` suffix.
///
/// # Errors
///
/// I/O, decompression and parse failures.
pub fn parse_file(path: &Path) -> Result<FileTree, ListError> {
    let data = std::fs::read(path)?;
    if is_bz2(path) {
        let mut raw = Vec::new();
        bzip2::read::BzDecoder::new(&data[..]).read_to_end(&mut raw)?;
        parse_bytes(&raw)
    } else {
        parse_bytes(&data)
    }
}

/// Serialize a listing to a file, compressing by `.bz2` suffix.
///
/// # Errors
///
/// Serialization and file I/O failures.
pub fn save_file(tree: &FileTree, path: &Path) -> Result<(), ListError> {
    let xml = serialize(tree)?;
    if is_bz2(path) {
        let mut enc =
            bzip2::read::BzEncoder::new(&xml[..], bzip2::Compression::default());
        let mut out = Vec::new();
        enc.read_to_end(&mut out)?;
        std::fs::write(path, out)?;
    } else {
        std::fs::write(path, xml)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<FileListing Version="1" Base="/" Generator="test">
  <Directory Name="docs">
    <File Name="readme.txt" Size="12" TTH="LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"/>
    <Directory Name="empty"/>
  </Directory>
  <File Name="loose.bin" Size="0"/>
</FileListing>"#;

    #[test]
    fn test_parse_sample() {
        let tree = parse_bytes(SAMPLE.as_bytes()).unwrap();
        let docs = tree.resolve("/docs").unwrap();
        assert!(!tree.node(docs).is_file());
        assert_eq!(tree.node(docs).size(), 12);
        let readme = tree.resolve("/docs/readme.txt").unwrap();
        assert!(tree.node(readme).tth().is_some());
        let loose = tree.resolve("/loose.bin").unwrap();
        assert_eq!(tree.node(loose).size(), 0);
        assert!(tree.resolve("/docs/empty").is_some());
    }

    #[test]
    fn test_roundtrip() {
        let tree = parse_bytes(SAMPLE.as_bytes()).unwrap();
        let xml = serialize(&tree).unwrap();
        let back = parse_bytes(&xml).unwrap();
        assert_eq!(tree, back);
    }

    #[test]
    fn test_incomplete_flag_roundtrip() {
        let xml = r#"<FileListing Version="1"><Directory Name="d" Incomplete="1"/></FileListing>"#;
        let tree = parse_bytes(xml.as_bytes()).unwrap();
        let d = tree.resolve("/d").unwrap();
        assert!(tree.node(d).incomplete());
        let back = parse_bytes(&serialize(&tree).unwrap()).unwrap();
        assert_eq!(tree, back);
    }

    #[test]
    fn test_rejects_missing_version() {
        let xml = r#"<FileListing><File Name="x" Size="1"/></FileListing>"#;
        assert!(parse_bytes(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_rejects_nested_file() {
        let xml = r#"<FileListing Version="1"><File Name="x" Size="1"><File Name="y" Size="2"/></File></FileListing>"#;
        assert!(matches!(
            parse_bytes(xml.as_bytes()),
            Err(ListError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_file_outside_root() {
        let xml = r#"<File Name="x" Size="1"/>"#;
        assert!(parse_bytes(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_rejects_bad_size() {
        for size in ["-1", "abc", "1.5", ""] {
            let xml = format!(r#"<FileListing Version="1"><File Name="x" Size="{size}"/></FileListing>"#);
            assert!(parse_bytes(xml.as_bytes()).is_err(), "size {size:?}");
        }
    }

    #[test]
    fn test_rejects_bad_tth() {
        let xml = r#"<FileListing Version="1"><File Name="x" Size="1" TTH="NOTATTH"/></FileListing>"#;
        assert!(parse_bytes(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_rejects_bad_incomplete() {
        let xml = r#"<FileListing Version="1"><Directory Name="d" Incomplete="yes"/></FileListing>"#;
        assert!(parse_bytes(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_substitute_byte_rewritten() {
        let mut xml = br#"<FileListing Version="1"><File Name="a_c" Size="1"/></FileListing>"#.to_vec();
        let pos = xml.iter().position(|&b| b == b'_').unwrap();
        xml[pos] = 0x1D;
        let tree = parse_bytes(&xml).unwrap();
        assert!(tree.resolve("/a?c").is_some());
    }

    #[test]
    fn test_unknown_elements_skipped() {
        let xml = r#"<FileListing Version="1"><Share><File Name="hidden" Size="1"/></Share><File Name="x" Size="1"/></FileListing>"#;
        let tree = parse_bytes(xml.as_bytes()).unwrap();
        assert!(tree.resolve("/x").is_some());
        assert!(tree.resolve("/hidden").is_none());
    }

    #[test]
    fn test_bz2_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tree = parse_bytes(SAMPLE.as_bytes()).unwrap();

        let plain = dir.path().join("list.xml");
        save_file(&tree, &plain).unwrap();
        assert_eq!(parse_file(&plain).unwrap(), tree);

        let packed = dir.path().join("list.xml.bz2");
        save_file(&tree, &packed).unwrap();
        // The compressed form is not raw XML.
        assert!(parse_bytes(&std::fs::read(&packed).unwrap()).is_err());
        assert_eq!(parse_file(&packed).unwrap(), tree);
    }

    #[test]
    fn test_escaped_names_roundtrip() {
        let mut tree = FileTree::new();
        let root = tree.root();
        let f = tree
            .create_file("a&b <c>.txt", 5, None, None)
            .unwrap();
        tree.add(root, f).unwrap();
        tree.sort_recursive(root);
        let back = parse_bytes(&serialize(&tree).unwrap()).unwrap();
        assert_eq!(tree, back);
    }
}
