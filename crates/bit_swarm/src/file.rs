use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::bencode::{self, BencodeError, Value};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error("invalid metadata: {0}")]
    Invalid(String),
    #[error("could not read torrent file: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(msg: impl Into<String>) -> MetadataError {
    MetadataError::Invalid(msg.into())
}

/// One destination file of the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the download directory. Multi-file torrents are rooted at `name`.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte of this file within the concatenated torrent content.
    pub byte_offset: u64,
    pub md5sum: Option<String>,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMeta {
    pub announce: String,
    pub name: String,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
}

impl TorrentMeta {
    pub fn from_bytes(content: &[u8]) -> Result<Self, MetadataError> {
        let doc = bencode::decode_document(content)?;
        let root = &doc.root;
        let span = doc
            .info_span
            .ok_or_else(|| invalid("missing info dictionary"))?;
        let info = root
            .get(b"info")
            .filter(|v| v.as_dict().is_some())
            .ok_or_else(|| invalid("info is not a dictionary"))?;

        let announce = root
            .get(b"announce")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing announce url"))?
            .to_string();
        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing info.name"))?
            .to_string();
        check_segment(&name)?;

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_integer)
            .filter(|l| *l > 0)
            .ok_or_else(|| invalid("missing or non-positive info.piece length"))?
            as u64;
        if piece_length > u32::MAX as u64 {
            return Err(invalid(format!(
                "info.piece length {} does not fit in 32 bits",
                piece_length
            )));
        }

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing info.pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(invalid(format!(
                "info.pieces length {} is not a multiple of 20",
                pieces.len()
            )));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect();

        let files = read_files(info, &name)?;
        let total_size: u64 = files.iter().map(|f| f.length).sum();

        let expected_pieces = total_size.div_ceil(piece_length);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(format!(
                "{} piece hashes for {} bytes at piece length {}",
                piece_hashes.len(),
                total_size,
                piece_length
            )));
        }

        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(&content[span]);
        let info_hash = hasher.digest().bytes();

        Ok(Self {
            announce,
            name,
            info_hash,
            piece_length,
            piece_hashes,
            files,
            total_size,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Absolute byte bounds `[start, end)` of piece `index`; the last piece may be short.
    pub fn piece_bounds(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_size);
        (start, end)
    }

    pub fn piece_size(&self, index: usize) -> u32 {
        let (start, end) = self.piece_bounds(index);
        (end - start) as u32
    }
}

fn read_files(info: &Value, name: &str) -> Result<Vec<FileEntry>, MetadataError> {
    let md5sum = |v: &Value| v.get(b"md5sum").and_then(Value::as_str).map(String::from);

    if let Some(files) = info.get(b"files") {
        let files = files
            .as_list()
            .ok_or_else(|| invalid("info.files is not a list"))?;
        let mut entries = Vec::with_capacity(files.len());
        let mut byte_offset = 0;
        for file in files {
            let length = file
                .get(b"length")
                .and_then(Value::as_integer)
                .filter(|l| *l >= 0)
                .ok_or_else(|| invalid("file entry without a valid length"))?
                as u64;
            let segments = file
                .get(b"path")
                .and_then(Value::as_list)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| invalid("file entry without path segments"))?;

            let mut path = PathBuf::from(name);
            for segment in segments {
                let segment = segment
                    .as_str()
                    .ok_or_else(|| invalid("path segment is not a string"))?;
                check_segment(segment)?;
                path.push(segment);
            }

            entries.push(FileEntry {
                path,
                length,
                byte_offset,
                md5sum: md5sum(file),
                selected: true,
            });
            byte_offset += length;
        }
        Ok(entries)
    } else {
        let length = info
            .get(b"length")
            .and_then(Value::as_integer)
            .filter(|l| *l >= 0)
            .ok_or_else(|| invalid("neither info.length nor info.files present"))?
            as u64;
        Ok(vec![FileEntry {
            path: PathBuf::from(name),
            length,
            byte_offset: 0,
            md5sum: md5sum(info),
            selected: true,
        }])
    }
}

// Segments end up joined under the download directory.
fn check_segment(segment: &str) -> Result<(), MetadataError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(invalid(format!("unsafe path segment {:?}", segment)));
    }
    Ok(())
}

pub fn from_filename(filename: impl AsRef<Path>) -> Result<TorrentMeta, MetadataError> {
    let content = std::fs::read(filename)?;
    TorrentMeta::from_bytes(&content)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bencode::encode;

    pub fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(data);
        hasher.digest().bytes()
    }

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    fn two_file_torrent(announce: &str) -> Vec<u8> {
        let file = |name: &str, length: i64| {
            dict(vec![
                ("length", Value::Integer(length)),
                ("path", Value::List(vec![Value::string(name)])),
            ])
        };
        let info = dict(vec![
            (
                "files",
                Value::List(vec![file("a.bin", 150), file("b.bin", 250)]),
            ),
            ("name", Value::string("pack")),
            ("piece length", Value::Integer(200)),
            ("pieces", Value::Bytes(vec![7u8; 40])),
        ]);
        encode(&dict(vec![
            ("announce", Value::string(announce)),
            ("info", info),
        ]))
    }

    #[test]
    fn computes_file_offsets_for_multi_file_torrent() {
        let meta = TorrentMeta::from_bytes(&two_file_torrent("http://t/announce")).unwrap();
        assert_eq!(meta.total_size, 400);
        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(meta.files[0].byte_offset, 0);
        assert_eq!(meta.files[1].byte_offset, 150);
        assert_eq!(meta.files[1].path, PathBuf::from("pack").join("b.bin"));
        assert!(meta.files.iter().all(|f| f.selected));
    }

    #[test]
    fn info_hash_ignores_content_outside_info() {
        let a = TorrentMeta::from_bytes(&two_file_torrent("http://one/announce")).unwrap();
        let b = TorrentMeta::from_bytes(&two_file_torrent("http://two/announce")).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
        assert_ne!(a.announce, b.announce);
    }

    #[test]
    fn info_hash_is_taken_over_raw_bytes() {
        let raw = two_file_torrent("http://t/announce");
        let meta = TorrentMeta::from_bytes(&raw).unwrap();
        let doc = bencode::decode_document(&raw).unwrap();
        assert_eq!(meta.info_hash, sha1(&raw[doc.info_span.unwrap()]));
        assert_eq!(meta.info_hash_hex().len(), 40);
    }

    #[test]
    fn single_file_torrent_and_short_last_piece() {
        let info = dict(vec![
            ("length", Value::Integer(500)),
            ("name", Value::string("one.iso")),
            ("piece length", Value::Integer(200)),
            ("pieces", Value::Bytes(vec![1u8; 60])),
        ]);
        let raw = encode(&dict(vec![("announce", Value::string("u")), ("info", info)]));
        let meta = TorrentMeta::from_bytes(&raw).unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, PathBuf::from("one.iso"));
        assert_eq!(meta.piece_size(0), 200);
        assert_eq!(meta.piece_size(2), 100);
        assert_eq!(meta.piece_bounds(2), (400, 500));
    }

    #[test]
    fn rejects_pieces_not_multiple_of_twenty() {
        let info = dict(vec![
            ("length", Value::Integer(10)),
            ("name", Value::string("x")),
            ("piece length", Value::Integer(16)),
            ("pieces", Value::Bytes(vec![0u8; 19])),
        ]);
        let raw = encode(&dict(vec![("announce", Value::string("u")), ("info", info)]));
        assert!(matches!(
            TorrentMeta::from_bytes(&raw),
            Err(MetadataError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_piece_length_wider_than_u32() {
        let piece_length = u32::MAX as i64 + 1;
        let info = dict(vec![
            ("length", Value::Integer(piece_length)),
            ("name", Value::string("big")),
            ("piece length", Value::Integer(piece_length)),
            ("pieces", Value::Bytes(vec![0u8; 20])),
        ]);
        let raw = encode(&dict(vec![("announce", Value::string("u")), ("info", info)]));
        match TorrentMeta::from_bytes(&raw) {
            Err(MetadataError::Invalid(msg)) => assert!(msg.contains("32 bits")),
            other => panic!("expected invalid metadata, got {:?}", other),
        }
    }

    #[test]
    fn rejects_empty_path_and_traversal() {
        for path in [Value::List(vec![]), Value::List(vec![Value::string("..")])] {
            let info = dict(vec![
                (
                    "files",
                    Value::List(vec![dict(vec![
                        ("length", Value::Integer(1)),
                        ("path", path),
                    ])]),
                ),
                ("name", Value::string("x")),
                ("piece length", Value::Integer(16)),
                ("pieces", Value::Bytes(vec![0u8; 20])),
            ]);
            let raw = encode(&dict(vec![("announce", Value::string("u")), ("info", info)]));
            assert!(TorrentMeta::from_bytes(&raw).is_err());
        }
    }

    #[test]
    fn propagates_bencode_errors() {
        assert!(matches!(
            TorrentMeta::from_bytes(b"d8:announce"),
            Err(MetadataError::Bencode(_))
        ));
    }
}
