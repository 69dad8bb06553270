//! Maps the torrent's linear byte space onto its files.
//!
//! All files of a torrent, viewed back to back, form one contiguous virtual
//! byte space starting at offset 0; pieces are fixed size windows into it.
//! The resolver here turns any byte range of that space into per-file
//! slices, which is the one primitive the disk task needs for both reads
//! and writes. Padding files (BEP 47) take part in the resolution like any
//! other file but their slices are flagged: they occupy virtual space only,
//! so writes to them are dropped and reads yield zeroes.

use std::path::PathBuf;

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The offset of the file's first byte in the torrent's virtual byte
    /// space. Always 0 for a single file torrent.
    pub torrent_offset: u64,
    /// Padding files are never materialized on disk; they only exist to
    /// align the next real file to a piece boundary.
    pub is_pad: bool,
}

impl FileInfo {
    /// One past the file's last byte in the torrent's virtual byte space.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }
}

/// A contiguous chunk of a resolved byte range: which file holds it, and
/// where within that file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// Index into the torrent's file list.
    pub file_index: FileIndex,
    /// The byte offset within the file.
    pub offset: u64,
    /// The length of the chunk, in bytes.
    pub len: u64,
    /// Whether the chunk falls into a padding file: dropped on write, read
    /// back as zeroes.
    pub is_pad: bool,
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested directories
    /// and padding entries between them.
    Archive {
        /// All files of the torrent in their virtual byte space order,
        /// padding files included (their index positions matter for file
        /// selection and the disk task's handle table).
        files: Vec<FileInfo>,
    },
}

impl FsStructure {
    /// Returns true if the download is for an archive.
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// All files in virtual byte space order, a one element slice for the
    /// single file case.
    pub(crate) fn files(&self) -> &[FileInfo] {
        match self {
            Self::File(file) => std::slice::from_ref(file),
            Self::Archive { files } => files,
        }
    }

    /// The total virtual size in bytes, padding files included.
    pub fn download_len(&self) -> u64 {
        self.files().iter().map(|file| file.len).sum()
    }

    /// Resolves a byte range of the torrent's virtual byte space into file
    /// slices, in order. The returned slices tile the range exactly; a
    /// range reaching past the last file is resolved only up to the end of
    /// the files (the caller detects the shortfall from the summed slice
    /// lengths).
    pub(crate) fn resolve_range(
        &self,
        torrent_offset: u64,
        len: u64,
    ) -> Vec<FileSlice> {
        let files = self.files();
        let end = torrent_offset + len;
        let mut slices = Vec::new();

        // the first file whose byte range reaches past the start; empty
        // files never contain a byte and are skipped the same way here and
        // in the loop below
        let mut file_index = files
            .partition_point(|file| file.torrent_end_offset() <= torrent_offset);
        let mut cursor = torrent_offset;

        while cursor < end {
            let file = match files.get(file_index) {
                Some(file) => file,
                None => break,
            };
            if file.len == 0 {
                file_index += 1;
                continue;
            }
            debug_assert!(file.torrent_offset <= cursor);
            let slice_end = end.min(file.torrent_end_offset());
            slices.push(FileSlice {
                file_index,
                offset: cursor - file.torrent_offset,
                len: slice_end - cursor,
                is_pad: file.is_pad,
            });
            cursor = slice_end;
            file_index += 1;
        }

        slices
    }
}

/// Storage level facts about a torrent: piece geometry and where the
/// download lives on disk.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal piece length.
    pub piece_len: u32,
    /// The length of the last piece, which is shorter whenever the download
    /// length is not an exact multiple of the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// Where the torrent's files go. Single file downloads land directly in
    /// the configured directory; archives get a subdirectory named after
    /// the torrent so their entries don't scatter.
    pub download_dir: PathBuf,
    /// The torrent's file layout.
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Derives the storage facts from the parsed metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.piece_len;
        let download_len = metainfo.download_len();
        let last_piece_len = (download_len
            - piece_len as u64 * (piece_count as u64 - 1))
            as u32;
        let download_dir = if metainfo.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };
        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure: metainfo.structure.clone(),
        }
    }

    /// The first byte offset of the piece in the torrent's virtual byte
    /// space.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// The length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Resolves a whole piece into file slices. The slices always tile the
    /// piece exactly, since the piece hashes cover the full virtual byte
    /// space.
    pub fn piece_slices(&self, index: PieceIndex) -> Result<Vec<FileSlice>> {
        let len = self.piece_len(index)? as u64;
        let slices = self
            .structure
            .resolve_range(self.piece_offset(index), len);
        debug_assert_eq!(
            slices.iter().map(|slice| slice.len).sum::<u64>(),
            len
        );
        Ok(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            torrent_offset,
            len,
            is_pad: false,
        }
    }

    fn pad(torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(".pad").join(len.to_string()),
            torrent_offset,
            len,
            is_pad: true,
        }
    }

    // An archive in the BEP 47 style: every data file is padded out to the
    // 64 byte piece boundary.
    //
    //   bytes   0..100   a.bin
    //   bytes 100..128   padding
    //   bytes 128..158   b.bin
    //   bytes 158..192   padding
    //   bytes 192..256   c.bin
    fn padded_archive() -> FsStructure {
        FsStructure::Archive {
            files: vec![
                file("a.bin", 0, 100),
                pad(100, 28),
                file("b.bin", 128, 30),
                pad(158, 34),
                file("c.bin", 192, 64),
            ],
        }
    }

    fn padded_storage() -> StorageInfo {
        StorageInfo {
            piece_count: 4,
            piece_len: 64,
            last_piece_len: 64,
            download_len: 256,
            download_dir: PathBuf::from("/downloads/padded"),
            structure: padded_archive(),
        }
    }

    #[test]
    fn test_resolve_single_file() {
        let structure = FsStructure::File(file("data.bin", 0, 1000));
        assert_eq!(
            structure.resolve_range(100, 300),
            vec![FileSlice {
                file_index: 0,
                offset: 100,
                len: 300,
                is_pad: false,
            }]
        );
        // a range past the end is resolved only up to the file's last byte
        let slices = structure.resolve_range(900, 300);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len, 100);
        // a range entirely past the end resolves to nothing
        assert!(structure.resolve_range(1000, 10).is_empty());
    }

    #[test]
    fn test_resolve_range_spanning_files() {
        let structure = padded_archive();
        // bytes 90..140: tail of a.bin, the whole first padding, head of
        // b.bin
        let slices = structure.resolve_range(90, 50);
        assert_eq!(
            slices,
            vec![
                FileSlice {
                    file_index: 0,
                    offset: 90,
                    len: 10,
                    is_pad: false,
                },
                FileSlice {
                    file_index: 1,
                    offset: 0,
                    len: 28,
                    is_pad: true,
                },
                FileSlice {
                    file_index: 2,
                    offset: 0,
                    len: 12,
                    is_pad: false,
                },
            ]
        );
        // the slices tile the range
        assert_eq!(slices.iter().map(|s| s.len).sum::<u64>(), 50);
    }

    #[test]
    fn test_resolve_range_inside_padding() {
        let structure = padded_archive();
        // bytes 160..190 fall entirely into the second padding file
        let slices = structure.resolve_range(160, 30);
        assert_eq!(slices.len(), 1);
        assert!(slices[0].is_pad);
        assert_eq!(slices[0].file_index, 3);
        assert_eq!(slices[0].offset, 2);
        assert_eq!(slices[0].len, 30);
    }

    #[test]
    fn test_zero_length_files_are_skipped() {
        let structure = FsStructure::Archive {
            files: vec![
                file("a.bin", 0, 10),
                file("empty.bin", 10, 0),
                file("b.bin", 10, 10),
            ],
        };
        let slices = structure.resolve_range(5, 10);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].file_index, 0);
        assert_eq!(slices[1].file_index, 2);
        assert_eq!(slices[1].offset, 0);
        assert_eq!(slices[1].len, 5);
    }

    #[test]
    fn test_piece_slices_with_padding() {
        let info = padded_storage();

        // piece 1 (bytes 64..128): tail of a.bin plus the aligning padding
        let slices = info.piece_slices(1).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!((slices[0].file_index, slices[0].is_pad), (0, false));
        assert_eq!(slices[0].offset, 64);
        assert_eq!(slices[0].len, 36);
        assert_eq!((slices[1].file_index, slices[1].is_pad), (1, true));
        assert_eq!(slices[1].len, 28);

        // piece 3 (bytes 192..256): exactly c.bin, thanks to the padding --
        // the BEP 47 point of the exercise
        let slices = info.piece_slices(3).unwrap();
        assert_eq!(
            slices,
            vec![FileSlice {
                file_index: 4,
                offset: 0,
                len: 64,
                is_pad: false,
            }]
        );
    }

    #[test]
    fn test_piece_geometry() {
        let info = StorageInfo {
            piece_count: 3,
            piece_len: 64,
            last_piece_len: 20,
            download_len: 148,
            download_dir: PathBuf::from("/downloads"),
            structure: FsStructure::File(file("data.bin", 0, 148)),
        };
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(2), 128);
        assert_eq!(info.piece_len(0).unwrap(), 64);
        assert_eq!(info.piece_len(2).unwrap(), 20);
        assert!(info.piece_len(3).is_err());

        // the shorter last piece resolves to a shorter slice
        let slices = info.piece_slices(2).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len, 20);
    }

    #[test]
    fn test_download_len_includes_padding() {
        assert_eq!(padded_archive().download_len(), 256);
        assert_eq!(
            FsStructure::File(file("data.bin", 0, 42)).download_len(),
            42
        );
    }
}
