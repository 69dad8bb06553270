use {
    lru::LruCache,
    nix::sys::uio::{pread, pwrite},
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        os::unix::io::AsRawFd,
        sync::{Arc, Mutex},
    },
    tokio::{sync::mpsc, task},
};

use {
    super::{
        Command, CommandReceiver, CommandSender, TorrentAlert,
        TorrentAlertReceiver, TorrentAlertSender,
    },
    crate::{
        block_count,
        error::*,
        storage_info::{FileSlice, StorageInfo},
        BlockInfo, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk,
/// verifying whether downloaded pieces are valid, and reading blocks back
/// for serving uploads.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
}

impl Disk {
    /// Creates a new `Disk` instance and returns its command sender.
    pub(super) fn new() -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            cmd_chan,
        )
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    read_cache_size,
                    resp,
                } => {
                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify the torrent of it.
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        let _ = resp.send(Err(Error::AlreadyExists));
                        continue;
                    }
                    match Torrent::new(info, piece_hashes, read_cache_size) {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, torrent);
                            let _ = resp.send(Ok(alert_port));
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            let _ = resp.send(Err(e));
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.write_block(info, data).await?;
                    } else {
                        // write requests for a torrent may still be in
                        // flight after the torrent was removed
                        log::warn!("Torrent {} not found for write", id);
                    }
                }
                Command::ReadBlock { id, info, resp } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        let _ = resp.send(torrent.read_block(info).await);
                    } else {
                        log::warn!("Torrent {} not found for read", id);
                        let _ = resp.send(None);
                    }
                }
                Command::ValidatePieces { id, indices, resp } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        let _ =
                            resp.send(torrent.validate_pieces(indices).await);
                    } else {
                        let _ = resp.send(Err(Error::TorrentNotFound));
                    }
                }
                Command::RemoveTorrent { id } => {
                    log::info!("Removing torrent {} from disk task", id);
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a piece has been completed
    /// and hash checked.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster
    /// lookups.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation, in the same order as the torrent's file list so that a
    /// resolved [`FileSlice::file_index`] indexes directly into it. Padding
    /// files occupy their index with no handle.
    ///
    /// The blocking pool tasks that perform the actual writes get shared
    /// access to these handles through the arc.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Verified pieces read back recently, kept around for serving uploads
    /// without hitting the disk for every block request.
    read_cache: LruCache<PieceIndex, Arc<Vec<u8>>>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// Any subdirectories in the torrent archive are created and all files
    /// are opened and preallocated to their declared length up front.
    /// Padding files (BEP 47) get a placeholder entry and nothing on disk.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        read_cache_size: usize,
    ) -> Result<(Self, TorrentAlertReceiver)> {
        fs::create_dir_all(&info.download_dir)?;

        let file_list = info.structure.files();
        log::debug!("Torrent files: {:?}", file_list);
        let mut files = Vec::with_capacity(file_list.len());
        for file in file_list {
            // get the parent of the file path: if there is one (i.e. this
            // is not a file in the torrent root), and doesn't exist, create
            // it; padding files leave no trace on disk, directories
            // included
            if !file.is_pad {
                if let Some(subdir) = file.path.parent() {
                    let subdir = info.download_dir.join(subdir);
                    if !subdir.exists() {
                        log::info!("Creating torrent subdir {:?}", subdir);
                        fs::create_dir_all(&subdir)?;
                    }
                }
            }
            files.push(Mutex::new(TorrentFile::open(
                &info.download_dir,
                file.clone(),
            )?));
        }

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                read_cache: LruCache::new(read_cache_size.max(1)),
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan.send(TorrentAlert::WriteFailure {
                    index: piece_index,
                    error: e,
                })?;
                // return with ok as the disk task itself shouldn't be aborted
                // due to invalid input
                return Ok(());
            }
        }
        let piece = match self.pieces.get_mut(&piece_index) {
            Some(piece) => piece,
            // unreachable in practice: the piece was just inserted above
            None => return Ok(()),
        };

        piece.enqueue_block(info.offset, data);

        // if the piece has all its blocks, it means we can hash it and save it
        // to disk and clear its write buffer
        if piece.is_complete() {
            let piece = match self.pieces.remove(&piece_index) {
                Some(piece) => piece,
                None => return Ok(()),
            };
            // the piece index was validated when the buffer was created
            let slices = match self.info.piece_slices(piece_index) {
                Ok(slices) => slices,
                Err(e) => {
                    self.alert_chan.send(TorrentAlert::WriteFailure {
                        index: piece_index,
                        error: e,
                    })?;
                    return Ok(());
                }
            };
            let files = Arc::clone(&self.files);

            // don't block the reactor with the potentially expensive hashing
            // and sync file writing
            let write_result = task::spawn_blocking(move || {
                let data = piece.assemble();
                if !piece.matches_hash(&data) {
                    log::warn!("Piece {} is NOT valid", piece_index);
                    return Ok((false, None));
                }
                log::info!("Piece {} is valid", piece_index);
                let write_count = write_piece(&files, &slices, &data)?;
                Ok((true, Some((write_count, data))))
            })
            .await
            // our code doesn't panic in the task so until better strategies
            // are devised, unwrap here
            .expect("disk IO write task panicked");

            // We don't error out on disk write failure as we don't want to
            // kill the disk task due to potential disk IO errors (which may
            // happen from time to time). We alert torrent of this failure and
            // return normally.
            match write_result {
                Ok((is_valid, written)) => {
                    if let Some((write_count, data)) = written {
                        self.stats.write_count += write_count as u64;
                        // keep the freshly completed piece around for serving
                        self.read_cache.put(piece_index, Arc::new(data));
                    }
                    self.alert_chan.send(TorrentAlert::PieceCompleted {
                        index: piece_index,
                        is_valid,
                    })?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan.send(TorrentAlert::WriteFailure {
                        index: piece_index,
                        error: e,
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    ///
    /// This involves getting the expected hash of the piece and its length.
    fn start_new_piece(&mut self, info: BlockInfo) -> Result<()> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let expected_hash = expected_piece_hash(
            &self.piece_hashes,
            info.piece_index,
        )?;
        log::debug!(
            "Piece {} expected hash {}",
            info.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self.info.piece_len(info.piece_index)?;
        log::debug!("Piece {} is {} bytes long", info.piece_index, len);

        let piece = Piece {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }

    /// Reads a block for serving. Returns `None` if any underlying file is
    /// missing data for the block, so the caller can decline to serve it.
    async fn read_block(&mut self, info: BlockInfo) -> Option<Vec<u8>> {
        let piece_len = self.info.piece_len(info.piece_index).ok()?;
        if info.offset.checked_add(info.len)? > piece_len {
            log::warn!("Invalid block {} read", info);
            return None;
        }

        let range =
            info.offset as usize..(info.offset + info.len) as usize;
        if let Some(piece) = self.read_cache.get(&info.piece_index) {
            return Some(piece[range].to_vec());
        }

        let files = Arc::clone(&self.files);
        let slices = self.info.piece_slices(info.piece_index).ok()?;
        let piece = task::spawn_blocking(move || {
            read_piece(&files, &slices, piece_len)
        })
        .await
        .expect("disk IO read task panicked")?;

        let piece = Arc::new(piece);
        let block = piece[range].to_vec();
        self.read_cache.put(info.piece_index, piece);
        Some(block)
    }

    /// Reads and hashes each given piece, returning the indices whose data on
    /// disk still matches the expected hash.
    async fn validate_pieces(
        &mut self,
        indices: Vec<PieceIndex>,
    ) -> Result<Vec<PieceIndex>> {
        let files = Arc::clone(&self.files);
        let info = self.info.clone();
        let mut expected = Vec::with_capacity(indices.len());
        for &index in &indices {
            expected.push(expected_piece_hash(&self.piece_hashes, index)?);
        }

        let valid = task::spawn_blocking(move || {
            let mut valid = Vec::with_capacity(indices.len());
            for (&index, expected_hash) in indices.iter().zip(expected.iter())
            {
                let piece_len = match info.piece_len(index) {
                    Ok(len) => len,
                    Err(_) => continue,
                };
                let slices = match info.piece_slices(index) {
                    Ok(slices) => slices,
                    Err(_) => continue,
                };
                match read_piece(&files, &slices, piece_len) {
                    Some(data) => {
                        let hash = Sha1::digest(&data);
                        if hash.as_slice() == expected_hash.as_ref() {
                            valid.push(index);
                        } else {
                            log::warn!(
                                "Piece {} hash mismatch on disk",
                                index
                            );
                        }
                    }
                    None => {
                        log::warn!("Piece {} unreadable on disk", index);
                    }
                }
            }
            valid
        })
        .await
        .expect("disk IO validation task panicked");

        Ok(valid)
    }
}

/// Returns the expected hash of a piece from the concatenated hash string.
fn expected_piece_hash(
    piece_hashes: &[u8],
    index: PieceIndex,
) -> Result<Sha1Hash> {
    let hash_pos = index * 20;
    if hash_pos + 20 > piece_hashes.len() {
        log::warn!("Piece index {} is invalid", index);
        return Err(Error::InvalidPieceIndex);
    }
    let mut expected_hash = [0; 20];
    expected_hash.copy_from_slice(&piece_hashes[hash_pos..hash_pos + 20]);
    Ok(expected_hash)
}

/// Writes an assembled piece through its resolved file slices. Padding
/// slices consume their share of the buffer without touching the disk.
///
/// # Important
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
fn write_piece(
    files: &[Mutex<TorrentFile>],
    slices: &[FileSlice],
    data: &[u8],
) -> Result<usize> {
    let mut total_write_count = 0;
    let mut pos = 0;

    for slice in slices {
        let chunk = &data[pos..pos + slice.len as usize];
        pos += slice.len as usize;
        if slice.is_pad {
            continue;
        }
        let file = files[slice.file_index].lock().map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "file lock poisoned",
            ))
        })?;
        total_write_count += file.write_all_at(chunk, slice.offset)?;
    }

    // the slices tile the piece
    debug_assert_eq!(pos, data.len());

    Ok(total_write_count)
}

/// Reads a whole piece through its resolved file slices, or `None` if the
/// slices don't cover the piece (missing files) or a file is truncated.
/// Padding slices read back as zeroes without touching the disk.
///
/// # Important
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
fn read_piece(
    files: &[Mutex<TorrentFile>],
    slices: &[FileSlice],
    piece_len: u32,
) -> Option<Vec<u8>> {
    let mut data = vec![0; piece_len as usize];
    let mut pos = 0;

    for slice in slices {
        let chunk = &mut data[pos..pos + slice.len as usize];
        pos += slice.len as usize;
        if slice.is_pad {
            // the buffer already holds the zeroes padding reads back as
            continue;
        }
        let file = files[slice.file_index].lock().ok()?;
        file.read_exact_at(chunk, slice.offset).ok()?;
    }

    if pos == data.len() {
        Some(data)
    } else {
        None
    }
}

struct TorrentFile {
    info: crate::FileInfo,
    /// Padding files have no on disk representation.
    handle: Option<File>,
}

impl TorrentFile {
    /// Opens (creating if needed) the file and preallocates it to its
    /// declared length.
    fn open(
        download_dir: &std::path::Path,
        info: crate::FileInfo,
    ) -> Result<Self> {
        if info.is_pad {
            return Ok(Self { info, handle: None });
        }
        let path = download_dir.join(&info.path);
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                Error::Io(e)
            })?;
        if handle.metadata()?.len() < info.len {
            handle.set_len(info.len)?;
        }
        Ok(Self {
            info,
            handle: Some(handle),
        })
    }

    /// Writes the whole buffer at the given file offset. IO syscalls are not
    /// guaranteed to write the whole input buffer in one go, so we write
    /// until all bytes have been confirmed (or an error occurs).
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> Result<usize> {
        let handle = match &self.handle {
            Some(handle) => handle,
            None => return Ok(0),
        };
        let mut total_write_count = 0;
        while !buf.is_empty() {
            let write_count =
                pwrite(handle.as_raw_fd(), buf, offset as i64).map_err(
                    |e| {
                        log::warn!(
                            "File {:?} write error: {}",
                            self.info.path,
                            e
                        );
                        Error::Io(std::io::Error::last_os_error())
                    },
                )?;
            buf = &buf[write_count..];
            offset += write_count as u64;
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }

    /// Reads exactly the buffer's length at the given file offset, failing
    /// on a short read (truncated file).
    fn read_exact_at(
        &self,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> Result<()> {
        let handle = match &self.handle {
            Some(handle) => handle,
            None => return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "padding file has no data",
            ))),
        };
        while !buf.is_empty() {
            let read_count = pread(handle.as_raw_fd(), buf, offset as i64)
                .map_err(|_| {
                    Error::Io(std::io::Error::last_os_error())
                })?;
            if read_count == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file shorter than expected",
                )));
            }
            buf = &mut buf[read_count..];
            offset += read_count as u64;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks. Once the size of this map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash is
    /// correct, saved to disk.
    ///
    /// Each block is mapped to its offset within piece, and we're using
    /// a BTreeMap to keep keys sorted. This is important when iterating over
    /// the map to concatenate the blocks.
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl Piece {
    /// Places block into piece's write buffer if it doesn't exist.
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Concatenates the blocks into the full piece, in offset order.
    fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut data = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            data.extend_from_slice(block);
        }
        data
    }

    /// Calculates the piece's hash and returns if it matches the expected
    /// hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread
    /// pool and not the executor.
    fn matches_hash(&self, data: &[u8]) -> bool {
        let hash = Sha1::digest(data);
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("crabtorrent-test")
            .join(format!("{}-{}", name, rand::random::<u32>()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn open_all(
        dir: &PathBuf,
        structure: &FsStructure,
    ) -> Vec<Mutex<TorrentFile>> {
        structure
            .files()
            .iter()
            .map(|file| {
                Mutex::new(TorrentFile::open(dir, file.clone()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_write_and_read_piece_roundtrip() {
        let dir = test_dir("roundtrip");
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("data.bin"),
            len: 64,
            torrent_offset: 0,
            is_pad: false,
        });
        let files = open_all(&dir, &structure);

        // the second 32 byte piece of the file
        let piece: Vec<u8> = (0..32).collect();
        let slices = structure.resolve_range(32, 32);
        write_piece(&files, &slices, &piece).unwrap();
        let read = read_piece(&files, &slices, 32).unwrap();
        assert_eq!(read, piece);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_piece_across_files() {
        let dir = test_dir("multifile");
        let structure = FsStructure::Archive {
            files: vec![
                FileInfo {
                    path: PathBuf::from("a.bin"),
                    len: 10,
                    torrent_offset: 0,
                    is_pad: false,
                },
                FileInfo {
                    path: PathBuf::from("b.bin"),
                    len: 22,
                    torrent_offset: 10,
                    is_pad: false,
                },
            ],
        };
        let files = open_all(&dir, &structure);

        let piece: Vec<u8> = (0..32).collect();
        let slices = structure.resolve_range(0, 32);
        write_piece(&files, &slices, &piece).unwrap();
        let read = read_piece(&files, &slices, 32).unwrap();
        assert_eq!(read, piece);

        // the bytes landed in the right files
        assert_eq!(fs::read(dir.join("a.bin")).unwrap(), &piece[..10]);
        assert_eq!(fs::read(dir.join("b.bin")).unwrap(), &piece[10..]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_pad_files_not_materialized() {
        let dir = test_dir("padfile");
        // a 10 byte file padded out to a 32 byte piece boundary (BEP 47)
        let structure = FsStructure::Archive {
            files: vec![
                FileInfo {
                    path: PathBuf::from("a.bin"),
                    len: 10,
                    torrent_offset: 0,
                    is_pad: false,
                },
                FileInfo {
                    path: PathBuf::from(".pad").join("22"),
                    len: 22,
                    torrent_offset: 10,
                    is_pad: true,
                },
            ],
        };
        let files = open_all(&dir, &structure);
        let slices = structure.resolve_range(0, 32);
        assert!(slices.iter().any(|slice| slice.is_pad));

        let mut piece = vec![0xaa; 10];
        piece.extend_from_slice(&[0; 22]);
        write_piece(&files, &slices, &piece).unwrap();
        // nothing under .pad was created on disk
        assert!(!dir.join(".pad").exists());

        // padding bytes read back as zeroes
        let read = read_piece(&files, &slices, 32).unwrap();
        assert_eq!(read, piece);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_piece_buffer_and_hash() {
        let blocks: Vec<u8> = vec![1, 2, 3, 4];
        let expected = {
            let digest = Sha1::digest(&blocks);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };
        let mut piece = Piece {
            expected_hash: expected,
            len: 4,
            blocks: BTreeMap::new(),
        };
        piece.enqueue_block(0, blocks.clone());
        assert!(piece.is_complete());
        let data = piece.assemble();
        assert!(piece.matches_hash(&data));

        // a flipped byte fails the hash check
        let mut corrupt = data.clone();
        corrupt[0] ^= 0xff;
        assert!(!piece.matches_hash(&corrupt));
    }
}
