//! The disk task: all file IO and piece verification of every torrent in the
//! engine runs here, off the async executor, and communicates with torrents
//! through channels.

mod io;

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::*, storage_info::StorageInfo, BlockInfo, PieceIndex, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// The commands the disk task accepts.
pub(crate) enum Command {
    /// Sets up the file system structure and file handles of a new torrent.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        read_cache_size: usize,
        resp: oneshot::Sender<Result<TorrentAlertReceiver>>,
    },
    /// Queues a downloaded block. When its piece completes, the piece is
    /// hashed and, if valid, written out; the torrent is alerted either way.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block for serving to a peer. Responds with `None` if any
    /// underlying file is missing or truncated, in which case the block is
    /// not served.
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        resp: oneshot::Sender<Option<Vec<u8>>>,
    },
    /// Re-reads the given pieces from disk and hashes them, responding with
    /// the subset that is still valid. Used by checkpoint resume and rehash.
    ValidatePieces {
        id: TorrentId,
        indices: Vec<PieceIndex>,
        resp: oneshot::Sender<Result<Vec<PieceIndex>>>,
    },
    /// Drops a torrent's file handles and write buffers.
    RemoveTorrent {
        id: TorrentId,
    },
    /// Stops the disk task.
    Shutdown,
}

/// Alerts a torrent receives from the disk task.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// A piece had all its blocks and was hash checked. If the hash matched,
    /// the blocks are on disk by the time this alert is sent.
    PieceCompleted {
        index: PieceIndex,
        is_valid: bool,
    },
    /// Writing a completed piece failed. Carries the offending piece so its
    /// blocks can be re-fetched once the condition (e.g. a full disk) clears.
    WriteFailure {
        index: PieceIndex,
        error: Error,
    },
}

/// A cheaply clonable handle for talking to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Allocates a torrent on disk and returns the channel on which its
    /// piece completion alerts arrive.
    pub async fn allocate_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        read_cache_size: usize,
    ) -> Result<TorrentAlertReceiver> {
        let (resp, port) = oneshot::channel();
        self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
            read_cache_size,
            resp,
        })?;
        port.await?
    }

    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.cmd_chan.send(Command::WriteBlock { id, info, data })?;
        Ok(())
    }

    pub async fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
    ) -> Result<Option<Vec<u8>>> {
        let (resp, port) = oneshot::channel();
        self.cmd_chan.send(Command::ReadBlock { id, info, resp })?;
        Ok(port.await?)
    }

    pub async fn validate_pieces(
        &self,
        id: TorrentId,
        indices: Vec<PieceIndex>,
    ) -> Result<Vec<PieceIndex>> {
        let (resp, port) = oneshot::channel();
        self.cmd_chan
            .send(Command::ValidatePieces { id, indices, resp })?;
        port.await?
    }

    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan.send(Command::RemoveTorrent { id })?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown)?;
        Ok(())
    }
}

/// Spawns the disk task and returns a handle to it.
pub(crate) fn spawn() -> DiskHandle {
    let (mut disk, cmd_chan) = io::Disk::new();
    tokio::task::spawn(async move {
        if let Err(e) = disk.start().await {
            log::error!("Disk task exited with error: {}", e);
        }
    });
    DiskHandle { cmd_chan }
}
