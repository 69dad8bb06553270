//! End to end tests driving two engine instances against each other over
//! loopback TCP: a full transfer, checkpoint resume, and the engine's
//! administrative surface.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use sha1::{Digest, Sha1};
use tokio::time::delay_for;

use crabtorrent::{
    engine::{AddTorrent, Engine},
    metainfo::Metainfo,
    CheckpointSource, Conf, RateLimits, TorrentOptions, TorrentState,
};

const PIECE_LEN: u32 = 16384;

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("crabtorrent-e2e")
        .join(format!("{}-{}", name, rand::random::<u32>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A deterministic but non-trivial payload.
fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 257 + 7) as u8).collect()
}

/// Builds a single file torrent's metainfo for the given payload.
fn build_metainfo(name: &str, data: &[u8], private: bool) -> Metainfo {
    let mut pieces = Vec::new();
    for chunk in data.chunks(PIECE_LEN as usize) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    let mut buf = Vec::new();
    buf.extend_from_slice(b"d4:infod");
    buf.extend_from_slice(format!("6:lengthi{}e", data.len()).as_bytes());
    buf.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
    buf.extend_from_slice(
        format!("12:piece lengthi{}e", PIECE_LEN).as_bytes(),
    );
    buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
    buf.extend_from_slice(&pieces);
    if private {
        buf.extend_from_slice(b"7:privatei1e");
    }
    buf.extend_from_slice(b"ee");
    Metainfo::from_bytes(&buf).unwrap()
}

/// An engine configuration bound to loopback with all external discovery
/// disabled, so the tests stay fully local.
fn test_conf(download_dir: &Path, state_dir: &Path) -> Conf {
    let mut conf = Conf::new(download_dir);
    conf.engine.state_dir = state_dir.to_path_buf();
    conf.engine.listen_addr = "127.0.0.1:0".parse().unwrap();
    conf.engine.udp_tracker_port = 0;
    conf.engine.enable_dht = false;
    conf.engine.enable_nat = false;
    conf.engine.auto_scrape_interval = None;
    // tighten the choke round so the transfer starts promptly
    conf.torrent.unchoke_interval = Duration::from_secs(2);
    conf.torrent.optimistic_unchoke_interval = Duration::from_secs(5);
    conf
}

fn add_params(metainfo: Metainfo, resume: bool) -> AddTorrent {
    AddTorrent {
        metainfo,
        source: CheckpointSource::File(PathBuf::from("/tmp/test.torrent")),
        options: TorrentOptions::default(),
        rate_limits: RateLimits::default(),
        resume,
    }
}

#[tokio::test(threaded_scheduler)]
async fn test_two_peer_transfer() {
    let seeder_dir = test_dir("seeder");
    let leecher_dir = test_dir("leecher");

    let data = test_data(4 * PIECE_LEN as usize);
    let metainfo = build_metainfo("data.bin", &data, false);
    let info_hash = metainfo.info_hash;
    std::fs::write(seeder_dir.join("data.bin"), &data).unwrap();

    let seeder = Engine::start(test_conf(
        &seeder_dir,
        &seeder_dir.join("state"),
    ))
    .await
    .unwrap();
    seeder
        .add_torrent(add_params(metainfo.clone(), false))
        .await
        .unwrap();
    // promote the pre-existing data
    let verified = seeder.rehash(info_hash).await.unwrap();
    assert_eq!(verified, 4);
    let status = seeder.torrent_status(info_hash).await.unwrap();
    assert_eq!(status.state, TorrentState::Seeding);
    assert!(status.is_complete);

    let leecher = Engine::start(test_conf(
        &leecher_dir,
        &leecher_dir.join("state"),
    ))
    .await
    .unwrap();
    leecher
        .add_torrent(add_params(metainfo, false))
        .await
        .unwrap();
    let seeder_addr: SocketAddr =
        format!("127.0.0.1:{}", seeder.listen_port()).parse().unwrap();
    leecher.add_peer(info_hash, seeder_addr).await.unwrap();

    // the download completes within a bounded time
    let mut complete = false;
    for _ in 0..240 {
        let status = leecher.torrent_status(info_hash).await.unwrap();
        if status.is_complete {
            complete = true;
            assert_eq!(status.verified_piece_count, 4);
            assert_eq!(status.state, TorrentState::Seeding);
            break;
        }
        delay_for(Duration::from_millis(250)).await;
    }
    assert!(complete, "download did not complete in time");

    // the file on the leecher's disk is byte identical
    let downloaded =
        std::fs::read(leecher_dir.join("data.bin")).unwrap();
    assert_eq!(downloaded, data);

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}

#[tokio::test(threaded_scheduler)]
async fn test_checkpoint_resume_without_wire_io() {
    let dir = test_dir("resume");
    let state_dir = dir.join("state");

    // 8 pieces; only pieces 0, 2, and 5 are intact on disk
    let data = test_data(8 * PIECE_LEN as usize);
    let metainfo = build_metainfo("data.bin", &data, false);
    let info_hash = metainfo.info_hash;
    let mut on_disk = data.clone();
    for piece in [1usize, 3, 4, 6, 7].iter() {
        on_disk[piece * PIECE_LEN as usize] ^= 0xff;
    }
    std::fs::write(dir.join("data.bin"), &on_disk).unwrap();

    let engine = Engine::start(test_conf(&dir, &state_dir)).await.unwrap();
    engine
        .add_torrent(add_params(metainfo.clone(), false))
        .await
        .unwrap();
    let verified = engine.rehash(info_hash).await.unwrap();
    assert_eq!(verified, 3);

    // pausing writes the checkpoint
    engine.pause(info_hash).await.unwrap();
    let status = engine.torrent_status(info_hash).await.unwrap();
    assert_eq!(status.state, TorrentState::Paused);
    assert_eq!(status.verified_piece_count, 3);
    engine.shutdown().await.unwrap();

    // a fresh engine restores the three pieces from the checkpoint, with
    // disk verification and no wire IO (no peers exist)
    let engine = Engine::start(test_conf(&dir, &state_dir)).await.unwrap();
    engine
        .add_torrent(add_params(metainfo, true))
        .await
        .unwrap();
    let mut restored = false;
    for _ in 0..120 {
        let status = engine.torrent_status(info_hash).await.unwrap();
        if status.state == TorrentState::Downloading
            && status.verified_piece_count == 3
        {
            restored = true;
            break;
        }
        delay_for(Duration::from_millis(250)).await;
    }
    assert!(restored, "checkpointed pieces were not restored");
    engine.shutdown().await.unwrap();
}

#[tokio::test(threaded_scheduler)]
async fn test_engine_admin_surface() {
    let dir = test_dir("admin");
    let data = test_data(2 * PIECE_LEN as usize);
    let metainfo = build_metainfo("data.bin", &data, false);
    let info_hash = metainfo.info_hash;

    let engine =
        Engine::start(test_conf(&dir, &dir.join("state"))).await.unwrap();
    engine
        .add_torrent(add_params(metainfo.clone(), false))
        .await
        .unwrap();

    // duplicate info hashes are rejected
    assert!(engine
        .add_torrent(add_params(metainfo.clone(), false))
        .await
        .is_err());

    // rate limits are stored and surfaced
    let limits = RateLimits {
        down_kib: Some(256),
        up_kib: Some(64),
    };
    engine.set_rate_limits(info_hash, limits).await.unwrap();
    let status = engine.torrent_status(info_hash).await.unwrap();
    assert_eq!(status.rate_limits, limits);

    assert_eq!(engine.list().await.len(), 1);

    // removing clears the registry; the same torrent can be added again
    engine.remove(info_hash).await.unwrap();
    assert!(engine.torrent_status(info_hash).await.is_err());
    engine
        .add_torrent(add_params(metainfo, false))
        .await
        .unwrap();

    engine.shutdown().await.unwrap();
}

#[tokio::test(threaded_scheduler)]
async fn test_private_torrent_rejects_dht_and_pex_peers() {
    let dir = test_dir("private");
    let data = test_data(PIECE_LEN as usize);
    let metainfo = build_metainfo("data.bin", &data, true);
    assert!(metainfo.is_private);
    let info_hash = metainfo.info_hash;

    let engine =
        Engine::start(test_conf(&dir, &dir.join("state"))).await.unwrap();
    engine
        .add_torrent(add_params(metainfo, false))
        .await
        .unwrap();

    // feed candidates from forbidden sources; they must never appear as
    // peers (nothing listens on these addresses either way, but the
    // rejection happens before any connection attempt)
    use crabtorrent::{CandidatePeer, PeerSource};
    engine
        .add_peers(
            info_hash,
            vec![
                CandidatePeer::new(
                    "127.0.0.1:1".parse().unwrap(),
                    PeerSource::Dht,
                ),
                CandidatePeer::new(
                    "127.0.0.1:2".parse().unwrap(),
                    PeerSource::Pex,
                ),
            ],
        )
        .await
        .unwrap();
    delay_for(Duration::from_millis(500)).await;
    let status = engine.torrent_status(info_hash).await.unwrap();
    assert_eq!(status.peer_count, 0);

    // removal clears the private set as well: re-adding works
    engine.remove(info_hash).await.unwrap();
    assert!(engine.torrent_status(info_hash).await.is_err());

    engine.shutdown().await.unwrap();
}
