//! Tracker based peer discovery: the announce/scrape data model, the tiered
//! tracker list of a torrent (BEP 12), and dispatch to the HTTP (BEP 3) and
//! UDP (BEP 15) clients.

pub(crate) mod http;
pub(crate) mod udp;

use std::{net::SocketAddr, time::Duration};

use url::Url;

use crate::{error::*, PeerId, Sha1Hash};

/// The event reported with an announce (BEP 3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// A regular periodic announce.
    None,
    /// The first announce of a session.
    Started,
    /// Sent best effort when the torrent is stopped.
    Stopped,
    /// Sent exactly once, when the download completes.
    Completed,
}

impl Event {
    /// The query parameter value; regular announces omit the parameter.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Started => Some("started"),
            Self::Stopped => Some("stopped"),
            Self::Completed => Some("completed"),
        }
    }

    /// The numeric code of the UDP announce packet (BEP 15).
    pub fn udp_code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Everything a tracker needs to know about us in an announce.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which we accept peer connections.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    /// How many peers we would like; trackers default to ~50 when omitted.
    pub num_want: Option<u32>,
}

/// A tracker's answer to an announce.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnnounceResponse {
    /// How long to wait until the next regular announce.
    pub interval: Option<Duration>,
    /// The lower bound for announce frequency, if the tracker reports one.
    pub min_interval: Option<Duration>,
    pub seeder_count: Option<u64>,
    pub leecher_count: Option<u64>,
    /// A non-fatal message from the tracker.
    pub warning: Option<String>,
    pub peers: Vec<SocketAddr>,
}

/// Per info hash swarm statistics from a scrape (BEP 48).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ScrapeStats {
    pub seeders: u64,
    /// How many downloads of the torrent have completed.
    pub completed: u64,
    pub leechers: u64,
}

/// Derives a tracker's scrape URL from its announce URL: if the last path
/// segment begins with `announce`, that prefix is substituted with `scrape`;
/// otherwise scraping is unsupported for the tracker.
pub(crate) fn scrape_url(announce: &Url) -> Result<Url> {
    let path = announce.path();
    let (dir, segment) = match path.rfind('/') {
        Some(pos) => path.split_at(pos + 1),
        None => return Err(Error::ScrapeUnsupported),
    };
    if !segment.starts_with("announce") {
        return Err(Error::ScrapeUnsupported);
    }
    let scrape_path =
        format!("{}scrape{}", dir, &segment["announce".len()..]);
    let mut url = announce.clone();
    url.set_path(&scrape_path);
    Ok(url)
}

/// Dispatches announces and scrapes to the right protocol client by URL
/// scheme. The HTTP client and the (single, shared) UDP tracker client are
/// both owned by the engine and cheap to clone.
#[derive(Clone)]
pub(crate) struct TrackerClient {
    pub http: reqwest::Client,
    pub udp: udp::UdpTrackerClient,
}

impl TrackerClient {
    pub async fn announce(
        &self,
        url: &Url,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        match url.scheme() {
            "http" | "https" => http::announce(&self.http, url, params).await,
            "udp" => self.udp.announce(url, params).await,
            _ => Err(Error::Tracker(format!(
                "unsupported tracker scheme: {}",
                url.scheme()
            ))),
        }
    }

    pub async fn scrape(
        &self,
        url: &Url,
        info_hash: Sha1Hash,
    ) -> Result<ScrapeStats> {
        match url.scheme() {
            "http" | "https" => {
                http::scrape(&self.http, url, info_hash).await
            }
            "udp" => self.udp.scrape(url, info_hash).await,
            _ => Err(Error::Tracker(format!(
                "unsupported tracker scheme: {}",
                url.scheme()
            ))),
        }
    }
}

/// One tracker within a tier, with failure bookkeeping.
#[derive(Clone, Debug)]
struct TrackerEntry {
    url: Url,
    failures: usize,
}

/// The tiered announce list of one torrent (BEP 12).
///
/// Tiers are processed in order; within a tier, trackers are tried in their
/// current order and the first tracker to answer is promoted to the tier's
/// front so it is preferred on subsequent announces.
#[derive(Clone, Debug, Default)]
pub(crate) struct TrackerList {
    tiers: Vec<Vec<TrackerEntry>>,
}

impl TrackerList {
    pub fn new(tiers: Vec<Vec<Url>>) -> Self {
        Self {
            tiers: tiers
                .into_iter()
                .map(|tier| {
                    tier.into_iter()
                        .map(|url| TrackerEntry { url, failures: 0 })
                        .collect()
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|tier| tier.is_empty())
    }

    /// The flat announce URL list, in tier order, for checkpointing.
    pub fn urls(&self) -> Vec<String> {
        self.tiers
            .iter()
            .flat_map(|tier| tier.iter().map(|entry| entry.url.to_string()))
            .collect()
    }

    /// Announces to the trackers in tier order, stopping at the first tier
    /// that yields a response (BEP 12). Returns the last error if every
    /// tracker fails.
    pub async fn announce(
        &mut self,
        client: &TrackerClient,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        let mut last_error = Error::Tracker("no trackers".into());
        for tier in self.tiers.iter_mut() {
            for pos in 0..tier.len() {
                let url = tier[pos].url.clone();
                log::debug!("Announcing to tracker {}", url);
                match client.announce(&url, params).await {
                    Ok(response) => {
                        tier[pos].failures = 0;
                        // the responding tracker is preferred from now on
                        let winner = tier.remove(pos);
                        tier.insert(0, winner);
                        return Ok(response);
                    }
                    Err(e) => {
                        log::warn!("Tracker {} announce failed: {}", url, e);
                        tier[pos].failures += 1;
                        last_error = e;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Scrapes the first tracker (in tier order) that supports scraping and
    /// answers.
    pub async fn scrape(
        &mut self,
        client: &TrackerClient,
        info_hash: Sha1Hash,
    ) -> Result<ScrapeStats> {
        let mut last_error = Error::ScrapeUnsupported;
        for tier in self.tiers.iter_mut() {
            for entry in tier.iter_mut() {
                match client.scrape(&entry.url, info_hash).await {
                    Ok(stats) => return Ok(stats),
                    Err(e) => {
                        log::debug!(
                            "Tracker {} scrape failed: {}",
                            entry.url,
                            e
                        );
                        last_error = e;
                    }
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_url_derivation() {
        let announce = Url::parse("http://t.test/announce").unwrap();
        assert_eq!(
            scrape_url(&announce).unwrap().as_str(),
            "http://t.test/scrape"
        );

        // the announce prefix keeps its suffix
        let announce =
            Url::parse("http://t.test/announce.php?key=abc").unwrap();
        assert_eq!(
            scrape_url(&announce).unwrap().as_str(),
            "http://t.test/scrape.php?key=abc"
        );

        // nested paths are preserved
        let announce = Url::parse("http://t.test/tr/announce").unwrap();
        assert_eq!(
            scrape_url(&announce).unwrap().as_str(),
            "http://t.test/tr/scrape"
        );

        // anything else is unsupported
        let announce = Url::parse("http://t.test/ann").unwrap();
        assert!(matches!(
            scrape_url(&announce),
            Err(Error::ScrapeUnsupported)
        ));
    }

    #[test]
    fn test_event_codes() {
        assert_eq!(Event::None.query_value(), None);
        assert_eq!(Event::Started.query_value(), Some("started"));
        assert_eq!(Event::Completed.udp_code(), 1);
        assert_eq!(Event::Started.udp_code(), 2);
        assert_eq!(Event::Stopped.udp_code(), 3);
    }
}
