//! The HTTP(S) tracker protocol (BEP 3): announce with the standard query
//! parameters and a compact peer response (BEP 23), plus scraping (BEP 48).

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use url::Url;

use super::{AnnounceParams, AnnounceResponse, ScrapeStats};
use crate::{compact, error::*, Sha1Hash};

/// Announces to an HTTP tracker and parses its bencoded response.
pub(super) async fn announce(
    client: &reqwest::Client,
    url: &Url,
    params: &AnnounceParams,
) -> Result<AnnounceResponse> {
    // The info hash and peer id are raw bytes and must go through percent
    // encoding untouched, so the query string is built by hand rather than
    // with a URL builder that would re-encode them.
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode(&params.info_hash, NON_ALPHANUMERIC),
        percent_encode(&params.peer_id, NON_ALPHANUMERIC),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    if let Some(count) = params.num_want {
        query.push_str(&format!("&numwant={}", count));
    }
    if let Some(event) = params.event.query_value() {
        query.push_str(&format!("&event={}", event));
    }

    let separator = if url.query().is_some() { '&' } else { '?' };
    let request_url = format!("{}{}{}", url, separator, query);

    let response = client.get(&request_url).send().await?;
    let body = response.bytes().await?;
    parse_announce_response(&body)
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let raw: RawAnnounceResponse = serde_bencode::from_bytes(body)?;

    if let Some(reason) = raw.failure_reason {
        return Err(Error::Tracker(reason));
    }

    let mut peers = match raw.peers {
        Some(RawPeers::Compact(buf)) => compact::decode_peers_v4(&buf),
        Some(RawPeers::Dicts(dicts)) => dicts
            .into_iter()
            .filter_map(|peer| {
                format!("{}:{}", peer.ip, peer.port).parse().ok()
            })
            .collect(),
        None => Vec::new(),
    };
    if let Some(peers6) = raw.peers6 {
        peers.extend(compact::decode_peers_v6(&peers6));
    }

    Ok(AnnounceResponse {
        interval: raw
            .interval
            .map(|secs| std::time::Duration::from_secs(secs.max(0) as u64)),
        min_interval: raw
            .min_interval
            .map(|secs| std::time::Duration::from_secs(secs.max(0) as u64)),
        seeder_count: raw.complete.map(|n| n.max(0) as u64),
        leecher_count: raw.incomplete.map(|n| n.max(0) as u64),
        warning: raw.warning_message,
        peers,
    })
}

/// Scrapes swarm statistics for the info hash from the tracker (BEP 48).
/// The scrape URL is derived from the announce URL first; trackers without a
/// derivable scrape URL return [`Error::ScrapeUnsupported`].
pub(super) async fn scrape(
    client: &reqwest::Client,
    announce_url: &Url,
    info_hash: Sha1Hash,
) -> Result<ScrapeStats> {
    let url = super::scrape_url(announce_url)?;
    let separator = if url.query().is_some() { '&' } else { '?' };
    let request_url = format!(
        "{}{}info_hash={}",
        url,
        separator,
        percent_encode(&info_hash, NON_ALPHANUMERIC)
    );

    let response = client.get(&request_url).send().await?;
    let body = response.bytes().await?;
    parse_scrape_response(&body, &info_hash)
}

/// The scrape response maps raw 20 byte info hashes to statistics dicts,
/// which rules out typed deserialization (the keys are not UTF-8), so the
/// response is walked as a bencode value tree.
fn parse_scrape_response(
    body: &[u8],
    info_hash: &Sha1Hash,
) -> Result<ScrapeStats> {
    let root: Value = serde_bencode::from_bytes(body)?;
    let root = match root {
        Value::Dict(dict) => dict,
        _ => return Err(Error::Tracker("scrape response not a dict".into())),
    };

    if let Some(Value::Bytes(reason)) = root.get(&b"failure reason"[..]) {
        return Err(Error::Tracker(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let files = match root.get(&b"files"[..]) {
        Some(Value::Dict(files)) => files,
        _ => return Err(Error::Tracker("scrape response has no files".into())),
    };
    let stats = match files.get(&info_hash[..]) {
        Some(Value::Dict(stats)) => stats,
        _ => {
            return Err(Error::Tracker(
                "tracker does not know this torrent".into(),
            ))
        }
    };

    let int_field = |key: &[u8]| -> u64 {
        match stats.get(key) {
            Some(Value::Int(n)) => (*n).max(0) as u64,
            _ => 0,
        }
    };

    Ok(ScrapeStats {
        seeders: int_field(b"complete"),
        completed: int_field(b"downloaded"),
        leechers: int_field(b"incomplete"),
    })
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    interval: Option<i64>,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    complete: Option<i64>,
    incomplete: Option<i64>,
    peers: Option<RawPeers>,
    peers6: Option<ByteBuf>,
}

/// Trackers send peers either as one compact byte string (BEP 23) or as the
/// original list of dicts (BEP 3).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(ByteBuf),
    Dicts(Vec<RawPeerDict>),
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;
    use pretty_assertions::assert_eq;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0x12; 20],
            peer_id: *b"-CC0101-abcdefghijkl",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Event::Started,
            num_want: Some(50),
        }
    }

    #[test]
    fn test_parse_compact_announce_response() {
        let mut body = b"d8:intervali1800e8:completei5e10:incompletei3e5:peers12:".to_vec();
        body.extend_from_slice(b"\xC0\xA8\x01\x01\x1A\xE1");
        body.extend_from_slice(b"\x0A\x00\x00\x02\x1A\xE2");
        body.extend_from_slice(b"e");

        let response = parse_announce_response(&body).unwrap();
        assert_eq!(
            response.interval,
            Some(std::time::Duration::from_secs(1800))
        );
        assert_eq!(response.seeder_count, Some(5));
        assert_eq!(response.leecher_count, Some(3));
        assert_eq!(
            response.peers,
            vec![
                "192.168.1.1:6881".parse().unwrap(),
                "10.0.0.2:6882".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_dict_model_announce_response() {
        let body = b"d8:intervali60e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason_is_error() {
        let body = b"d14:failure reason12:unregisterede";
        match parse_announce_response(body) {
            Err(Error::Tracker(reason)) => assert_eq!(reason, "unregistered"),
            other => panic!("expected tracker failure, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_scrape_response() {
        let info_hash = [0xab; 20];
        let mut body = b"d5:filesd20:".to_vec();
        body.extend_from_slice(&info_hash);
        body.extend_from_slice(
            b"d8:completei10e10:downloadedi42e10:incompletei7eeee",
        );
        let stats = parse_scrape_response(&body, &info_hash).unwrap();
        assert_eq!(
            stats,
            ScrapeStats {
                seeders: 10,
                completed: 42,
                leechers: 7,
            }
        );
    }

    #[tokio::test]
    async fn test_announce_against_mock_tracker() {
        let mock = mockito::mock("GET", mockito::Matcher::Regex(
            "/announce.*".into(),
        ))
        .match_query(mockito::Matcher::Regex("event=started".into()))
        .with_body({
            let mut body = b"d8:intervali120e5:peers6:".to_vec();
            body.extend_from_slice(b"\xC0\xA8\x01\x01\x1A\xE1");
            body.extend_from_slice(b"e");
            body
        })
        .create();

        let url = Url::parse(&format!("{}/announce", mockito::server_url()))
            .unwrap();
        let client = reqwest::Client::new();
        let response = announce(&client, &url, &params()).await.unwrap();

        mock.assert();
        assert_eq!(
            response.interval,
            Some(std::time::Duration::from_secs(120))
        );
        assert_eq!(response.peers, vec!["192.168.1.1:6881".parse().unwrap()]);
    }
}
