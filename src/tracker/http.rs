use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use tracing::trace;

use super::error::TrackerError;
use super::response::{AnnounceRequest, AnnounceResponse, ScrapeResponse};
use crate::constants::{HTTP_TRACKER_TIMEOUT, USER_AGENT};
use crate::metainfo::InfoHash;

/// Unreserved characters (RFC 3986) pass through; everything else is escaped.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .timeout(HTTP_TRACKER_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(TrackerError::Http)?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The announce URL for `request`, with binary fields percent-encoded.
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            query_separator(&self.url),
            url_encode(request.info_hash.as_bytes()),
            url_encode(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );

        let event = request.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }
        if let Some(numwant) = request.numwant {
            url.push_str(&format!("&numwant={numwant}"));
        }
        url
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let url = self.announce_url(request);
        trace!(url = %self.url, event = request.event.as_str(), "announcing");
        let body = self.get(&url).await?;
        AnnounceResponse::from_bencode(&body)
    }

    /// Scrapes swarm statistics for `info_hashes`.
    ///
    /// Fails with [`TrackerError::InvalidUrl`] when the announce URL has no
    /// scrape counterpart.
    pub async fn scrape(&self, info_hashes: &[InfoHash]) -> Result<ScrapeResponse, TrackerError> {
        let base = scrape_url(&self.url).ok_or_else(|| TrackerError::InvalidUrl(self.url.clone()))?;
        let mut url = base.clone();
        for (i, info_hash) in info_hashes.iter().enumerate() {
            url.push_str(if i == 0 { query_separator(&base) } else { "&" });
            url.push_str("info_hash=");
            url.push_str(&url_encode(info_hash.as_bytes()));
        }
        let body = self.get(&url).await?;
        ScrapeResponse::from_bencode(&body)
    }

    async fn get(&self, url: &str) -> Result<bytes::Bytes, TrackerError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        // Trackers often report failures with an error status and a bencoded body.
        if !status.is_success() && body.first() != Some(&b'd') {
            return Err(TrackerError::Status(status.as_u16()));
        }
        Ok(body)
    }
}

/// Derives the scrape URL: the last path segment must start with `announce`,
/// which is replaced by `scrape`.
pub fn scrape_url(announce: &str) -> Option<String> {
    let (path, query) = match announce.find('?') {
        Some(i) => announce.split_at(i),
        None => (announce, ""),
    };
    let slash = path.rfind('/')?;
    let segment = &path[slash + 1..];
    let rest = segment.strip_prefix("announce")?;
    Some(format!("{}scrape{}{}", &path[..=slash], rest, query))
}

fn query_separator(url: &str) -> &'static str {
    if url.contains('?') { "&" } else { "?" }
}

pub(crate) fn url_encode(bytes: &[u8]) -> String {
    percent_encode(bytes, QUERY_VALUE).to_string()
}
