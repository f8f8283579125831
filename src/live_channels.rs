//! Live channel catalogue sync from the public iptv-org API.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::fetch::Fetcher;
use crate::rows::iso;
use crate::store::PostgrestStore;

pub const CHANNELS_URL: &str = "https://iptv-org.github.io/api/channels.json";
pub const STREAMS_URL: &str = "https://iptv-org.github.io/api/streams.json";
pub const LIVE_TABLE: &str = "live_channels";
const ROW_SOURCE: &str = "iptv-org";

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stream {
    pub channel: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub width: Option<u64>,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub bitrate: Option<f64>,
    #[serde(default)]
    pub frame_rate: Option<f64>,
    #[serde(default)]
    pub check_time: Option<String>,
}

impl Stream {
    fn score(&self) -> (u64, f64, f64) {
        (
            self.width.unwrap_or(0).saturating_mul(self.height.unwrap_or(0)),
            self.bitrate.unwrap_or(0.0),
            self.frame_rate.unwrap_or(0.0),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveChannelRow {
    pub channel_id: String,
    pub display_name: String,
    pub country: String,
    pub icon_url: Option<String>,
    pub stream_url: Option<String>,
    pub check_time: String,
    pub source: &'static str,
    pub updated_at: String,
}

/// Keeps entries that deserialize; the feeds are loosely typed.
pub fn decode_lenient<T: for<'de> Deserialize<'de>>(items: Vec<Value>) -> Vec<T> {
    let total = items.len();
    let decoded: Vec<T> = items.into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect();
    if decoded.len() < total {
        debug!("skipped {} malformed entries", total - decoded.len());
    }
    decoded
}

/// Highest `(pixels, bitrate, frame rate)`; the earliest wins ties.
pub fn pick_best_stream<'a>(streams: &[&'a Stream]) -> Option<&'a Stream> {
    let mut best: Option<&Stream> = None;
    for &stream in streams {
        let better = match best {
            None => true,
            Some(current) => stream.score().partial_cmp(&current.score()).is_some_and(|o| o.is_gt()),
        };
        if better {
            best = Some(stream);
        }
    }
    best
}

/// One row per channel of a listed country with at least one online stream.
pub fn build_rows(channels: &[Channel], streams: &[Stream], countries: &[String], now: DateTime<Utc>) -> Vec<LiveChannelRow> {
    let wanted: HashSet<String> = countries.iter().map(|c| c.trim().to_uppercase()).collect();
    let by_id: HashMap<&str, &Channel> = channels.iter().map(|c| (c.id.as_str(), c)).collect();

    // Ordered by channel id so repeated runs write identical batches.
    let mut online: BTreeMap<&str, Vec<&Stream>> = BTreeMap::new();
    for stream in streams.iter().filter(|s| s.status.as_deref() == Some("online")) {
        online.entry(stream.channel.as_str()).or_default().push(stream);
    }

    let now_iso = iso(now);
    online
        .into_iter()
        .filter_map(|(id, candidates)| {
            let channel = by_id.get(id)?;
            let country = channel.country.as_deref().unwrap_or("").to_uppercase();
            if !wanted.contains(&country) {
                return None;
            }
            let best = pick_best_stream(&candidates)?;
            Some(LiveChannelRow {
                channel_id: id.to_string(),
                display_name: channel.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| id.to_string()),
                country,
                icon_url: channel.logo.clone(),
                stream_url: best.url.clone(),
                check_time: best.check_time.clone().unwrap_or_else(|| now_iso.clone()),
                source: ROW_SOURCE,
                updated_at: now_iso.clone(),
            })
        })
        .collect()
}

pub async fn sync(fetcher: &Fetcher, store: &PostgrestStore, countries: &[String], now: DateTime<Utc>) -> Result<usize> {
    info!("fetching iptv-org channels and streams");
    let channels: Vec<Channel> = decode_lenient(fetcher.get_json::<Vec<Value>>(CHANNELS_URL).await?);
    let streams: Vec<Stream> = decode_lenient(fetcher.get_json::<Vec<Value>>(STREAMS_URL).await?);
    info!("{} channels, {} streams", channels.len(), streams.len());

    let rows = build_rows(&channels, &streams, countries, now);
    let mut per_country: BTreeMap<&str, usize> = BTreeMap::new();
    for row in &rows {
        *per_country.entry(row.country.as_str()).or_default() += 1;
    }
    info!("kept per country: {per_country:?}");

    if rows.is_empty() {
        info!("no online streams for {countries:?}; nothing to upsert");
        return Ok(0);
    }
    store.upsert_json(LIVE_TABLE, "channel_id", &rows).await?;
    info!("upserted {} live channels", rows.len());
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn streams() -> Vec<Stream> {
        decode_lenient(vec![
            json!({"channel": "WAPA.pr", "url": "https://a/sd.m3u8", "status": "online", "width": 720, "height": 480}),
            json!({"channel": "WAPA.pr", "url": "https://a/hd.m3u8", "status": "online", "width": 1920, "height": 1080,
                   "check_time": "2024-02-29T10:00:00Z"}),
            json!({"channel": "WAPA.pr", "url": "https://a/hd2.m3u8", "status": "online", "width": 1920, "height": 1080}),
            json!({"channel": "Dead.mx", "url": "https://d/x.m3u8", "status": "offline"}),
            json!({"channel": "TVE.es", "url": "https://t/x.m3u8", "status": "online"}),
            json!({"channel": null, "url": "https://n/x.m3u8", "status": "online"}),
        ])
    }

    fn channels() -> Vec<Channel> {
        decode_lenient(vec![
            json!({"id": "WAPA.pr", "name": "WAPA", "country": "pr", "logo": "https://logo/wapa.png"}),
            json!({"id": "Dead.mx", "name": "Dead", "country": "MX"}),
            json!({"id": "TVE.es", "name": "", "country": "ES"}),
        ])
    }

    #[test]
    fn malformed_stream_entries_are_skipped() {
        assert_eq!(streams().len(), 5);
    }

    #[test]
    fn best_stream_prefers_resolution_then_first() {
        let s = streams();
        let wapa: Vec<&Stream> = s.iter().filter(|s| s.channel == "WAPA.pr").collect();
        assert_eq!(pick_best_stream(&wapa).unwrap().url.as_deref(), Some("https://a/hd.m3u8"));
        assert!(pick_best_stream(&[]).is_none());
    }

    #[test]
    fn rows_cover_online_channels_of_listed_countries() {
        let countries = vec!["PR".to_string(), "es".to_string(), "MX".to_string()];
        let rows = build_rows(&channels(), &streams(), &countries, now());
        assert_eq!(rows.len(), 2);

        let tve = &rows[0];
        assert_eq!(tve.channel_id, "TVE.es");
        assert_eq!(tve.display_name, "TVE.es");
        assert_eq!(tve.check_time, "2024-03-01T12:00:00+00:00");

        let wapa = &rows[1];
        assert_eq!(wapa.country, "PR");
        assert_eq!(wapa.icon_url.as_deref(), Some("https://logo/wapa.png"));
        assert_eq!(wapa.stream_url.as_deref(), Some("https://a/hd.m3u8"));
        assert_eq!(wapa.check_time, "2024-02-29T10:00:00Z");
        assert_eq!(wapa.source, "iptv-org");
    }
}
