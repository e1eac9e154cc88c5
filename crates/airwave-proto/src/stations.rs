//! Station table loading.
//!
//! The table is read once at startup and never mutated afterwards.  Sources
//! are TOML (`[[station]]` tables), m3u playlists, or the built-in list.

use crate::protocol::Station;
use std::collections::HashSet;
use tracing::warn;

/// Stations shipped with the daemon, used when no other source is configured.
pub fn builtin_stations() -> Vec<Station> {
    [
        (
            "Homeboyz Radio",
            "https://atunwadigital.streamguys1.com/homeboyzradio",
        ),
        (
            "Classic 105",
            "https://atunwadigital.streamguys1.com/classic105",
        ),
        ("Capital FM", "https://atunwadigital.streamguys1.com/capitalfm"),
        ("Kiss 100", "https://atunwadigital.streamguys1.com/kiss100fm"),
        ("Ghetto Radio", "https://stream-158.zeno.fm/eghcv7h647zuv"),
        ("Hot 96", "https://hot96-atunwadigital.streamguys1.com/hot96"),
        (
            "Ramogi FM",
            "https://ramogifm-atunwadigital.streamguys1.com/ramogifm",
        ),
    ]
    .into_iter()
    .map(|(name, url)| Station::new(name, url))
    .collect()
}

/// Drop entries without a URL and any repeated URL (the URL is the identity).
pub fn dedup_by_url(stations: Vec<Station>) -> Vec<Station> {
    let mut seen = HashSet::new();
    stations
        .into_iter()
        .filter(|s| {
            if s.url.trim().is_empty() {
                warn!("Skipping station '{}' without a URL", s.name);
                return false;
            }
            if !seen.insert(s.url.clone()) {
                warn!("Skipping duplicate station URL {}", s.url);
                return false;
            }
            true
        })
        .collect()
}

pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());

        stations.push(Station { name, url });
    }

    Ok(dedup_by_url(stations))
}

pub fn load_stations_from_m3u(path: &std::path::Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// We keep this separate from `Station` so the TOML schema can diverge from
/// the wire protocol struct without breaking either.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    name: String,
    url: String,
}

pub fn load_stations_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .map(|s| Station {
            name: s.name.trim().to_string(),
            url: s.url.trim().to_string(),
        })
        .collect();
    Ok(dedup_by_url(stations))
}
