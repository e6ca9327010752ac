use tracing::{debug, info};

use crate::crawler::fetcher::Fetcher;

/// Normalize a city name for hostname construction: lowercase with German
/// diacritics transliterated (ü→ue, ä→ae, ö→oe, ß→ss).
pub fn normalize_city_name(city: &str) -> String {
    let mut out = String::with_capacity(city.len());
    for c in city.trim().to_lowercase().chars() {
        match c {
            'ü' => out.push_str("ue"),
            'ä' => out.push_str("ae"),
            'ö' => out.push_str("oe"),
            'ß' => out.push_str("ss"),
            _ => out.push(c),
        }
    }
    out
}

/// Candidate seed URLs following conventional municipal/tourism naming
/// patterns for German cities.
pub fn candidate_urls(city: &str) -> Vec<String> {
    let name = normalize_city_name(city);
    vec![
        format!("https://www.{name}.de"),
        format!("https://{name}.de"),
        format!("https://tourismus-{name}.de"),
        format!("https://www.landkreis-{name}.de"),
    ]
}

/// Generate candidate domains for a city and keep the reachable ones.
///
/// Never fails outright: unreachable or error-status candidates are simply
/// excluded and the (possibly empty) remainder returned.
pub async fn discover_domains(fetcher: &Fetcher, city: &str) -> Vec<String> {
    let candidates = candidate_urls(city);
    info!(city, count = candidates.len(), "Probing candidate domains");
    probe_candidates(fetcher, candidates).await
}

/// Probe each candidate with a full fetch and keep those answering with a
/// status below 400.
pub async fn probe_candidates(fetcher: &Fetcher, candidates: Vec<String>) -> Vec<String> {
    let mut seeds = Vec::new();
    for url in candidates {
        match fetcher.fetch_page(&url).await {
            Some(page) if page.status.as_u16() < 400 => {
                info!(%url, "Found valid seed");
                seeds.push(url);
            }
            Some(page) => {
                debug!(%url, status = %page.status, "Candidate rejected");
            }
            None => {
                debug!(%url, "Candidate unreachable");
            }
        }
    }
    seeds
}
