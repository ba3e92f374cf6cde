//! Discovery of planet files and the mirrors hosting them.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;

use crate::result::*;

/// The canonical planet server.
pub const PRIMARY_URL: &str = "https://planet.openstreetmap.org/pbf/";

/// All known mirrors hosting planet files.
pub const ALL_MIRRORS: &[&str] = &[
    "https://ftp.spline.de/pub/openstreetmap/pbf/",
    "https://ftp5.gwdg.de/pub/misc/openstreetmap/planet.openstreetmap.org/pbf/",
    "https://ftp.fau.de/osm-planet/pbf/",
    "https://free.nchc.org.tw/osm.planet/pbf/",
    "https://ftpmirror.your.org/pub/openstreetmap/pbf/",
    "https://download.bbbike.org/osm/planet/",
    "https://ftp.nluug.nl/maps/planet.openstreetmap.org/pbf/",
    "https://ftp.osuosl.org/pub/openstreetmap/pbf/",
    "https://planet.passportcontrol.net/pbf/",
    "https://planet.osm-hr.org/pbf/",
];

/// Mirrors that don't answer a HEAD within this window are dropped.
const MIRROR_TIMEOUT: Duration = Duration::from_secs(15);

/// Reports whether `name` is a well-formed planet file name: the literal
/// `planet-latest.osm.pbf`, or `planet-` followed by exactly six decimal
/// digits (conventionally YYMMDD) and `.osm.pbf`.
pub fn valid_base_name(name: &str) -> bool {
    if name == "planet-latest.osm.pbf" {
        return true;
    }
    let Some(date) = name
        .strip_prefix("planet-")
        .and_then(|rest| rest.strip_suffix(".osm.pbf"))
    else {
        return false;
    };
    date.len() == 6 && date.bytes().all(|b| b.is_ascii_digit())
}

/// Returns the dated planet file names listed on the primary server,
/// newest first.
pub fn latest() -> PlanetResult<Vec<String>> {
    latest_from(PRIMARY_URL)
}

/// Like [`latest`], but scraping an explicit index page URL.
pub fn latest_from(base: &str) -> PlanetResult<Vec<String>> {
    let response = Client::new().get(base).send()?;
    if response.status().as_u16() != 200 {
        return Err(PlanetError::HttpStatus(response.status().as_u16()));
    }
    let body = response.text()?;
    let mut names = collect_names(&body);
    if names.is_empty() {
        return Err(PlanetError::NoNames);
    }
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names)
}

/// Pulls planet file names out of an index page's anchor tags.
fn collect_names(body: &str) -> Vec<String> {
    let mut names = Vec::new();
    for anchor in body.split("<a ").skip(1) {
        let Some(href) = anchor
            .split("href=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
        else {
            continue;
        };
        let name = href.rsplit('/').next().unwrap_or(href);
        if valid_base_name(name) && name != "planet-latest.osm.pbf" {
            names.push(name.to_owned());
        }
    }
    names
}

/// Returns the mirrors currently hosting `name`, in lexicographic order.
pub fn mirrors(name: &str) -> PlanetResult<Vec<String>> {
    mirrors_from(name, ALL_MIRRORS)
}

/// Like [`mirrors`], but probing an explicit candidate list. Every
/// candidate is HEADed on its own thread; the ones answering 200 are
/// merged and sorted.
pub fn mirrors_from(name: &str, candidates: &[&str]) -> PlanetResult<Vec<String>> {
    let client = Client::builder().timeout(MIRROR_TIMEOUT).build()?;
    let found = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for &mirror in candidates {
            let client = &client;
            let found = &found;
            scope.spawn(move || {
                let url = format!("{mirror}{name}");
                match client.head(&url).send() {
                    Ok(response) if response.status().as_u16() == 200 => {
                        found.lock().unwrap().push(mirror.to_owned());
                    }
                    Ok(response) => debug!("mirror {mirror}: status {}", response.status()),
                    Err(err) => debug!("mirror {mirror}: {err}"),
                }
            });
        }
    });
    let mut found = found.into_inner().unwrap();
    if found.is_empty() {
        return Err(PlanetError::NoMirrors);
    }
    found.sort_unstable();
    Ok(found)
}
