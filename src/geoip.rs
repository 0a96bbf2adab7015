//! IP → country location for GeoDNS answer selection
//!
//! Backed by a MaxMind-style city database loaded once at startup. Lookups
//! are memoized per IP literal; the observed client address space is small
//! enough that the memo map is left unbounded.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use maxminddb::Reader;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct CityRecord {
    country: Option<Country>,
    continent: Option<Continent>,
}

#[derive(Deserialize)]
struct Country {
    iso_code: Option<String>,
}

#[derive(Deserialize)]
struct Continent {
    code: Option<String>,
}

/// Country anchor for a continent, used when the database knows the
/// continent but not the country.
fn continent_anchor(continent: &str) -> Option<&'static str> {
    match continent {
        "eu" => Some("de"),
        "na" => Some("us"),
        "sa" => Some("br"),
        "as" => Some("sg"),
        "oc" => Some("au"),
        "af" => Some("za"),
        _ => None,
    }
}

/// Reduce a database result to a location key: country code when known,
/// continent anchor otherwise, `"default"` when neither maps.
fn resolve_location(country: Option<&str>, continent: Option<&str>) -> String {
    if let Some(code) = country.filter(|c| !c.is_empty()) {
        return code.to_ascii_lowercase();
    }
    if let Some(anchor) = continent
        .map(|c| c.to_ascii_lowercase())
        .as_deref()
        .and_then(continent_anchor)
    {
        return anchor.to_string();
    }
    "default".to_string()
}

/// Memoized IP-to-country locator.
pub struct GeoLocator {
    reader: Reader<Vec<u8>>,
    cache: RwLock<HashMap<String, String>>,
}

impl GeoLocator {
    /// Open the database at `path`. A missing or unreadable database is not
    /// fatal to the agent; the caller runs without a locator and treats all
    /// clients as `"default"`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, maxminddb::MaxMindDBError> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Lowercase ISO 3166-1 alpha-2 country code for `ip_literal`, or
    /// `"default"` when the address does not parse or has no mapping.
    pub fn locate(&self, ip_literal: &str) -> String {
        if let Some(hit) = self.cache.read().get(ip_literal) {
            return hit.clone();
        }

        let location = self.lookup(ip_literal);
        self.cache
            .write()
            .insert(ip_literal.to_string(), location.clone());
        location
    }

    fn lookup(&self, ip_literal: &str) -> String {
        let ip: IpAddr = match ip_literal.parse() {
            Ok(ip) => ip,
            Err(_) => return "default".to_string(),
        };

        let record: CityRecord = match self.reader.lookup(ip) {
            Ok(r) => r,
            Err(_) => return "default".to_string(),
        };

        let location = resolve_location(
            record.country.as_ref().and_then(|c| c.iso_code.as_deref()),
            record.continent.as_ref().and_then(|c| c.code.as_deref()),
        );
        debug!(ip = ip_literal, location, "geo lookup");
        location
    }
}
