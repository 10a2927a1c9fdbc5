//! Site registry: the TOML file operators edit to add, move or retire sites.
//!
//! ```toml
//! [[sites]]
//! id = "lauterbrunnen-n"
//! name = "Lauterbrunnen north wall"
//! latitude = 46.5935
//! longitude = 7.9091
//! elevation_m = 1210.0
//! emails = ["geo-duty@example.org"]
//! phones = ["+41791234567"]
//! ```
//!
//! The file is the source of truth for site metadata; seeding upserts every
//! entry into storage, so retiring a site means setting `is_active = false`
//! rather than deleting it (its history stays queryable).

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, StorageError};
use crate::logging::Source;
use crate::model::{Contacts, Location, Site};
use crate::storage::Storage;

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sites: Vec<SiteEntry>,
}

#[derive(Debug, Deserialize)]
struct SiteEntry {
    id: String,
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    elevation_m: Option<f64>,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    emails: Vec<String>,
    #[serde(default)]
    phones: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl From<SiteEntry> for Site {
    fn from(entry: SiteEntry) -> Self {
        Site {
            id: entry.id,
            name: entry.name,
            location: Location {
                latitude: entry.latitude,
                longitude: entry.longitude,
                elevation_m: entry.elevation_m,
            },
            is_active: entry.is_active,
            contacts: Contacts {
                emails: entry.emails,
                phones: entry.phones,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parses and validates a registry document.
pub fn parse_sites(contents: &str) -> Result<Vec<Site>, ConfigError> {
    let file: RegistryFile = toml::from_str(contents)?;
    let sites: Vec<Site> = file.sites.into_iter().map(Site::from).collect();
    validate_sites(&sites)?;
    Ok(sites)
}

pub fn load_sites(path: impl AsRef<Path>) -> Result<Vec<Site>, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_sites(&contents)
}

/// Ids must be non-blank and unique; coordinates must be real WGS84.
pub fn validate_sites(sites: &[Site]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for site in sites {
        if site.id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("site '{}' has a blank id", site.name)));
        }
        if !seen.insert(site.id.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate site id '{}'", site.id)));
        }
        let Location { latitude, longitude, .. } = site.location;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ConfigError::Invalid(format!(
                "site '{}' has out-of-range coordinates ({}, {})",
                site.id, latitude, longitude
            )));
        }
        if site.is_active && site.contacts.is_empty() {
            // Allowed, but every alert for it will end in ERROR.
            tracing::warn!(source = %Source::Storage, site_id = %site.id, "active site has no contacts");
        }
    }
    Ok(())
}

/// Upserts every site into storage. Returns how many were written.
pub fn seed_sites(storage: &dyn Storage, sites: &[Site]) -> Result<usize, StorageError> {
    for site in sites {
        storage.upsert_site(site)?;
    }
    tracing::info!(source = %Source::Storage, count = sites.len(), "site registry seeded");
    Ok(sites.len())
}
