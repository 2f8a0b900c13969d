//! Remote dataset catalog: lists the object URLs of a collection.

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::remote::build_client;
use crate::util::{Error, Result};

/// Source of object URLs for a collection of dataset files.
pub trait Catalog {
    /// URLs of every dataset object in a collection.
    fn object_urls(&self, collection_id: &str) -> Result<Vec<String>>;
}

/// One file of a dandiset.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Deserialize)]
struct AssetPage {
    #[serde(default)]
    next: Option<String>,
    results: Vec<Asset>,
}

/// Blocking client for the DANDI Archive REST API.
pub struct DandiCatalog {
    client: Client,
    api_url: String,
    lindi_url: String,
    version: String,
    use_lindi: bool,
}

impl DandiCatalog {
    /// Client using the API and LINDI endpoints of `config`.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client: build_client(config.timeout(), &config.user_agent)?,
            api_url: config.dandi_api_url.trim_end_matches('/').to_string(),
            lindi_url: config.lindi_base_url.trim_end_matches('/').to_string(),
            version: "draft".to_string(),
            use_lindi: false,
        })
    }

    /// List a specific published version instead of `draft`.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Make [`Catalog::object_urls`] return reference descriptors.
    pub fn with_lindi(mut self, use_lindi: bool) -> Self {
        self.use_lindi = use_lindi;
        self
    }

    /// First page of the asset listing.
    pub fn assets_url(&self, dandiset: &str) -> String {
        format!(
            "{}/dandisets/{}/versions/{}/assets/?page_size=100",
            self.api_url, dandiset, self.version
        )
    }

    /// Every asset of a dandiset, following pagination.
    pub fn assets(&self, dandiset: &str) -> Result<Vec<Asset>> {
        let mut assets = Vec::new();
        let mut next = Some(self.assets_url(dandiset));
        while let Some(url) = next {
            debug!("GET {url}");
            let response = self
                .client
                .get(&url)
                .send()
                .map_err(|e| Error::fetch(&url, e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::fetch(&url, format!("HTTP {status}")));
            }
            let page: AssetPage = response
                .json()
                .map_err(|e| Error::fetch(&url, format!("invalid asset page: {e}")))?;
            assets.extend(page.results);
            next = page.next;
        }
        Ok(assets)
    }

    /// Direct download URL of an asset.
    pub fn download_url(&self, asset: &Asset) -> String {
        format!("{}/assets/{}/download/", self.api_url, asset.asset_id)
    }

    /// Reference descriptor URL of an asset.
    pub fn lindi_url(&self, dandiset: &str, asset: &Asset) -> String {
        format!(
            "{}/dandi/dandisets/{}/assets/{}/nwb.lindi.json",
            self.lindi_url, dandiset, asset.asset_id
        )
    }
}

impl Catalog for DandiCatalog {
    fn object_urls(&self, collection_id: &str) -> Result<Vec<String>> {
        Ok(self
            .assets(collection_id)?
            .iter()
            .filter(|a| a.path.ends_with(".nwb"))
            .map(|a| {
                if self.use_lindi {
                    self.lindi_url(collection_id, a)
                } else {
                    self.download_url(a)
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DandiCatalog {
        let config = Config {
            dandi_api_url: "https://api.example.org/api/".into(),
            lindi_base_url: "https://lindi.example.org".into(),
            ..Config::default()
        };
        DandiCatalog::new(&config).unwrap()
    }

    fn asset() -> Asset {
        Asset {
            asset_id: "65a7e913-45c7-48db-bf19-b9f5e910110a".into(),
            path: "sub-01/sub-01_ses-1.nwb".into(),
            size: 1024,
        }
    }

    #[test]
    fn test_urls() {
        let c = catalog().with_version("0.230302.1629");
        assert_eq!(
            c.assets_url("000409"),
            "https://api.example.org/api/dandisets/000409/versions/0.230302.1629/assets/?page_size=100"
        );
        assert_eq!(
            c.download_url(&asset()),
            "https://api.example.org/api/assets/65a7e913-45c7-48db-bf19-b9f5e910110a/download/"
        );
        assert_eq!(
            c.lindi_url("000409", &asset()),
            "https://lindi.example.org/dandi/dandisets/000409/assets/65a7e913-45c7-48db-bf19-b9f5e910110a/nwb.lindi.json"
        );
    }

    #[test]
    fn test_page_parsing() {
        let page: AssetPage = serde_json::from_str(
            r#"{"count": 1, "next": null, "results": [
                {"asset_id": "a1", "path": "sub-01.nwb", "size": 10, "blob": "x"}
            ]}"#,
        )
        .unwrap();
        assert!(page.next.is_none());
        assert_eq!(page.results[0].asset_id, "a1");
    }

    #[test]
    fn test_unreachable_api() {
        let config = Config {
            dandi_api_url: "http://127.0.0.1:1/api".into(),
            timeout_secs: 5,
            ..Config::default()
        };
        let err = DandiCatalog::new(&config).unwrap().object_urls("000409").unwrap_err();
        assert!(err.is_remote());
    }
}
