use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::domain::{ProviderId, ProviderInfo};
use crate::error::MobilityError;

pub const DEFAULT_BASE_URL: &str = "https://api.mobilitydatabase.org/v1";

/// Resolves providers to dataset download locations and fetches archives.
///
/// Implemented by the remote Mobility Database client and by the static CSV
/// catalog fallback.
pub trait CatalogClient: Send + Sync {
    fn providers_by_country(&self, country_code: &str)
    -> Result<Vec<ProviderInfo>, MobilityError>;
    fn providers_by_name(&self, name: &str) -> Result<Vec<ProviderInfo>, MobilityError>;
    fn provider_info(&self, provider_id: &ProviderId) -> Result<ProviderInfo, MobilityError>;

    /// Fetch a dataset archive to `destination`. `authenticated` selects
    /// whether the bearer token is attached; direct producer URLs must be
    /// fetched without it.
    fn download_to_file(
        &self,
        url: &str,
        authenticated: bool,
        destination: &Path,
    ) -> Result<(), MobilityError>;
}

impl<T: CatalogClient + ?Sized> CatalogClient for Box<T> {
    fn providers_by_country(
        &self,
        country_code: &str,
    ) -> Result<Vec<ProviderInfo>, MobilityError> {
        (**self).providers_by_country(country_code)
    }

    fn providers_by_name(&self, name: &str) -> Result<Vec<ProviderInfo>, MobilityError> {
        (**self).providers_by_name(name)
    }

    fn provider_info(&self, provider_id: &ProviderId) -> Result<ProviderInfo, MobilityError> {
        (**self).provider_info(provider_id)
    }

    fn download_to_file(
        &self,
        url: &str,
        authenticated: bool,
        destination: &Path,
    ) -> Result<(), MobilityError> {
        (**self).download_to_file(url, authenticated, destination)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// HTTP client for the Mobility Database API with refresh-token auth.
///
/// The access token is fetched lazily from `POST /tokens` and cached; a 401
/// clears the cache so the next request re-authenticates.
pub struct MobilityCatalogClient {
    client: Client,
    base_url: String,
    refresh_token: String,
    access_token: Mutex<Option<String>>,
}

impl MobilityCatalogClient {
    pub fn new(refresh_token: Option<String>) -> Result<Self, MobilityError> {
        Self::with_base_url(refresh_token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        refresh_token: Option<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, MobilityError> {
        let refresh_token = refresh_token
            .or_else(|| std::env::var("MOBILITY_API_REFRESH_TOKEN").ok())
            .filter(|token| !token.trim().is_empty())
            .ok_or(MobilityError::MissingToken)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("mobility-db/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MobilityError::CatalogHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| MobilityError::CatalogHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            refresh_token,
            access_token: Mutex::new(None),
        })
    }

    fn access_token(&self) -> Result<String, MobilityError> {
        let mut cached = self
            .access_token
            .lock()
            .map_err(|_| MobilityError::TokenRefresh("token cache poisoned".to_string()))?;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = format!("{}/tokens", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "refresh_token": self.refresh_token }))
            .send()
            .map_err(|err| MobilityError::TokenRefresh(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MobilityError::TokenRefresh(format!(
                "status {}",
                response.status().as_u16()
            )));
        }
        let body: TokenResponse = response
            .json()
            .map_err(|err| MobilityError::TokenRefresh(err.to_string()))?;
        let token = body
            .access_token
            .ok_or_else(|| MobilityError::TokenRefresh("no access_token in response".to_string()))?;
        debug!("refreshed catalog access token");
        *cached = Some(token.clone());
        Ok(token)
    }

    fn invalidate_token(&self) {
        if let Ok(mut cached) = self.access_token.lock() {
            *cached = None;
        }
    }

    fn send_authed(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::blocking::Response, MobilityError> {
        let token = self.access_token()?;
        self.client
            .get(url)
            .query(query)
            .bearer_auth(&token)
            .send()
            .map_err(|err| MobilityError::CatalogHttp(err.to_string()))
    }

    /// GET with bearer auth, retrying once with a fresh token on 401.
    fn get_authed(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::blocking::Response, MobilityError> {
        let mut response = self.send_authed(url, query)?;
        if response.status().as_u16() == 401 {
            self.invalidate_token();
            response = self.send_authed(url, query)?;
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(MobilityError::CatalogStatus { status, message });
        }
        Ok(response)
    }

    fn send_download(
        &self,
        url: &str,
        authenticated: bool,
    ) -> Result<reqwest::blocking::Response, MobilityError> {
        let mut request = self.client.get(url);
        if authenticated {
            request = request.bearer_auth(self.access_token()?);
        }
        request
            .send()
            .map_err(|err| MobilityError::Download(err.to_string()))
    }

    fn fetch_providers(
        &self,
        query: &[(&str, &str)],
    ) -> Result<Vec<ProviderInfo>, MobilityError> {
        let url = format!("{}/gtfs_feeds", self.base_url);
        let response = self.get_authed(&url, query)?;
        response
            .json()
            .map_err(|err| MobilityError::CatalogHttp(err.to_string()))
    }
}

impl CatalogClient for MobilityCatalogClient {
    fn providers_by_country(
        &self,
        country_code: &str,
    ) -> Result<Vec<ProviderInfo>, MobilityError> {
        let code = country_code.to_uppercase();
        self.fetch_providers(&[("country_code", code.as_str())])
    }

    fn providers_by_name(&self, name: &str) -> Result<Vec<ProviderInfo>, MobilityError> {
        self.fetch_providers(&[("provider", name)])
    }

    fn provider_info(&self, provider_id: &ProviderId) -> Result<ProviderInfo, MobilityError> {
        let url = format!("{}/gtfs_feeds/{}", self.base_url, provider_id);
        let response = self.get_authed(&url, &[])?;
        response
            .json()
            .map_err(|err| MobilityError::CatalogHttp(err.to_string()))
    }

    fn download_to_file(
        &self,
        url: &str,
        authenticated: bool,
        destination: &Path,
    ) -> Result<(), MobilityError> {
        let mut response = self.send_download(url, authenticated)?;
        // Same expired-token recovery as get_authed.
        if authenticated && response.status().as_u16() == 401 {
            self.invalidate_token();
            response = self.send_download(url, authenticated)?;
        }
        if !response.status().is_success() {
            return Err(MobilityError::Download(format!(
                "status {} fetching {url}",
                response.status().as_u16()
            )));
        }
        let mut file = File::create(destination)
            .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| MobilityError::Download(err.to_string()))?;
        Ok(())
    }
}
