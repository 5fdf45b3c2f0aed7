use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::engine::error::LookupError;
use crate::engine::media::{CUSTOM_TYPE, Media, MediaMeta};
use crate::engine::services::MetadataResolver;

/// Title given to custom embeds until the member supplies one.
const CUSTOM_TITLE: &str = "Custom Media";

/// One entry of the lookup service's answer.
#[derive(Debug, Deserialize)]
struct ResolvedMedia {
    id: String,
    title: String,
    #[serde(default)]
    seconds: u64,
    #[serde(rename = "type")]
    media_type: String,
    #[serde(default)]
    restricted: Option<String>,
}

impl From<ResolvedMedia> for Media {
    fn from(r: ResolvedMedia) -> Self {
        let mut media = Media::new(&r.id, &r.title, r.seconds, &r.media_type);
        media.meta = MediaMeta {
            restricted: r.restricted.filter(|s| !s.is_empty()),
        };
        media
    }
}

/// [`MetadataResolver`] backed by an HTTP lookup service answering
/// `GET {base}/lookup?id=..&type=..` with a JSON array of media.
///
/// Without a base URL every id resolves to an untimed placeholder titled
/// after the id, which is enough to run the server standalone.
pub struct HttpMetadataResolver {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpMetadataResolver {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent("Marquee")
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, id: &str, media_type: &str) -> Result<Vec<Media>, LookupError> {
        if media_type == CUSTOM_TYPE {
            return Ok(vec![Media::new(id, CUSTOM_TITLE, 0, CUSTOM_TYPE)]);
        }
        let Some(base) = &self.base_url else {
            return Ok(vec![Media::new(id, id, 0, media_type)]);
        };

        let resp = self
            .client
            .get(format!("{base}/lookup"))
            .query(&[("id", id), ("type", media_type)])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| LookupError::Resolver(format!("Lookup service unreachable: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(LookupError::Resolver(format!(
                "Lookup service returned {}",
                resp.status()
            )));
        }

        let found: Vec<ResolvedMedia> = resp
            .json()
            .await
            .map_err(|e| LookupError::Resolver(format!("Malformed lookup response: {e}")))?;
        debug!(id, media_type, count = found.len(), "media resolved");
        if found.is_empty() {
            return Err(LookupError::NotFound);
        }
        Ok(found.into_iter().map(Media::from).collect())
    }
}
