use std::fs;
use std::path::PathBuf;

use reqwest::Client;
use thiserror::Error;
use tracing::info;

use crate::config::CdnSection;

#[derive(Debug, Error)]
pub enum CdnError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("missing api token at {0}")]
    MissingToken(PathBuf),
}

/// Best-effort purge client against the CDN zone API. A purge failure is
/// surfaced but never rolls back pipeline state.
pub struct CdnPurger {
    client: Client,
    config: CdnSection,
}

impl CdnPurger {
    pub fn new(client: Client, config: CdnSection) -> Self {
        Self { client, config }
    }

    pub async fn purge(&self, paths: &[String]) -> Result<(), CdnError> {
        let token = self.load_token()?;
        let url = format!(
            "{}/zones/{}/purge_cache",
            self.config.api_base, self.config.zone_id
        );
        let payload = serde_json::json!({ "files": paths });
        self.client
            .post(url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!(count = paths.len(), "cdn purge requested");
        Ok(())
    }

    fn load_token(&self) -> Result<String, CdnError> {
        let path = PathBuf::from(&self.config.api_token_path);
        let token = fs::read_to_string(&path).map_err(|_| CdnError::MissingToken(path))?;
        Ok(token.trim().to_string())
    }
}
