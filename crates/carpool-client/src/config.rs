use carpool_sync::{SyncError, SyncResult};

/// Connection settings for a hosted backend project.
#[derive(Clone)]
pub struct ClientConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub anon_key: String,
    /// Signed-in user's token. Requests fall back to the anon key without one.
    pub access_token: Option<String>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, access_token: Option<String>) -> Self {
        self.access_token = access_token.filter(|t| !t.is_empty());
        self
    }

    /// Read `SUPABASE_URL`, `SUPABASE_ANON_KEY` and `CARPOOL_ACCESS_TOKEN`.
    pub fn from_env() -> SyncResult<Self> {
        let url = std::env::var("SUPABASE_URL").map_err(|_| SyncError::MissingField("SUPABASE_URL"))?;
        let anon_key =
            std::env::var("SUPABASE_ANON_KEY").map_err(|_| SyncError::MissingField("SUPABASE_ANON_KEY"))?;
        let access_token = std::env::var("CARPOOL_ACCESS_TOKEN").ok();
        Ok(Self::new(url, anon_key).with_access_token(access_token))
    }

    /// Token sent as `Authorization: Bearer`.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }

    /// REST endpoint for a table, view or `rpc/<name>` path.
    pub fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.url, path)
    }

    /// Websocket endpoint of the Realtime service.
    pub fn realtime_url(&self) -> String {
        let base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("wss://{}", self.url)
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            base,
            urlencoding::encode(&self.anon_key)
        )
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("signed_in", &self.access_token.is_some())
            .finish_non_exhaustive()
    }
}
