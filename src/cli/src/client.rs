//! HTTP client for the Relay admin API.

use anyhow::{Context, Result};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// HTTP client for the Relay admin API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<(), T>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<(), T>(Method::DELETE, path, None).await
    }

    /// GET a non-enveloped JSON document. A 503 from `/health` still carries a
    /// report, so any status with a JSON body is accepted.
    pub async fn get_raw(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        serde_json::from_str(&text)
            .with_context(|| format!("API error ({}): {}", status, text))
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;

        let data = read_envelope(resp)
            .await
            .with_context(|| format!("{} {}", method, path))?;
        serde_json::from_value(data).with_context(|| format!("Failed to parse response from {}", url))
    }
}

async fn read_envelope(resp: Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let Ok(body) = serde_json::from_str::<Value>(&text) else {
        anyhow::bail!("API error ({}): {}", status, text);
    };
    unwrap_envelope(body)
}

/// Extract `data` from a success envelope, or turn either error shape into an error.
///
/// Successes look like `{success: true, data}`. Failures come as
/// `{success: false, error: "msg", error_code}` from handlers or as
/// `{success: false, error: {code, message}}` from typed errors.
pub fn unwrap_envelope(body: Value) -> Result<Value> {
    if body.get("success").and_then(Value::as_bool) == Some(true) {
        return body
            .get("data")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("API returned success but no data"));
    }

    let (code, message) = match body.get("error") {
        Some(Value::String(message)) => (
            body.get("error_code").and_then(Value::as_str).map(str::to_string),
            message.clone(),
        ),
        Some(Value::Object(error)) => (
            error.get("code").and_then(Value::as_str).map(str::to_string),
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        ),
        _ => (None, "Unknown error".to_string()),
    };

    match code {
        Some(code) => Err(anyhow::anyhow!("API error [{}]: {}", code, message)),
        None => Err(anyhow::anyhow!("API error: {}", message)),
    }
}
