use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use linkme::distributed_slice;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde_json::Value;

use super::REGISTRY;
use super::SourceContext;
use super::SourceFactoryResult;
use crate::config::SourceConfig;
use crate::coordinator::AuthFailed;
use crate::coordinator::Fetcher;
use crate::coordinator::UpdateFailed;

#[distributed_slice(REGISTRY)]
fn init_http(ctx: &SourceContext) -> SourceFactoryResult {
    let SourceConfig::Http {
        url,
        token,
        headers,
    } = &ctx.config.source
    else {
        return Ok(None);
    };

    let source = HttpSource::new(url.clone(), token.clone(), headers)
        .with_context(|| format!("Invalid http source for entry {}", ctx.entry_id))?;
    Ok(Some(Box::new(source)))
}

/// GETs a JSON document.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    headers: HeaderMap,
}

impl HttpSource {
    pub fn new(
        url: String,
        token: Option<String>,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?;
            header_map.insert(name, value);
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            token,
            headers: header_map,
        })
    }
}

#[async_trait]
impl Fetcher<Value> for HttpSource {
    async fn fetch(&self) -> anyhow::Result<Value> {
        let mut request = self.client.get(&self.url).headers(self.headers.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpdateFailed::new(format!("GET {}: {}", self.url, e)))?;
        check_status(&self.url, response.status())?;

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| UpdateFailed::new(format!("Invalid JSON from {}: {}", self.url, e)))?;
        Ok(body)
    }
}

/// Rejected credentials are auth failures; any other error status is transient.
fn check_status(url: &str, status: StatusCode) -> anyhow::Result<()> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(AuthFailed::new(format!("{} returned {}", url, status)).into())
        }
        s if s.is_success() => Ok(()),
        s => Err(UpdateFailed::new(format!("{} returned {}", url, s)).into()),
    }
}
