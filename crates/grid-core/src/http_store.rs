//! Object store over any S3-compatible HTTP endpoint (MinIO in the local
//! stack). The bucket is fixed at construction; keys are the blob-layout
//! keys from [`crate::blob`].

use crate::{Error, ObjectStore, Result};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpObjectStore {
    endpoint: Url,
    bucket: String,
    client: Arc<reqwest::Client>,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, bucket: impl Into<String>) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint
                .parse()
                .context("parse object store endpoint URL")
                .map_err(Error::from)?,
            bucket: bucket.into(),
            client: Arc::new(reqwest::Client::new()),
        })
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let full = format!("{base}/{}/{key}", self.bucket);
        full.parse()
            .context("build object URL")
            .map_err(Error::from)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.object_url(key)?;
        let resp = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("PUT object key={key}"))
            .map_err(Error::from)?;

        resp.error_for_status()
            .with_context(|| format!("PUT object status key={key}"))
            .map_err(Error::from)?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(key)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET object key={key}"))
            .map_err(Error::from)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("no object at key [{key}]")));
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("GET object status key={key}"))
            .map_err(Error::from)?;

        Ok(resp
            .bytes()
            .await
            .context("GET body bytes")
            .map_err(Error::from)?
            .to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let url = self.object_url(key)?;
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .with_context(|| format!("HEAD object key={key}"))
            .map_err(Error::from)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()
            .with_context(|| format!("HEAD object status key={key}"))
            .map_err(Error::from)?;
        Ok(true)
    }
}
