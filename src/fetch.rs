use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use url::Url;

use crate::error::{Error, Result};

pub(crate) type Body = BoxStream<'static, Result<Bytes>>;

/// Status line and headers have arrived; the body has not been read yet.
pub(crate) struct FetchResponse {
    pub(crate) status: u16,
    pub(crate) content_length: Option<u64>,
    pub(crate) body: Body,
}

impl FetchResponse {
    pub(crate) fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the whole body. Used for listing pages, which are small.
    pub(crate) async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

#[async_trait]
pub(crate) trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchResponse>;
}

pub(crate) struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub(crate) fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchResponse> {
        let response = self.client.get(url.clone()).send().await?;
        Ok(FetchResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: response.bytes_stream().map_err(Error::from).boxed(),
        })
    }
}
