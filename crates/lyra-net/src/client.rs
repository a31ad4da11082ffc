use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Client;
use tracing::trace;
use url::Url;

use crate::{
    error::{NetError, NetResult},
    traits::Net,
    types::{Headers, NetOptions, RangeResponse, RangeSpec},
};

#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: Client,
    options: NetOptions,
}

impl HttpClient {
    /// # Errors
    ///
    /// Returns [`NetError::Http`] if the TLS backend cannot be initialised.
    pub fn new(options: NetOptions) -> NetResult<Self> {
        let inner = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()?;
        Ok(Self { inner, options })
    }

    fn apply_headers(
        mut req: reqwest::RequestBuilder,
        headers: Option<Headers>,
    ) -> reqwest::RequestBuilder {
        if let Some(headers) = headers {
            for (k, v) in headers.iter() {
                req = req.header(k, v);
            }
        }
        req
    }

    fn collect_headers(resp: &reqwest::Response) -> Headers {
        let mut out = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str(), v);
            }
        }
        out
    }

    fn check_status(url: &Url, resp: reqwest::Response) -> NetResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        trace!(%url, status = status.as_u16(), "HttpClient: error status");
        Err(NetError::http_status(status.as_u16(), url.as_str()))
    }
}

#[async_trait]
impl Net for HttpClient {
    async fn get_bytes(&self, url: Url, headers: Option<Headers>) -> Result<Bytes, NetError> {
        let req = self.inner.get(url.clone());
        let req = Self::apply_headers(req, headers).timeout(self.options.request_timeout);

        let resp = Self::check_status(&url, req.send().await?)?;
        Ok(resp.bytes().await?)
    }

    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<RangeResponse, NetError> {
        let req = self
            .inner
            .get(url.clone())
            .header("Range", range.to_header_value());
        let req = Self::apply_headers(req, headers);
        // No timeout on the body: a progressive download may take any time.

        let resp = Self::check_status(&url, req.send().await?)?;
        let status = resp.status().as_u16();
        let headers = Self::collect_headers(&resp);
        trace!(%url, range = %range.to_header_value(), status, "HttpClient: range response");

        let stream = resp.bytes_stream().map_err(NetError::from);
        Ok(RangeResponse {
            status,
            headers,
            stream: Box::pin(stream),
        })
    }

    async fn head(&self, url: Url, headers: Option<Headers>) -> Result<Headers, NetError> {
        let req = self.inner.head(url.clone());
        let req = Self::apply_headers(req, headers).timeout(self.options.request_timeout);

        let resp = Self::check_status(&url, req.send().await?)?;
        Ok(Self::collect_headers(&resp))
    }
}
