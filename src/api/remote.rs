//! Purpose: HTTP client for the pagewise v0 protocol (JSON request/response envelopes).
//! Exports: `RemoteClient`, `RemoteCollection`.
//! Role: Transport that mirrors `PageFetcher::fetch` remotely; also a `PageSource`.
//! Invariants: Request/response shapes come from `api::wire`; nothing is re-declared here.
//! Invariants: Base URLs carry no path; collections resolve to `/v0/collections/{name}`.
//! Invariants: Transport failures and timeouts surface as `StoreUnavailable`.
#![allow(clippy::result_large_err)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::api::source::PageSource;
use crate::api::wire::{
    AppendReceipt, AppendRequest, CollectionInfo, CollectionsEnvelope, ErrorEnvelope,
    ListRequest, ListResponse,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::fetcher::Page;
use crate::core::query::{Query, RangeBounds};
use crate::core::store::Record;

type ApiResult<T> = Result<T, Error>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<RemoteClientInner>,
}

struct RemoteClientInner {
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
    agent: ureq::Agent,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

/// One named collection on a remote server.
#[derive(Clone, Debug)]
pub struct RemoteCollection {
    client: RemoteClient,
    name: String,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            inner: Arc::new(RemoteClientInner {
                base_url,
                token: None,
                timeout: DEFAULT_TIMEOUT,
                agent: build_agent(DEFAULT_TIMEOUT),
            }),
        })
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        let token = Some(token.into());
        self.rebuild(|inner| inner.token = token)
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.rebuild(|inner| {
            inner.timeout = timeout;
            inner.agent = build_agent(timeout);
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn collection(&self, name: impl Into<String>) -> ApiResult<RemoteCollection> {
        let name = name.into();
        ensure_collection_name(&name)?;
        Ok(RemoteCollection {
            client: self.clone(),
            name,
        })
    }

    pub fn health(&self) -> ApiResult<()> {
        let url = build_url(&self.inner.base_url, &["healthz"])?;
        let _: serde_json::Value = self.request_json::<(), _>("GET", &url, None)?;
        Ok(())
    }

    pub fn collections(&self) -> ApiResult<Vec<CollectionInfo>> {
        let url = build_url(&self.inner.base_url, &["v0", "collections"])?;
        let envelope: CollectionsEnvelope = self.request_json::<(), _>("GET", &url, None)?;
        Ok(envelope.collections)
    }

    fn rebuild(mut self, edit: impl FnOnce(&mut RemoteClientInner)) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            edit(inner);
            return self;
        }
        let mut inner = RemoteClientInner {
            base_url: self.inner.base_url.clone(),
            token: self.inner.token.clone(),
            timeout: self.inner.timeout,
            agent: self.inner.agent.clone(),
        };
        edit(&mut inner);
        self.inner = Arc::new(inner);
        self
    }

    fn request_json<T, R>(&self, method: &str, url: &Url, body: Option<&T>) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = self.request(method, url).set("Accept", "application/json");
        let response = match body {
            None => request.call(),
            Some(body) => {
                let payload = serde_json::to_string(body).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to encode request json")
                        .with_source(err)
                })?;
                request
                    .set("Content-Type", "application/json")
                    .send_string(&payload)
            }
        };

        match response {
            Ok(resp) => read_json_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::StoreUnavailable)
                .with_message(format!("request to {} failed", url.as_str()))
                .with_hint("Check that the server is running and reachable.")
                .with_source(err)),
        }
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut request = self.inner.agent.request(method, url.as_str());
        if let Some(token) = &self.inner.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request
    }
}

impl RemoteCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    /// One page, exactly as the server's fetcher returned it.
    pub fn list(&self, request: &ListRequest) -> ApiResult<ListResponse> {
        let url = build_url(
            &self.client.inner.base_url,
            &["v0", "collections", &self.name, "list"],
        )?;
        self.client
            .request_json("POST", &url, Some(request))
            .map_err(|err| self.annotate(err))
    }

    pub fn fetch(&self, query: &Query, bounds: &RangeBounds, limit: u32) -> ApiResult<Page> {
        self.list(&ListRequest::new(query, bounds, limit))
            .map(Page::from)
    }

    pub fn append(&self, records: Vec<Record>) -> ApiResult<AppendReceipt> {
        let url = build_url(
            &self.client.inner.base_url,
            &["v0", "collections", &self.name, "records"],
        )?;
        self.client
            .request_json("POST", &url, Some(&AppendRequest { records }))
            .map_err(|err| self.annotate(err))
    }

    fn annotate(&self, err: Error) -> Error {
        if err.collection().is_some() {
            err
        } else {
            err.with_collection(self.name.clone())
        }
    }
}

impl PageSource for RemoteCollection {
    fn fetch_page(
        &self,
        query: &Query,
        bounds: &RangeBounds,
        limit: u32,
    ) -> impl Future<Output = Result<Page, Error>> + Send {
        let collection = self.clone();
        let request = ListRequest::new(query, bounds, limit);
        async move {
            // ureq is blocking; keep it off the async workers.
            tokio::task::spawn_blocking(move || collection.list(&request).map(Page::from))
                .await
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("page fetch task failed")
                        .with_source(err)
                })?
        }
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid remote base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("remote base url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("remote base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn ensure_collection_name(name: &str) -> ApiResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("collection names must be non-empty and contain no path separators"));
    }
    Ok(())
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::StoreUnavailable)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return envelope.into_error();
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("remote error status {status}"))
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 | 422 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        408 | 502..=504 => ErrorKind::StoreUnavailable,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
