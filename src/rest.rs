//! Stateless request/response façade.
//!
//! Uses only the codec, never the connection state machine: history, stats,
//! time, presence snapshots, and fire-and-forget REST publishes. Pagination
//! follows `Link` headers (see [`crate::pagination`]).

use std::collections::HashMap;
use std::sync::Arc;

use aw_codec::{ChannelOptions, CodecPipeline};
use aw_protocol::{ErrorInfo, Message, PresenceMessage, WireFormat};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Error;
use crate::options::{AuthMode, ClientOptions};
use crate::pagination::{PageRequest, PaginatedResult, parse_link_header};

/// Sort direction for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Newest first.
    #[default]
    Backwards,
    /// Oldest first.
    Forwards,
}

impl Direction {
    fn query_value(self) -> &'static str {
        match self {
            Direction::Backwards => "backwards",
            Direction::Forwards => "forwards",
        }
    }
}

/// Time-range query for channel history.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Page size; the broker default of 100 applies when unset.
    pub limit: Option<u32>,
    pub direction: Direction,
}

impl HistoryQuery {
    fn params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(start) = self.start {
            params.push(("start".to_owned(), start.timestamp_millis().to_string()));
        }
        if let Some(end) = self.end {
            params.push(("end".to_owned(), end.timestamp_millis().to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_owned(), limit.to_string()));
        }
        params.push((
            "direction".to_owned(),
            self.direction.query_value().to_owned(),
        ));
        params
    }
}

/// Time-range query for application statistics.
#[derive(Debug, Clone, Default)]
pub struct StatsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    /// Aggregation unit: `minute`, `hour`, `day`, or `month`.
    pub unit: Option<String>,
}

impl StatsQuery {
    fn params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(start) = self.start {
            params.push(("start".to_owned(), start.timestamp_millis().to_string()));
        }
        if let Some(end) = self.end {
            params.push(("end".to_owned(), end.timestamp_millis().to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_owned(), limit.to_string()));
        }
        if let Some(unit) = &self.unit {
            params.push(("unit".to_owned(), unit.clone()));
        }
        params
    }
}

/// Decode context threaded through page fetches so follow-up pages run the
/// same pipeline as the first.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    pub channel_options: Option<ChannelOptions>,
}

impl PageContext {
    fn pipeline(&self) -> Result<CodecPipeline, Error> {
        let options = self.channel_options.clone().unwrap_or_default();
        Ok(CodecPipeline::new(&options, WireFormat::Json)?)
    }
}

/// Items a page body can decode into.
pub trait PageItem: Sized {
    fn decode_page(body: &[u8], context: &PageContext) -> Result<Vec<Self>, Error>;
}

impl PageItem for Message {
    fn decode_page(body: &[u8], context: &PageContext) -> Result<Vec<Self>, Error> {
        let mut items: Vec<Message> =
            serde_json::from_slice(body).map_err(|e| Error::BadResponse(e.to_string()))?;
        let pipeline = context.pipeline()?;
        for item in &mut items {
            if let Err(e) = pipeline.decode(item) {
                warn!(error = %e, "history message decode degraded");
            }
        }
        Ok(items)
    }
}

impl PageItem for PresenceMessage {
    fn decode_page(body: &[u8], context: &PageContext) -> Result<Vec<Self>, Error> {
        let mut items: Vec<PresenceMessage> =
            serde_json::from_slice(body).map_err(|e| Error::BadResponse(e.to_string()))?;
        let pipeline = context.pipeline()?;
        for item in &mut items {
            if let Err(e) = pipeline.decode(item) {
                warn!(error = %e, "presence entry decode degraded");
            }
        }
        Ok(items)
    }
}

impl PageItem for serde_json::Value {
    fn decode_page(body: &[u8], _context: &PageContext) -> Result<Vec<Self>, Error> {
        serde_json::from_slice(body).map_err(|e| Error::BadResponse(e.to_string()))
    }
}

/// Error envelope the broker returns on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorInfo,
}

/// The stateless REST client. Cheap to clone.
#[derive(Clone)]
pub struct Rest {
    http: reqwest::Client,
    opts: Arc<ClientOptions>,
}

impl Rest {
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        options.validate()?;
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout())
            .build()?;
        Ok(Rest {
            http,
            opts: Arc::new(options),
        })
    }

    pub(crate) fn from_shared(opts: Arc<ClientOptions>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(opts.request_timeout())
            .build()?;
        Ok(Rest { http, opts })
    }

    /// Broker time in epoch milliseconds (`GET /time`).
    pub async fn time(&self) -> Result<i64, Error> {
        let response = self
            .authorize(self.http.get(self.url("/time")))
            .await?
            .send()
            .await?;
        let body = Self::check(response).await?;
        let times: Vec<i64> =
            serde_json::from_slice(&body).map_err(|e| Error::BadResponse(e.to_string()))?;
        times
            .first()
            .copied()
            .ok_or_else(|| Error::BadResponse("empty /time response".to_owned()))
    }

    /// Channel history (`GET /channels/<name>/history`), decoded through the
    /// channel's codec pipeline.
    pub async fn history(
        &self,
        channel: &str,
        query: &HistoryQuery,
        options: &ChannelOptions,
    ) -> Result<PaginatedResult<Message>, Error> {
        let request = PageRequest {
            path: format!("channels/{channel}/history"),
            params: query.params(),
        };
        self.fetch_page(
            request,
            PageContext {
                channel_options: Some(options.clone()),
            },
        )
        .await
    }

    /// Presence snapshot (`GET /channels/<name>/presence`).
    pub async fn presence(
        &self,
        channel: &str,
        limit: Option<u32>,
        options: &ChannelOptions,
    ) -> Result<PaginatedResult<PresenceMessage>, Error> {
        let mut params = Vec::new();
        if let Some(limit) = limit {
            params.push(("limit".to_owned(), limit.to_string()));
        }
        let request = PageRequest {
            path: format!("channels/{channel}/presence"),
            params,
        };
        self.fetch_page(
            request,
            PageContext {
                channel_options: Some(options.clone()),
            },
        )
        .await
    }

    /// Application statistics (`GET /stats`), passed through as raw values.
    pub async fn stats(&self, query: &StatsQuery) -> Result<PaginatedResult<serde_json::Value>, Error> {
        let request = PageRequest {
            path: "stats".to_owned(),
            params: query.params(),
        };
        self.fetch_page(request, PageContext::default()).await
    }

    /// Publish over REST (`POST /channels/<name>/messages`); no realtime
    /// connection required.
    pub async fn publish(
        &self,
        channel: &str,
        mut messages: Vec<Message>,
        options: &ChannelOptions,
    ) -> Result<(), Error> {
        let pipeline = CodecPipeline::new(options, WireFormat::Json)?;
        for message in &mut messages {
            pipeline.encode(message)?;
        }
        let url = self.url(&format!("/channels/{channel}/messages"));
        let response = self
            .authorize(self.http.post(url))
            .await?
            .json(&messages)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Issue a parsed page request and wrap the response.
    pub(crate) async fn fetch_page<T: PageItem>(
        &self,
        request: PageRequest,
        context: PageContext,
    ) -> Result<PaginatedResult<T>, Error> {
        let url = self.url(&format!("/{}", request.path.trim_start_matches('/')));
        debug!(url = %url, "page fetch");
        let response = self
            .authorize(self.http.get(url))
            .await?
            .query(&request.params)
            .send()
            .await?;

        let mut relations: HashMap<String, PageRequest> = HashMap::new();
        for value in response.headers().get_all(reqwest::header::LINK) {
            if let Ok(value) = value.to_str() {
                for (rel, page_request) in parse_link_header(value) {
                    relations.insert(rel, page_request);
                }
            }
        }

        let body = Self::check(response).await?;
        let items = T::decode_page(&body, &context)?;
        Ok(PaginatedResult::new(items, relations, self.clone(), context))
    }

    // -- internals ----------------------------------------------------------

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.opts.rest_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, Error> {
        match &self.opts.auth {
            AuthMode::ApiKey(key) => Ok(match key.split_once(':') {
                Some((name, secret)) => builder.basic_auth(name, Some(secret)),
                None => builder.basic_auth(key, None::<&str>),
            }),
            AuthMode::Token(token) => Ok(builder.bearer_auth(token)),
            AuthMode::Callback(callback) => {
                let token = callback().await.map_err(Error::from_error_info)?;
                Ok(builder.bearer_auth(token))
            }
        }
    }

    /// Map non-2xx responses to the broker's error envelope; return the body
    /// bytes otherwise.
    async fn check(response: reqwest::Response) -> Result<Vec<u8>, Error> {
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        if status.is_success() {
            return Ok(body);
        }
        match serde_json::from_slice::<ErrorEnvelope>(&body) {
            Ok(envelope) => Err(Error::from_error_info(envelope.error)),
            Err(_) => Err(Error::BadResponse(format!(
                "HTTP {status} without an error envelope"
            ))),
        }
    }
}
