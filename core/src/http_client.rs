/// HTTP/1 implementation of the collaborator traits.
///
/// Endpoints:
///   GET  /api/conversations                 ?limit=N&offset=N
///   GET  /api/conversations/:id
///   GET  /api/conversations/:id/messages    ?limit=N&offset=N
///   POST /api/conversations/:id/messages    body: SendMessageBody
///   GET  /events                            ?channel=<key>  (SSE)
use crate::api::{ConversationApi, RealtimeSubscription, RealtimeTransport, SubscriptionGuard};
use crate::config::Config;
use crate::error::{FetchError, InboxError, Result};
use crate::types::{
    ClientToken, ConversationId, ConversationSummary, HistoryMessage, ImageFile, Page,
    ParticipantId, ServerMessage,
};
use crate::wire::{ErrorBody, ImageUpload, SendMessageBody, SseDecoder, PARTICIPANT_HEADER};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Clone)]
pub struct HttpApi {
    client: HttpClient,
    base_url: String,
    participant_id: ParticipantId,
    api_token: Option<String>,
}

impl HttpApi {
    /// Plain `http://` only; there is no TLS connector.
    pub fn new(config: &Config) -> Result<Self> {
        if !config.api_url.starts_with("http://") {
            return Err(InboxError::Config(format!(
                "only http:// endpoints are supported, got {}",
                config.api_url
            )));
        }
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            participant_id: config.participant_id,
            api_token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<Request<Full<Bytes>>, FetchError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path_and_query))
            .header(PARTICIPANT_HEADER, self.participant_id.to_string());
        if let Some(token) = &self.api_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Full::new(Bytes::from(bytes))
            }
            None => Full::new(Bytes::new()),
        };
        builder
            .body(body)
            .map_err(|e| FetchError::Network(format!("invalid request: {}", e)))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<T, FetchError> {
        let request = self.build(method.clone(), path_and_query, body)?;
        debug!("{} {}", method, path_and_query);
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(http_error(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send(
        &self,
        id: ConversationId,
        body: SendMessageBody,
    ) -> std::result::Result<ServerMessage, FetchError> {
        let path = format!("/api/conversations/{}/messages", id);
        self.call(Method::POST, &path, Some(serde_json::to_vec(&body)?))
            .await
    }
}

fn http_error(status: StatusCode, body: &[u8]) -> FetchError {
    let body = serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    FetchError::Http {
        status: status.as_u16(),
        body,
    }
}

impl ConversationApi for HttpApi {
    async fn fetch_conversations(
        &self,
        limit: usize,
        offset: usize,
    ) -> std::result::Result<Page<ConversationSummary>, FetchError> {
        let path = format!("/api/conversations?limit={}&offset={}", limit, offset);
        self.call(Method::GET, &path, None).await
    }

    async fn fetch_conversation(
        &self,
        id: ConversationId,
    ) -> std::result::Result<ConversationSummary, FetchError> {
        self.call(Method::GET, &format!("/api/conversations/{}", id), None)
            .await
    }

    async fn fetch_conversation_history(
        &self,
        id: ConversationId,
        limit: usize,
        offset: usize,
    ) -> std::result::Result<Page<HistoryMessage>, FetchError> {
        let path = format!(
            "/api/conversations/{}/messages?limit={}&offset={}",
            id, limit, offset
        );
        self.call(Method::GET, &path, None).await
    }

    async fn send_text_message(
        &self,
        id: ConversationId,
        content: &str,
        token: ClientToken,
    ) -> std::result::Result<ServerMessage, FetchError> {
        let body = SendMessageBody {
            content: Some(content.to_string()),
            image: None,
            client_token: Some(token),
        };
        self.send(id, body).await
    }

    async fn send_image_message(
        &self,
        id: ConversationId,
        image: &ImageFile,
        token: ClientToken,
    ) -> std::result::Result<ServerMessage, FetchError> {
        let body = SendMessageBody {
            content: None,
            image: Some(ImageUpload::encode(image)),
            client_token: Some(token),
        };
        self.send(id, body).await
    }
}

impl RealtimeTransport for HttpApi {
    /// Opens `GET /events?channel=<key>` on a background task. The guard aborts
    /// the task, which closes the connection.
    fn subscribe(&self, channel_key: &str) -> std::result::Result<RealtimeSubscription, FetchError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FetchError::Network(format!("no runtime for subscription: {}", e)))?;
        let path = format!("/events?channel={}", urlencoding::encode(channel_key));
        let request = self.build(Method::GET, &path, None)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let key = channel_key.to_string();
        let task = runtime.spawn(async move {
            if let Err(e) = read_events(client, request, tx).await {
                warn!("Event stream for {} ended: {}", key, e);
            }
        });
        info!("Subscribed to {}", channel_key);

        let abort = task.abort_handle();
        let guard = SubscriptionGuard::new(channel_key, move || abort.abort());
        Ok(RealtimeSubscription::new(rx, guard))
    }
}

async fn read_events(
    client: HttpClient,
    request: Request<Full<Bytes>>,
    tx: mpsc::UnboundedSender<String>,
) -> std::result::Result<(), FetchError> {
    let response = client
        .request(request)
        .await
        .map_err(|e| FetchError::Network(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let bytes = response
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        return Err(http_error(status, &bytes));
    }

    let mut body = response.into_body();
    let mut decoder = SseDecoder::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| FetchError::Network(e.to_string()))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        for payload in decoder.push(&data) {
            if tx.send(payload).is_err() {
                // Subscriber went away.
                return Ok(());
            }
        }
    }
    Err(FetchError::Closed)
}
