//! REST backend client.

use std::time::Duration;

use chat_core::{
    ChatApi, ChatError, ChatErrorCategory, ConversationHistory, ConversationSummary, Message,
    OutgoingMessage, classify_http_status,
};
use reqwest::{
    Client, RequestBuilder, StatusCode,
    header::RETRY_AFTER,
    multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct StartConversationResponse {
    #[serde(rename = "chatId")]
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    chats: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// `ChatApi` over the chat service's REST endpoints, authenticated with a
/// bearer token.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: Url, token: impl Into<String>) -> Result<Self, ChatError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "http_client_init_failed",
                    err.to_string(),
                )
            })?;
        Self::with_client(client, base_url, token)
    }

    pub fn with_client(
        client: Client,
        base_url: Url,
        token: impl Into<String>,
    ) -> Result<Self, ChatError> {
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_api_url",
                format!("'{base_url}' is not an http(s) base url"),
            ));
        }
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    /// Append path segments to the base url, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "invalid_api_url",
                    format!("'{}' cannot take path segments", self.base_url),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> Result<T, ChatError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| request_error(&err, action))?;

        let status = response.status();
        debug!(action, status = status.as_u16(), "chat api response");
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, retry_after.as_deref(), &body, action));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| request_error(&err, action))?;
        decode_body(&body, action)
    }
}

impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, conversation_id: &str) -> Result<ConversationHistory, ChatError> {
        let url = self.endpoint(&["chat", conversation_id, "messages"])?;
        self.execute(self.client.get(url), "fetch history").await
    }

    async fn start_conversation(&self, recipient_id: &str) -> Result<String, ChatError> {
        let url = self.endpoint(&["chat", "message"])?;
        let request = self
            .client
            .post(url)
            .json(&json!({ "recipientId": recipient_id }));
        let response: StartConversationResponse =
            self.execute(request, "start conversation").await?;
        Ok(response.conversation_id)
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<Message, ChatError> {
        let url = self.endpoint(&["chat", "send"])?;
        let form = message_form(message)?;
        let response: SendMessageResponse = self
            .execute(self.client.post(url).multipart(form), "send message")
            .await?;
        Ok(response.message)
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        let url = self.endpoint(&["chat", "all"])?;
        let response: ConversationsResponse = self
            .execute(self.client.get(url), "fetch conversations")
            .await?;
        Ok(response.chats)
    }
}

fn message_form(message: OutgoingMessage) -> Result<Form, ChatError> {
    let OutgoingMessage {
        conversation_id,
        text,
        image,
    } = message;

    let mut form = Form::new().text("chatId", conversation_id);
    if let Some(text) = text {
        form = form.text("text", text);
    }
    if let Some(image) = image {
        let part = Part::bytes(image.data)
            .file_name(image.file_name)
            .mime_str(&image.content_type)
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Serialization,
                    "invalid_image_type",
                    format!("'{}' is not a valid content type: {err}", image.content_type),
                )
            })?;
        form = form.part("image", part);
    }
    Ok(form)
}

fn request_error(err: &reqwest::Error, action: &str) -> ChatError {
    let code = if err.is_timeout() {
        "http_timeout"
    } else if err.is_connect() {
        "http_connect_failed"
    } else {
        "http_request_failed"
    };
    ChatError::new(
        ChatErrorCategory::Network,
        code,
        format!("{action} request failed: {err}"),
    )
}

/// Error for a non-success response. The backend's `{ message }` body wins
/// over the generic text.
fn http_error(
    status: StatusCode,
    retry_after: Option<&str>,
    body: &str,
    action: &str,
) -> ChatError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|body| body.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("{action} failed with HTTP {}", status.as_u16()));

    let error = ChatError::new(
        classify_http_status(status.as_u16()),
        format!("http_{}", status.as_u16()),
        message,
    );
    match retry_after.and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(seconds) => error.with_retry_after(Duration::from_secs(seconds)),
        None => error,
    }
}

fn decode_body<T: DeserializeOwned>(body: &[u8], action: &str) -> Result<T, ChatError> {
    serde_json::from_slice(body).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "response_decode_error",
            format!("invalid {action} response: {err}"),
        )
    })
}
