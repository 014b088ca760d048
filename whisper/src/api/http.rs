//! HTTP implementation of [`ChatApi`] over the backend's REST routes.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use whisper_proto::api::{ApiMessage, HistoryQuery, MarkReadRequest, MarkReadResponse, SendRequest};
use whisper_proto::message::{ConversationId, MessageId};

use super::{ApiError, ChatApi};
use crate::auth::AuthProvider;

/// Longest error body kept in [`ApiError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// REST client rooted at the backend's API base (e.g. `https://host/api`).
pub struct HttpApi {
    client: Client,
    base: Url,
    auth: Arc<dyn AuthProvider>,
}

impl HttpApi {
    /// Builds a client whose requests each time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Network`] if `base_url` is not a valid base URL or
    /// the HTTP client cannot be constructed.
    pub fn new(
        base_url: &str,
        auth: Arc<dyn AuthProvider>,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base = Url::parse(base_url)
            .map_err(|e| ApiError::Network(format!("invalid API URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::Network(format!("API URL cannot be a base: {base_url}")));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self { client, base, auth })
    }

    /// Joins path segments onto the base, with the trailing slash the
    /// backend's routes expect.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments).push("");
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.auth.on_unauthorized();
            return Err(ApiError::Unauthorized);
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(body));
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(map_reqwest_error)
    }
}

impl ChatApi for HttpApi {
    async fn history(
        &self,
        conversation: &ConversationId,
        query: &HistoryQuery,
    ) -> Result<Vec<ApiMessage>, ApiError> {
        let url = self.endpoint(&["conversations", conversation.as_str(), "messages"]);
        let mut page: Vec<ApiMessage> = self.execute_json(self.client.get(url).query(query)).await?;
        page.sort_by_key(|m| m.timestamp);
        tracing::debug!(conversation = %conversation, count = page.len(), "history page fetched");
        Ok(page)
    }

    async fn send(
        &self,
        conversation: &ConversationId,
        request: &SendRequest,
    ) -> Result<ApiMessage, ApiError> {
        let url = self.endpoint(&["conversations", conversation.as_str(), "messages"]);
        self.execute_json(self.client.post(url).json(request)).await
    }

    async fn delete(&self, conversation: &ConversationId, message: &MessageId) -> Result<(), ApiError> {
        let url = self.endpoint(&[
            "conversations",
            conversation.as_str(),
            "messages",
            message.as_str(),
        ]);
        self.execute(self.client.delete(url)).await.map(drop)
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        request: &MarkReadRequest,
    ) -> Result<MarkReadResponse, ApiError> {
        let url = self.endpoint(&["conversations", conversation.as_str(), "mark_read"]);
        self.execute_json(self.client.post(url).json(request)).await
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}

/// Largest index `<= max` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
