use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Conversation, ConversationId, Message, UserId, UserSummary},
    error::ApiError,
    protocol::{MarkReadRequest, MessageRow, SendMessageRequest, StartConversationRequest},
};
use url::Url;

use crate::error::{ChatError, ChatResult};

/// Request/response half of the chat API.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_conversations(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>>;
    /// Also clears the caller's unread state server-side.
    async fn fetch_messages(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<Vec<Message>>;
    async fn send_message(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ChatResult<Message>;
    async fn mark_as_read(&self, user_id: &UserId, conversation_id: &ConversationId)
        -> ChatResult<()>;
    /// Idempotent per participant pair.
    async fn start_conversation(
        &self,
        user_id: &UserId,
        participant_id: &UserId,
    ) -> ChatResult<Conversation>;
    async fn search_users(&self, user_id: &UserId, term: &str) -> ChatResult<Vec<UserSummary>>;
}

pub struct HttpChatBackend {
    http: Client,
    base: Url,
}

impl HttpChatBackend {
    pub fn new(server_url: &str, request_timeout: Duration) -> ChatResult<Self> {
        let base = Url::parse(server_url)
            .map_err(|err| ChatError::Validation(format!("invalid server_url {server_url}: {err}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ChatError::Validation(
                "server_url must start with http:// or https://".to_string(),
            ));
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| ChatError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> ChatResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Validation(format!("server_url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_json<B, T>(&self, url: Url, body: &B) -> ChatResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self.http.post(url).json(body).send().await?;
        read_json(response).await
    }
}

async fn check_status(response: Response) -> ChatResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ApiError>().await.ok();
    Err(ChatError::from_status(status, body))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> ChatResult<T> {
    let response = check_status(response).await?;
    Ok(response.json().await?)
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn fetch_conversations(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        let url = self.endpoint(&["conversations"])?;
        let response = self
            .http
            .get(url)
            .query(&[("user_id", user_id.as_str())])
            .send()
            .await?;
        read_json(response).await
    }

    async fn fetch_messages(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<Vec<Message>> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let response = self
            .http
            .get(url)
            .query(&[("user_id", user_id.as_str())])
            .send()
            .await?;
        let rows: Vec<MessageRow> = read_json(response).await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn send_message(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ChatResult<Message> {
        let url = self.endpoint(&["messages"])?;
        let row: MessageRow = self
            .post_json(
                url,
                &SendMessageRequest {
                    conversation_id: conversation_id.clone(),
                    sender_id: user_id.clone(),
                    content: content.to_string(),
                },
            )
            .await?;
        Ok(row.into())
    }

    async fn mark_as_read(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<()> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "read"])?;
        let response = self
            .http
            .post(url)
            .json(&MarkReadRequest {
                user_id: user_id.clone(),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn start_conversation(
        &self,
        user_id: &UserId,
        participant_id: &UserId,
    ) -> ChatResult<Conversation> {
        let url = self.endpoint(&["conversations"])?;
        self.post_json(
            url,
            &StartConversationRequest {
                user_id: user_id.clone(),
                participant_id: participant_id.clone(),
            },
        )
        .await
    }

    async fn search_users(&self, user_id: &UserId, term: &str) -> ChatResult<Vec<UserSummary>> {
        let url = self.endpoint(&["users", "search"])?;
        let response = self
            .http
            .get(url)
            .query(&[("user_id", user_id.as_str()), ("term", term)])
            .send()
            .await?;
        read_json(response).await
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
