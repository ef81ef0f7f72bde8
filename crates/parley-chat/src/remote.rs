//! Remote message service: history pages, send and unsend over HTTP.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use parley_shared::protocol::{
    HistoryPage, SendRequest, SendResponse, UnsendRequest, UnsendResponse, WireMessage,
};
use parley_shared::types::{ConversationId, MessageId};

use crate::error::RemoteError;

/// The operations the conversation layer needs from the message service.
#[async_trait]
pub trait RemoteService: Send + Sync + 'static {
    /// Up to `limit` messages strictly older than `before` (newest page when
    /// `None`), plus whether anything older remains.
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
        before: Option<&str>,
    ) -> Result<HistoryPage, RemoteError>;

    /// Persist an outgoing message and return the stored record.
    async fn send_message(&self, request: &SendRequest) -> Result<WireMessage, RemoteError>;

    async fn unsend_message(&self, message_id: &MessageId) -> Result<(), RemoteError>;
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn history_url(&self, conversation_id: &ConversationId) -> String {
        format!("{}/messages/{}", self.base_url, conversation_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp.json().await?)
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
        before: Option<&str>,
    ) -> Result<HistoryPage, RemoteError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }

        debug!(conversation = %conversation_id, limit, before = ?before, "GET history");
        let resp = self
            .authorize(self.client.get(self.history_url(conversation_id)))
            .query(&query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn send_message(&self, request: &SendRequest) -> Result<WireMessage, RemoteError> {
        let resp = self
            .authorize(self.client.post(format!("{}/sendMessage", self.base_url)))
            .json(request)
            .send()
            .await?;

        let body: SendResponse = decode(resp).await?;
        if !body.success {
            return Err(RemoteError::Rejected {
                status: 200,
                message: "send not accepted".into(),
            });
        }
        Ok(body.chat)
    }

    async fn unsend_message(&self, message_id: &MessageId) -> Result<(), RemoteError> {
        let resp = self
            .authorize(self.client.post(format!("{}/message/unsend", self.base_url)))
            .json(&UnsendRequest {
                message_id: message_id.clone(),
            })
            .send()
            .await?;

        let body: UnsendResponse = decode(resp).await?;
        if body.success {
            Ok(())
        } else {
            Err(RemoteError::Rejected {
                status: 200,
                message: body.message.unwrap_or_else(|| "unsend not accepted".into()),
            })
        }
    }
}
