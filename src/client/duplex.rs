// Duplex relay client
// One socket: watch a run's interrupts and answer them

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::api::types::{DuplexMessage, DuplexRequest};
use crate::api::websocket::CLOSE_UNAUTHORIZED;
use crate::client::parse_base_url;
use crate::models::{ReviewDecision, RunId};
use crate::{ForgeError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct DuplexClient {
    socket: Socket,
}

impl DuplexClient {
    /// Connect and authenticate; fails with `Authentication` when the token is refused
    pub async fn connect(base_url: &str, token: &str) -> Result<Self> {
        let url = duplex_url(base_url, token)?;
        let (socket, _) = connect_async(url.to_string())
            .await
            .map_err(|e| ForgeError::Transport(format!("duplex connect failed: {}", e)))?;
        let mut client = Self { socket };

        match client.next_message().await? {
            Some(DuplexMessage::Connected { .. }) => Ok(client),
            Some(DuplexMessage::Error { message }) => Err(ForgeError::Authentication(message)),
            Some(other) => Err(ForgeError::Transport(format!(
                "unexpected greeting: {:?}",
                other
            ))),
            None => Err(ForgeError::Transport("socket closed during handshake".to_string())),
        }
    }

    pub async fn send(&mut self, request: &DuplexRequest) -> Result<()> {
        let text = serde_json::to_string(request)?;
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| ForgeError::Transport(e.to_string()))
    }

    /// Watch a run, replacing any previous subscription
    ///
    /// Relay traffic that arrives before the acknowledgement is discarded.
    pub async fn subscribe(&mut self, run_id: &RunId) -> Result<()> {
        self.send(&DuplexRequest::Subscribe {
            run_id: run_id.to_string(),
        })
        .await?;
        loop {
            match self.next_message().await? {
                Some(DuplexMessage::Subscribed { .. }) => return Ok(()),
                Some(DuplexMessage::Error { message }) => {
                    return Err(ForgeError::ChannelSubscribe(message))
                }
                Some(other) => debug!("Discarding {:?} while subscribing", other),
                None => {
                    return Err(ForgeError::Transport(
                        "socket closed while subscribing".to_string(),
                    ))
                }
            }
        }
    }

    /// Send a reviewer decision; the server does not acknowledge decisions
    pub async fn decide(&mut self, run_id: &RunId, stage: &str, decision: ReviewDecision) -> Result<()> {
        let run_id = run_id.to_string();
        let stage = stage.to_string();
        let request = match decision {
            ReviewDecision::Approve => DuplexRequest::Approve { run_id, stage },
            ReviewDecision::Reject { feedback } => DuplexRequest::Reject {
                run_id,
                stage,
                feedback: Some(feedback),
            },
            ReviewDecision::Edit { content } => DuplexRequest::Edit {
                run_id,
                stage,
                updated_data: Some(content),
            },
        };
        self.send(&request).await
    }

    pub async fn approve(&mut self, run_id: &RunId, stage: &str) -> Result<()> {
        self.decide(run_id, stage, ReviewDecision::Approve).await
    }

    pub async fn reject(&mut self, run_id: &RunId, stage: &str, feedback: impl Into<String>) -> Result<()> {
        self.decide(
            run_id,
            stage,
            ReviewDecision::Reject {
                feedback: feedback.into(),
            },
        )
        .await
    }

    pub async fn edit(&mut self, run_id: &RunId, stage: &str, content: Value) -> Result<()> {
        self.decide(run_id, stage, ReviewDecision::Edit { content }).await
    }

    /// Next server message; `None` once the socket is closed
    pub async fn next_message(&mut self) -> Result<Option<DuplexMessage>> {
        while let Some(frame) = self.socket.next().await {
            let frame = frame.map_err(|e| ForgeError::Transport(e.to_string()))?;
            match frame {
                Message::Text(text) => match serde_json::from_str::<DuplexMessage>(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => debug!("Skipping malformed duplex message: {}", e),
                },
                Message::Close(Some(close)) if close.code == CloseCode::from(CLOSE_UNAUTHORIZED) => {
                    return Err(ForgeError::Authentication(close.reason.to_string()));
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> Result<()> {
        self.socket
            .close(None)
            .await
            .map_err(|e| ForgeError::Transport(e.to_string()))
    }
}

fn duplex_url(base_url: &str, token: &str) -> Result<Url> {
    let mut url = parse_base_url(base_url)?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ForgeError::InvalidInput(format!("cannot derive a socket URL from '{}'", base_url)))?;
    url.set_path("/api/ws/generation");
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplex_url_follows_http_scheme() {
        let url = duplex_url("http://localhost:4000/ignored", "abc").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:4000/api/ws/generation?token=abc");
        let secure = duplex_url("https://forge.example.com", "a.b.c").unwrap();
        assert_eq!(
            secure.as_str(),
            "wss://forge.example.com/api/ws/generation?token=a.b.c"
        );
        assert!(duplex_url("ftp://nope", "x").is_err());
    }
}
