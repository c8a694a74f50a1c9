use super::RpcError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use url::Url;

/// Longest slice of an error body kept in diagnostics.
const BODY_SNIPPET_LEN: usize = 300;

/// Moves one encoded request document to the daemon and returns the raw
/// response body. No retries happen at this layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: String) -> Result<String, RpcError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, RpcError> {
        log::debug!("Creating XML-RPC transport for {} (timeout {:?})", endpoint, timeout);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Network(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: String) -> Result<String, RpcError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/xml")
            .body(request)
            .send()
            .await
            .map_err(|e| network_error(&self.endpoint, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| network_error(&self.endpoint, e))?;

        if !status.is_success() {
            return Err(RpcError::Protocol(format!(
                "HTTP error: {}, response={}",
                status,
                snippet(&body)
            )));
        }
        log::trace!("Daemon answered {} bytes with status {}", body.len(), status);
        Ok(body)
    }
}

fn network_error(endpoint: &Url, e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Network(format!("request to {} timed out", endpoint))
    } else {
        RpcError::Network(format!("request to {} failed: {}", endpoint, e))
    }
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET_LEN) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_respects_char_boundaries() {
        let body = "ж".repeat(BODY_SNIPPET_LEN + 10);
        assert_eq!(snippet(&body).chars().count(), BODY_SNIPPET_LEN);
        assert_eq!(snippet("short"), "short");
    }

    /// Serves one connection with a canned HTTP response once the request
    /// document has arrived.
    async fn one_shot_server(response: String) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&received).contains("</methodCall>") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        Url::parse(&format!("http://{}/RPC", addr)).unwrap()
    }

    #[tokio::test]
    async fn server_error_status_is_a_protocol_error() {
        let body = "oops";
        let endpoint = one_shot_server(format!(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();

        let err = transport
            .send("<methodCall><methodName>saveAllDbs</methodName></methodCall>".into())
            .await
            .unwrap_err();
        match err {
            RpcError::Protocol(message) => {
                assert!(message.contains("500"), "{}", message);
                assert!(message.ends_with("response=oops"), "{}", message);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn success_status_returns_body_verbatim() {
        let body = "<?xml version=\"1.0\"?><methodResponse><params/></methodResponse>";
        let endpoint = one_shot_server(format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/xml\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();
        let answer = transport
            .send("<methodCall><methodName>x</methodName></methodCall>".into())
            .await
            .unwrap();
        assert_eq!(answer, body);
    }

    #[tokio::test]
    async fn unreachable_daemon_is_a_network_error() {
        // Port 9 (discard) on loopback is closed in test environments.
        let endpoint = Url::parse("http://127.0.0.1:9/RPC").unwrap();
        let transport = HttpTransport::new(endpoint, Duration::from_secs(2)).unwrap();
        let err = transport.send("<methodCall/>".into()).await.unwrap_err();
        assert!(matches!(err, RpcError::Network(_)), "got {:?}", err);
    }
}
