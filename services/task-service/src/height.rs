use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::HeightSourceError;

#[async_trait]
pub trait HeightSource: Send + Sync {
    async fn current_height(&self) -> Result<u64, HeightSourceError>;
}

pub struct SubstrateHeightSource {
    client: Client,
    rpc_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Header>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct Header {
    number: String,
}

impl SubstrateHeightSource {
    pub fn new(
        rpc_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, HeightSourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            rpc_url: rpc_url.into(),
            token,
        })
    }
}

fn parse_block_number(raw: &str) -> Result<u64, HeightSourceError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| HeightSourceError::Malformed(raw.to_string()))?;
    u64::from_str_radix(digits, 16).map_err(|_| HeightSourceError::Malformed(raw.to_string()))
}

#[async_trait]
impl HeightSource for SubstrateHeightSource {
    async fn current_height(&self) -> Result<u64, HeightSourceError> {
        let mut request = self.client.post(self.rpc_url.as_str()).json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "chain_getHeader",
            "params": [],
        }));
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(HeightSourceError::Status(response.status().as_u16()));
        }

        let body: RpcResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(HeightSourceError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        let header = body
            .result
            .ok_or_else(|| HeightSourceError::Malformed("missing result".to_string()))?;
        parse_block_number(&header.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Json, routing::post, Router};

    #[test]
    fn parses_hex_block_numbers() {
        assert_eq!(parse_block_number("0x0").unwrap(), 0);
        assert_eq!(parse_block_number("0x4a3b2c").unwrap(), 0x4a3b2c);
        assert_eq!(parse_block_number("0XFF").unwrap(), 255);
        assert!(matches!(
            parse_block_number("1234"),
            Err(HeightSourceError::Malformed(_))
        ));
        assert!(matches!(
            parse_block_number("0xzz"),
            Err(HeightSourceError::Malformed(_))
        ));
    }

    async fn serve(reply: serde_json::Value) -> String {
        let router = Router::new().route(
            "/",
            post(move |Json(body): Json<serde_json::Value>| {
                let reply = reply.clone();
                async move {
                    assert_eq!(body["method"], "chain_getHeader");
                    Json(reply)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn reads_header_number() {
        let url = serve(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "number": "0x10", "parentHash": "0x00" }
        }))
        .await;
        let source = SubstrateHeightSource::new(url, None, Duration::from_secs(5)).unwrap();
        assert_eq!(source.current_height().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn surfaces_rpc_errors() {
        let url = serve(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32601, "message": "Method not found" }
        }))
        .await;
        let source = SubstrateHeightSource::new(url, None, Duration::from_secs(5)).unwrap();
        let err = source.current_height().await.unwrap_err();
        assert!(matches!(err, HeightSourceError::Rpc { code: -32601, .. }));
    }
}
