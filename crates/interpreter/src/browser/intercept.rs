//! RPC rerouting
//!
//! The app under test talks to the public RPC URL of the forked chain.
//! Requests to exactly that URL are paused in the browser, replayed against
//! the local fork and answered with the fork's response, so the app sees
//! forked state without any change to its configuration.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    HeaderEntry, RequestId, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{self, ErrorReason};
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::Arc;
use storycheck_common::{ChainEndpoints, Result, StoryError};
use tracing::{debug, info, warn};

use super::{browser_error, SessionTasks};

/// Response headers not to replay into the browser
const HOP_BY_HOP: &[&str] = &["connection", "transfer-encoding", "keep-alive", "content-length"];

/// One paused browser request
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedCall {
    pub method: String,
    pub url: String,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl ForwardedCall {
    pub fn from_request(request: &network::Request) -> Self {
        let content_type = request.headers.inner().as_object().and_then(|headers| {
            headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .and_then(|(_, value)| value.as_str())
                .map(String::from)
        });
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            content_type,
            body: request.post_data_entries.as_deref().and_then(decode_post_data),
        }
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.body.as_deref().unwrap_or_default())
    }
}

/// Join the base64 chunks of a request body. `None` when there are none.
fn decode_post_data(entries: &[network::PostDataEntry]) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let mut any = false;
    for chunk in entries.iter().filter_map(|entry| entry.bytes.as_ref()) {
        match BASE64.decode(AsRef::<str>::as_ref(chunk)) {
            Ok(bytes) => {
                body.extend_from_slice(&bytes);
                any = true;
            }
            Err(e) => warn!(target: "rpc", "Skipping undecodable request body chunk: {}", e),
        }
    }
    any.then_some(body)
}

/// What to do with a paused request
#[derive(Debug)]
pub enum Disposition {
    /// Not the RPC URL; let it through untouched
    Continue,
    /// Answer with the fork's response
    Fulfill(RerouteReply),
    /// Abort it so the app sees a network error
    Fail(StoryError),
}

/// What the fork answered
#[derive(Debug, Clone)]
pub struct RerouteReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct RpcInterceptor {
    endpoints: ChainEndpoints,
    client: reqwest::Client,
}

impl RpcInterceptor {
    pub fn new(endpoints: ChainEndpoints) -> Self {
        Self {
            endpoints,
            client: reqwest::Client::new(),
        }
    }

    /// Fetch URL pattern matching the remote RPC URL literally
    pub fn url_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.endpoints.remote_rpc_url.len());
        for ch in self.endpoints.remote_rpc_url.chars() {
            if matches!(ch, '*' | '?' | '\\') {
                pattern.push('\\');
            }
            pattern.push(ch);
        }
        pattern
    }

    pub fn matches(&self, url: &str) -> bool {
        url == self.endpoints.remote_rpc_url
    }

    /// Replay a call against the local fork
    pub async fn forward(&self, call: &ForwardedCall) -> Result<RerouteReply> {
        let method = reqwest::Method::from_bytes(call.method.as_bytes())
            .map_err(|e| StoryError::RpcReroute(format!("bad method {}: {}", call.method, e)))?;

        let mut request = self
            .client
            .request(method, &self.endpoints.local_rpc_url)
            .header(reqwest::header::CONTENT_TYPE, call.content_type.as_deref().unwrap_or("application/json"));
        if let Some(body) = &call.body {
            request = request.body(body.clone());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| StoryError::RpcReroute(format!("fork unreachable: {}", e)))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| StoryError::RpcReroute(format!("reading fork response: {}", e)))?
            .to_vec();

        Ok(RerouteReply { status, headers, body })
    }

    /// Start pausing requests to the remote RPC URL on `page`
    pub async fn activate(self: Arc<Self>, page: &Page, tasks: &SessionTasks) -> Result<()> {
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(browser_error)?;

        let pattern = RequestPattern::builder()
            .url_pattern(self.url_pattern())
            .request_stage(RequestStage::Request)
            .build();
        page.execute(fetch::EnableParams::builder().pattern(pattern).build())
            .await
            .map_err(browser_error)?;
        info!(
            "Rerouting chain {} RPC traffic to {}",
            self.endpoints.chain_id, self.endpoints.local_rpc_url
        );

        let page = page.clone();
        let spawner = tasks.clone();
        tasks.spawn(async move {
            while let Some(event) = paused.next().await {
                let interceptor = self.clone();
                let page = page.clone();
                spawner.spawn(async move { interceptor.handle(&page, &event).await });
            }
        });
        Ok(())
    }

    /// Decide the fate of a paused call, replaying it when it targets the RPC URL
    pub async fn decide(&self, call: &ForwardedCall) -> Disposition {
        if !self.matches(&call.url) {
            return Disposition::Continue;
        }
        debug!(target: "rpc", "-> {} {}", call.method, call.body_text());
        match self.forward(call).await {
            Ok(reply) => {
                debug!(target: "rpc", "<- {} {}", reply.status, String::from_utf8_lossy(&reply.body));
                Disposition::Fulfill(reply)
            }
            Err(e) => Disposition::Fail(e),
        }
    }

    async fn handle(&self, page: &Page, event: &EventRequestPaused) {
        let request_id = event.request_id.clone();
        let mut call = ForwardedCall::from_request(&event.request);
        if call.body.is_none() && event.request.has_post_data == Some(true) && self.matches(&call.url) {
            call.body = fetch_post_data(page, event).await;
        }

        match self.decide(&call).await {
            Disposition::Continue => {
                if let Err(e) = page.execute(ContinueRequestParams::new(request_id)).await {
                    debug!("Continuing {} failed: {}", call.url, e);
                }
            }
            Disposition::Fulfill(reply) => {
                if let Err(e) = fulfill(page, request_id, reply).await {
                    warn!(target: "rpc", "Answering {} {} failed: {}", call.method, call.url, e);
                }
            }
            Disposition::Fail(e) => {
                warn!(target: "rpc", "Reroute of {} {} failed: {}", call.method, call.url, e);
                let fail = FailRequestParams::new(request_id, ErrorReason::Failed);
                if let Err(e) = page.execute(fail).await {
                    debug!("Failing paused request: {}", e);
                }
            }
        }
    }
}

/// Body the paused event left out, read back through the Network domain
async fn fetch_post_data(page: &Page, event: &EventRequestPaused) -> Option<Vec<u8>> {
    let network_id = event.network_id.clone()?;
    match page.execute(network::GetRequestPostDataParams::new(network_id)).await {
        Ok(resp) => Some(resp.result.post_data.clone().into_bytes()),
        Err(e) => {
            warn!(target: "rpc", "Reading body of {} failed: {}", event.request.url, e);
            None
        }
    }
}

async fn fulfill(page: &Page, request_id: RequestId, reply: RerouteReply) -> Result<()> {
    let headers: Vec<HeaderEntry> = reply
        .headers
        .into_iter()
        .map(|(name, value)| HeaderEntry::new(name, value))
        .collect();
    let params = FulfillRequestParams::builder()
        .request_id(request_id)
        .response_code(reply.status as i64)
        .response_headers(headers)
        .body(BASE64.encode(&reply.body))
        .build()
        .map_err(StoryError::RpcReroute)?;
    page.execute(params).await.map_err(browser_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn endpoints(remote: &str, local: &str) -> ChainEndpoints {
        ChainEndpoints {
            chain_id: "1".into(),
            remote_rpc_url: remote.into(),
            local_rpc_url: local.into(),
        }
    }

    /// Answers one request with a fixed JSON-RPC body and hands back what it read
    async fn fake_fork() -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = String::new();
            while !seen.contains("eth_blockNumber") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            let body = r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
            seen
        });
        (url, handle)
    }

    #[test]
    fn test_url_pattern_escapes_wildcards() {
        let interceptor = RpcInterceptor::new(endpoints("https://rpc.example/v2/k?x=*", "http://127.0.0.1:8545"));
        assert_eq!(interceptor.url_pattern(), r"https://rpc.example/v2/k\?x=\*");
    }

    #[test]
    fn test_matches_exact_url_only() {
        let interceptor = RpcInterceptor::new(endpoints("https://rpc.example/v2/key", "http://127.0.0.1:8545"));
        assert!(interceptor.matches("https://rpc.example/v2/key"));
        assert!(!interceptor.matches("https://rpc.example/v2/key/extra"));
        assert!(!interceptor.matches("https://other.example/"));
    }

    #[tokio::test]
    async fn test_forward_replays_against_local_fork() {
        let (local, server) = fake_fork().await;
        let interceptor = RpcInterceptor::new(endpoints("https://rpc.example/v2/key", &local));
        let call = ForwardedCall {
            method: "POST".into(),
            url: "https://rpc.example/v2/key".into(),
            content_type: Some("application/json".into()),
            body: Some(r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#.into()),
        };

        let reply = interceptor.forward(&call).await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(String::from_utf8(reply.body).unwrap(), r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#);
        assert!(reply.headers.iter().any(|(k, _)| k == "content-type"));
        assert!(!reply.headers.iter().any(|(k, _)| k == "connection"));

        let seen = server.await.unwrap();
        assert!(seen.starts_with("POST / HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_forward_to_dead_fork_is_reroute_error() {
        let interceptor = RpcInterceptor::new(endpoints("https://rpc.example", "http://127.0.0.1:9"));
        let call = ForwardedCall {
            method: "POST".into(),
            url: "https://rpc.example".into(),
            content_type: None,
            body: Some("{}".into()),
        };
        let err = interceptor.forward(&call).await.unwrap_err();
        assert!(matches!(err, StoryError::RpcReroute(_)));
    }

    /// A paused JSON-RPC POST as Chromium reports it, body split in two chunks
    fn rpc_request(url: &str) -> network::Request {
        serde_json::from_value(json!({
            "url": url,
            "method": "POST",
            "headers": {"Content-Type": "application/json", "Accept": "*/*"},
            "hasPostData": true,
            "postDataEntries": [
                {"bytes": BASE64.encode(r#"{"jsonrpc":"2.0","id":1,"#)},
                {"bytes": BASE64.encode(r#""method":"eth_blockNumber","params":[]}"#)},
            ],
            "initialPriority": "High",
            "referrerPolicy": "strict-origin-when-cross-origin",
        }))
        .unwrap()
    }

    #[test]
    fn test_call_from_request_joins_body_chunks() {
        let call = ForwardedCall::from_request(&rpc_request("https://rpc.example/v2/key"));
        assert_eq!(call.method, "POST");
        assert_eq!(call.content_type.as_deref(), Some("application/json"));
        assert_eq!(
            call.body_text(),
            r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#
        );
    }

    #[test]
    fn test_call_from_request_without_body() {
        let request: network::Request = serde_json::from_value(json!({
            "url": "https://app.example/",
            "method": "GET",
            "headers": {},
            "initialPriority": "VeryHigh",
            "referrerPolicy": "no-referrer",
        }))
        .unwrap();
        let call = ForwardedCall::from_request(&request);
        assert!(call.body.is_none());
        assert!(call.content_type.is_none());
    }

    #[tokio::test]
    async fn test_decide_lets_other_urls_through() {
        let interceptor = RpcInterceptor::new(endpoints("https://rpc.example/v2/key", "http://127.0.0.1:9"));
        let call = ForwardedCall::from_request(&rpc_request("https://api.example/prices"));
        assert!(matches!(interceptor.decide(&call).await, Disposition::Continue));
    }

    #[tokio::test]
    async fn test_decide_fails_request_when_fork_is_down() {
        let interceptor = RpcInterceptor::new(endpoints("https://rpc.example/v2/key", "http://127.0.0.1:9"));
        let call = ForwardedCall::from_request(&rpc_request("https://rpc.example/v2/key"));
        match interceptor.decide(&call).await {
            Disposition::Fail(StoryError::RpcReroute(_)) => {}
            other => panic!("expected a failed request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decide_fulfills_from_fork_with_full_body() {
        let (local, server) = fake_fork().await;
        let interceptor = RpcInterceptor::new(endpoints("https://rpc.example/v2/key", &local));
        let call = ForwardedCall::from_request(&rpc_request("https://rpc.example/v2/key"));

        match interceptor.decide(&call).await {
            Disposition::Fulfill(reply) => assert_eq!(reply.status, 200),
            other => panic!("expected a fulfilled request, got {:?}", other),
        }
        let seen = server.await.unwrap();
        assert!(seen.contains(r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#));
    }
}
