pub mod conntrack;
pub mod nmap;
pub mod stats;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::net::TcpStream;

/// Error body of every JSON endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message),
        }
    }
}

/// HTTP request information
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, Vec<String>>,
}

impl HttpRequest {
    /// First value of a query parameter
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_params
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of a repeatable query parameter, in request order
    pub fn query_all(&self, key: &str) -> &[String] {
        self.query_params
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// HTTP response
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body,
        }
    }

    pub fn text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            body,
        }
    }

    pub fn error(status: u16, message: String) -> Self {
        let error_response = ApiResponse::error(message);
        let body = serde_json::to_string(&error_response)
            .unwrap_or_else(|_| r#"{"status":"error","message":"JSON serialization failed"}"#.to_string());
        Self {
            status,
            content_type: "application/json".to_string(),
            body,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: "Not Found".to_string(),
        }
    }
}

/// API handlers of the different modules
#[derive(Clone)]
pub enum ApiHandler {
    Stats(crate::api::stats::StatsApiHandler),
    Conntrack(crate::api::conntrack::ConntrackApiHandler),
    Nmap(crate::api::nmap::NmapApiHandler),
}

impl ApiHandler {
    pub fn module_name(&self) -> &'static str {
        match self {
            ApiHandler::Stats(_) => "stats",
            ApiHandler::Conntrack(_) => "conntrack",
            ApiHandler::Nmap(_) => "nmap",
        }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        match self {
            ApiHandler::Stats(handler) => handler.supported_routes(),
            ApiHandler::Conntrack(handler) => handler.supported_routes(),
            ApiHandler::Nmap(handler) => handler.supported_routes(),
        }
    }

    pub async fn handle_request(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        match self {
            ApiHandler::Stats(handler) => handler.handle_request(request).await,
            ApiHandler::Conntrack(handler) => handler.handle_request(request).await,
            ApiHandler::Nmap(handler) => handler.handle_request(request).await,
        }
    }
}

/// API router, dispatches requests to the module handlers
#[derive(Clone)]
pub struct ApiRouter {
    handlers: HashMap<String, ApiHandler>,
}

impl ApiRouter {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Register an API handler for a module
    pub fn register_handler(&mut self, handler: ApiHandler) {
        self.handlers.insert(handler.module_name().to_string(), handler);
    }

    pub fn routes(&self) -> Vec<&'static str> {
        let mut routes: Vec<&'static str> = self
            .handlers
            .values()
            .flat_map(|h| h.supported_routes())
            .collect();
        routes.sort_unstable();
        routes
    }

    /// Route a request to the appropriate handler
    pub async fn route_request(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        for handler in self.handlers.values() {
            for route in handler.supported_routes() {
                if request.path.starts_with(route) {
                    return handler.handle_request(request).await;
                }
            }
        }

        Ok(HttpResponse::not_found())
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `application/x-www-form-urlencoded` text, invalid escapes are kept as is
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match (
                bytes.get(i + 1).copied().and_then(hex_value),
                bytes.get(i + 2).copied().and_then(hex_value),
            ) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse the query part of a URL, keys may repeat
pub fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for param in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        params
            .entry(percent_decode(key))
            .or_default()
            .push(percent_decode(value));
    }
    params
}

/// Parse an HTTP request from raw bytes
pub fn parse_http_request(request_bytes: &[u8]) -> Result<HttpRequest, anyhow::Error> {
    let request_str = String::from_utf8_lossy(request_bytes);
    let lines: Vec<&str> = request_str.lines().collect();

    if lines.is_empty() {
        return Err(anyhow::anyhow!("Empty request"));
    }

    let parts: Vec<&str> = lines[0].split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow::anyhow!("Invalid request line"));
    }

    let method = parts[0].to_string();
    let (path, query_params) = match parts[1].split_once('?') {
        Some((path, query)) => (percent_decode(path), parse_query(query)),
        None => (percent_decode(parts[1]), HashMap::new()),
    };

    Ok(HttpRequest {
        method,
        path,
        query_params,
    })
}

/// Send an HTTP response to the client
pub async fn send_http_response(stream: &mut TcpStream, response: &HttpResponse) -> Result<(), anyhow::Error> {
    use tokio::io::AsyncWriteExt;

    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    let http_response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        status_text,
        response.content_type,
        response.body.len(),
        response.body
    );

    stream.write_all(http_response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_with_repeated_params() {
        let raw = b"GET /v1/conntrack?o=ttl&o=orig_src&ip=10.0.0.5 HTTP/1.1\r\nHost: router\r\n\r\n";
        let request = parse_http_request(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/v1/conntrack");
        assert_eq!(request.query_all("o"), ["ttl", "orig_src"]);
        assert_eq!(request.query("ip"), Some("10.0.0.5"));
        assert_eq!(request.query("missing"), None);
        assert!(request.query_all("missing").is_empty());
    }

    #[test]
    fn test_percent_encoded_params() {
        let raw = b"GET /v1/stats/?name=living%20room+tv&hwaddr=00%3A11%3a22%3A33%3A44%3A55 HTTP/1.1\r\n\r\n";
        let request = parse_http_request(raw).unwrap();
        assert_eq!(request.query("name"), Some("living room tv"));
        assert_eq!(request.query("hwaddr"), Some("00:11:22:33:44:55"));
    }

    #[test]
    fn test_percent_decode_invalid_escapes() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("a%2"), "a%2");
    }

    #[test]
    fn test_parse_request_with_body() {
        // Bodies are read off the socket but not kept
        let raw = b"POST /v1/stats/ HTTP/1.1\r\nContent-Length: 4\r\n\r\ntest";
        let request = parse_http_request(raw).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/v1/stats/");
        assert!(request.query_params.is_empty());
    }

    #[test]
    fn test_invalid_requests() {
        assert!(parse_http_request(b"").is_err());
        assert!(parse_http_request(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn test_error_response_body() {
        let response = HttpResponse::error(500, "boom".to_string());
        assert_eq!(response.status, 500);
        assert_eq!(response.body, r#"{"status":"error","message":"boom"}"#);
    }
}
