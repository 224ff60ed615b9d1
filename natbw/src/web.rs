use crate::api::{parse_http_request, send_http_response, ApiRouter, HttpResponse};
use crate::command::Options;
use log::info;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Largest accepted request, headers and body together
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

// Simple HTTP/1.1 server on top of tokio, one request per connection
pub async fn start_server(
    options: Options,
    api_router: ApiRouter,
    shutdown_notify: Arc<Notify>,
) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(options.listen()).await?;
    info!("HTTP server listening on {}", options.listen());

    let api_router = Arc::new(api_router);
    let web_log = options.web_log();
    let shutdown = shutdown_notify.notified();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let api_router = Arc::clone(&api_router);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &api_router, web_log, peer).await {
                        log::debug!("Error handling connection from {}: {}", peer, e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Web server received shutdown signal, stopping...");
                break;
            }
        }
    }

    Ok(())
}

/// Length of the head including the blank line, once it has been received
fn header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn content_length(head: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(head).lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

enum ReadOutcome {
    Complete(Vec<u8>),
    TooLarge,
    Closed,
}

async fn read_request(stream: &mut TcpStream) -> Result<ReadOutcome, anyhow::Error> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = header_end(&buffer) {
            let total = end + content_length(&buffer[..end]).unwrap_or(0);
            if total > MAX_REQUEST_SIZE {
                return Ok(ReadOutcome::TooLarge);
            }
            if buffer.len() >= total {
                buffer.truncate(total);
                return Ok(ReadOutcome::Complete(buffer));
            }
        } else if buffer.len() > MAX_REQUEST_SIZE {
            return Ok(ReadOutcome::TooLarge);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(if buffer.is_empty() {
                ReadOutcome::Closed
            } else {
                ReadOutcome::Complete(buffer)
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Completes once the peer has closed the connection or the socket failed.
///
/// Anything sent after the request is discarded.
async fn peer_closed(stream: &mut TcpStream) {
    let mut chunk = [0u8; 512];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    api_router: &ApiRouter,
    web_log: bool,
    peer: std::net::SocketAddr,
) -> Result<(), anyhow::Error> {
    let started = Instant::now();

    let raw = match read_request(&mut stream).await? {
        ReadOutcome::Complete(raw) => raw,
        ReadOutcome::TooLarge => {
            let response = HttpResponse::error(400, "Request too large".to_string());
            return send_http_response(&mut stream, &response).await;
        }
        ReadOutcome::Closed => return Ok(()),
    };

    let (response, target) = match parse_http_request(&raw) {
        Ok(request) => {
            let target = format!("{} {}", request.method, request.path);
            // Dropping the handler future cancels its work, running scans included
            let routed = tokio::select! {
                routed = api_router.route_request(&request) => routed,
                _ = peer_closed(&mut stream) => {
                    log::debug!("{} closed the connection during \"{}\"", peer, target);
                    return Ok(());
                }
            };
            let response = match routed {
                Ok(response) => response,
                Err(e) => {
                    log::error!("Error handling {}: {}", target, e);
                    HttpResponse::error(500, e.to_string())
                }
            };
            (response, target)
        }
        Err(e) => (HttpResponse::error(400, e.to_string()), "-".to_string()),
    };

    send_http_response(&mut stream, &response).await?;

    if web_log {
        info!(
            "{} \"{}\" {} {}B {}ms",
            peer,
            target,
            response.status,
            response.body.len(),
            started.elapsed().as_millis()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody"), Some(27));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }

    #[test]
    fn test_content_length() {
        assert_eq!(
            content_length(b"POST / HTTP/1.1\r\ncontent-length: 12\r\n\r\n"),
            Some(12)
        );
        assert_eq!(content_length(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), None);
    }

    async fn roundtrip(router: ApiRouter, request: Vec<u8>) -> String {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_connection(stream, &router, true, peer).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request).await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        server.await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_routing_over_tcp() {
        use crate::api::{nmap::NmapApiHandler, ApiHandler};

        let mut router = ApiRouter::new();
        router.register_handler(ApiHandler::Nmap(NmapApiHandler::new()));

        let response = roundtrip(router.clone(), b"GET /nothing HTTP/1.1\r\n\r\n".to_vec()).await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let response =
            roundtrip(router.clone(), b"GET /v0/nmap/?ip=bogus HTTP/1.1\r\n\r\n".to_vec()).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Connection: close"));

        let response =
            roundtrip(router, b"POST /v0/nmap/ HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}".to_vec())
                .await;
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    }

    fn process_running(pid: u32) -> bool {
        // Killed children linger as zombies until reaped
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map_or(false, |(_, rest)| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_kills_scan() {
        use crate::api::{nmap::NmapApiHandler, ApiHandler};
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;

        let dir = std::env::temp_dir().join(format!("natbw-web-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let pid_file = dir.join("scanner.pid");
        let scanner = dir.join("slow-scanner");
        std::fs::write(
            &scanner,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&scanner, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut router = ApiRouter::new();
        router.register_handler(ApiHandler::Nmap(NmapApiHandler::with_program(
            scanner.to_string_lossy(),
            Duration::from_secs(60),
        )));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_connection(stream, &router, false, peer).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /v0/nmap/?ip=127.0.0.1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut pid = None;
        for _ in 0..100 {
            pid = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            if pid.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let pid = pid.expect("scanner did not start");
        assert!(process_running(pid));

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("connection handler kept running")
            .unwrap()
            .unwrap();

        let mut running = true;
        for _ in 0..100 {
            running = process_running(pid);
            if !running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        std::fs::remove_dir_all(&dir).ok();
        assert!(!running, "scanner {} outlived its client", pid);
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let head = format!(
            "POST /v1/stats/ HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_SIZE + 1
        );
        let response = roundtrip(ApiRouter::new(), head.into_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Request too large"));
    }
}
