use crate::api::{HttpRequest, HttpResponse};
use anyhow::Result;
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;

const SCAN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Port scan of a single host through the `nmap` binary
#[derive(Clone)]
pub struct NmapApiHandler {
    program: String,
    timeout: Duration,
}

impl NmapApiHandler {
    pub fn new() -> Self {
        Self {
            program: "nmap".to_string(),
            timeout: SCAN_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_program(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn scan_args(ip: &IpAddr) -> Vec<String> {
        let mut args = vec!["-v".to_string(), "-A".to_string(), "-T4".to_string()];
        if ip.is_ipv6() {
            args.push("-6".to_string());
        }
        args.push(ip.to_string());
        args
    }

    async fn scan(&self, ip: IpAddr) -> Result<String> {
        let args = Self::scan_args(&ip);
        let mut report = format!("running: {} {}\n\n", self.program, args.join(" "));

        // The child is killed when the request future is dropped
        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => {
                report.push_str(&String::from_utf8_lossy(&output.stdout));
                report.push_str(&String::from_utf8_lossy(&output.stderr));
                if !output.status.success() {
                    report.push_str(&format!("\n{} exited with {}\n", self.program, output.status));
                }
            }
            Ok(Err(e)) => {
                log::error!("Failed to run {}: {}", self.program, e);
                report.push_str(&format!("failed to run {}: {}\n", self.program, e));
            }
            Err(_) => {
                log::warn!("Scan of {} timed out after {:?}", ip, self.timeout);
                report.push_str(&format!("timed out after {} seconds\n", self.timeout.as_secs()));
            }
        }
        Ok(report)
    }

    pub async fn handle_request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        if request.method != "GET" {
            return Ok(HttpResponse::error(405, "Method Not Allowed".to_string()));
        }

        let ip = match request.query("ip").map(str::parse::<IpAddr>) {
            Some(Ok(ip)) => ip,
            Some(Err(_)) => {
                return Ok(HttpResponse::error(400, "Invalid ip parameter".to_string()));
            }
            None => {
                return Ok(HttpResponse::error(400, "Missing ip parameter".to_string()));
            }
        };

        log::info!("Starting port scan of {}", ip);
        Ok(HttpResponse::text(self.scan(ip).await?))
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        vec!["/v0/nmap/"]
    }
}
