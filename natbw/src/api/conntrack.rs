use crate::api::{HttpRequest, HttpResponse};
use crate::flow::{self, FlowClassifier};
use crate::monitor::conntrack::dump_flows;
use anyhow::Result;
use natbw_common::{FlowClass, FlowRecord};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Connection tracking API handler.
///
/// Dumps are serialized through one lock, concurrent requests wait their turn.
#[derive(Clone)]
pub struct ConntrackApiHandler {
    classifier: Arc<FlowClassifier>,
    conntrack_path: String,
    dump_lock: Arc<Mutex<()>>,
}

impl ConntrackApiHandler {
    pub fn new(classifier: Arc<FlowClassifier>, conntrack_path: &str) -> Self {
        Self {
            classifier,
            conntrack_path: conntrack_path.to_string(),
            dump_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn flows(
        &self,
        ip: Option<IpAddr>,
        class: Option<FlowClass>,
        order: &[String],
    ) -> Result<Vec<FlowRecord>> {
        let _guard = self.dump_lock.lock().await;

        let classifier = Arc::clone(&self.classifier);
        let path = self.conntrack_path.clone();
        let mut flows =
            tokio::task::spawn_blocking(move || dump_flows(&path, &classifier)).await??;

        if let Some(ip) = ip {
            flows = flow::filter_by_ip(flows, &ip);
        }
        if let Some(class) = class {
            flows = flow::filter_by_class(flows, class, &self.classifier);
        }
        flow::order_by(&mut flows, order);

        Ok(flows
            .iter()
            .map(|f| self.classifier.to_record(f))
            .collect())
    }

    pub async fn handle_request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        if request.method != "GET" {
            return Ok(HttpResponse::error(405, "Method Not Allowed".to_string()));
        }

        let ip = match request.query("ip").filter(|s| !s.is_empty()) {
            Some(text) => match text.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    return Ok(HttpResponse::error(400, format!("Invalid ip '{}'", text)));
                }
            },
            None => None,
        };

        let class = match request.query("class").filter(|s| !s.is_empty()) {
            Some(name) => match FlowClass::from_name(name) {
                Some(class) => Some(class),
                None => {
                    return Ok(HttpResponse::error(400, format!("Unknown class '{}'", name)));
                }
            },
            None => None,
        };

        match self.flows(ip, class, request.query_all("o")).await {
            Ok(records) => Ok(HttpResponse::ok(serde_json::to_string(&records)?)),
            Err(e) => {
                log::error!("Failed to read conntrack table: {}", e);
                Ok(HttpResponse::error(500, e.to_string()))
            }
        }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        vec!["/v1/conntrack"]
    }
}
