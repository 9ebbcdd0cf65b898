use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::thread;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{info, warn};
use v2x_core::{MessageClass, MessageFilter, Protocol, RunStatus};
use v2x_metrics::MetricsEngine;
use v2x_runner::{Orchestrator, SubmitOutcome, SubmitRequest};

/// Control surface over one orchestrator and metrics engine.
#[derive(Clone)]
pub struct Api {
    orchestrator: Orchestrator,
    metrics: MetricsEngine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(status: u16, payload: Value) -> Self {
        let mut body = json!({ "ok": true });
        if let (Some(obj), Value::Object(extra)) = (body.as_object_mut(), payload) {
            obj.extend(extra);
        }
        Self { status, body }
    }

    fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({
                "ok": false,
                "error": { "code": code, "message": message.into() }
            }),
        }
    }
}

impl Api {
    pub fn new(orchestrator: Orchestrator, metrics: MetricsEngine) -> Self {
        Self {
            orchestrator,
            metrics,
        }
    }

    /// Blocks serving requests; each request runs on its own thread since
    /// cancellation can wait out the grace period.
    pub fn serve(self, bind: &str) -> Result<()> {
        let server = Server::http(bind)
            .map_err(|e| anyhow::anyhow!("bind_failed: {}: {}", bind, e))?;
        info!(bind, "control api listening");
        for request in server.incoming_requests() {
            let api = self.clone();
            let spawned = thread::Builder::new()
                .name("api-request".to_string())
                .spawn(move || api.respond(request));
            if let Err(err) = spawned {
                warn!(error = %err, "api: cannot spawn request thread");
            }
        }
        Ok(())
    }

    fn respond(&self, mut request: Request) {
        let mut body = String::new();
        if let Err(err) = request.as_reader().read_to_string(&mut body) {
            warn!(error = %err, "api: unreadable request body");
        }
        let method = request.method().clone();
        let url = request.url().to_string();
        let response = self.handle(&method, &url, &body);
        info!(method = %method, url = %url, status = response.status, "api request");

        let payload = serde_json::to_vec(&response.body).unwrap_or_else(|_| b"{}".to_vec());
        let mut http = Response::from_data(payload).with_status_code(response.status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            http = http.with_header(header);
        }
        if let Err(err) = request.respond(http) {
            warn!(error = %err, "api: failed to write response");
        }
    }

    pub fn handle(&self, method: &Method, url: &str, body: &str) -> ApiResponse {
        let (path, query) = split_url(url);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let result = match (method, segments.as_slice()) {
            (Method::Post, ["experiments"]) => return self.submit(body),
            (Method::Get, ["experiments"]) => self.list(&query),
            (Method::Get, ["experiments", "running"]) => self
                .orchestrator
                .running()
                .map(|run| json!({ "run": run })),
            (Method::Get, ["experiments", id]) => {
                with_id(id, |id| self.orchestrator.status(id).map(|run| json!({ "run": run })))
            }
            (Method::Post, ["experiments", id, "cancel"]) => {
                with_id(id, |id| self.orchestrator.cancel(id).map(|run| json!({ "run": run })))
            }
            (Method::Get, ["experiments", id, "results"]) => {
                with_id(id, |id| self.orchestrator.results(id).map(|r| json!({ "results": r })))
            }
            (Method::Get, ["metrics"]) => self.metrics(&query),
            (Method::Post, ["cleanup"]) => self.cleanup(&query),
            _ => {
                return ApiResponse::error(404, "not_found", format!("no route for {} {}", method, path))
            }
        };
        match result {
            Ok(payload) => ApiResponse::ok(200, payload),
            Err(err) => error_response(&err),
        }
    }

    fn submit(&self, body: &str) -> ApiResponse {
        let req: SubmitRequest = match serde_json::from_str(body) {
            Ok(req) => req,
            Err(err) => return ApiResponse::error(400, "invalid_request", err.to_string()),
        };
        match self.orchestrator.submit(&req) {
            Ok(outcome) => {
                let status = match &outcome {
                    SubmitOutcome::Accepted { .. } => 202,
                    SubmitOutcome::Blocked { .. } => 409,
                    SubmitOutcome::Rejected { .. } => 400,
                };
                let accepted = status == 202;
                let mut response = ApiResponse::ok(status, json!({ "outcome": outcome }));
                response.body["ok"] = json!(accepted);
                response
            }
            Err(err) => error_response(&err),
        }
    }

    fn list(&self, query: &HashMap<String, String>) -> Result<Value> {
        let limit = query
            .get("limit")
            .map(|v| v.parse::<usize>().context("bad_request: limit must be a number"))
            .transpose()?;
        let status = query
            .get("status")
            .map(|v| {
                RunStatus::parse(v).ok_or_else(|| anyhow::anyhow!("bad_request: unknown status {}", v))
            })
            .transpose()?;
        let runs = self.orchestrator.list(limit, status)?;
        Ok(json!({ "runs": runs }))
    }

    fn metrics(&self, query: &HashMap<String, String>) -> Result<Value> {
        let filter = filter_from_query(query)?;
        Ok(json!({
            "kpis": self.metrics.kpis(&filter)?,
            "protocol_comparison": self.metrics.compare_protocols(&filter)?,
            "protocol_summary": self.metrics.protocol_summary()?,
        }))
    }

    fn cleanup(&self, query: &HashMap<String, String>) -> Result<Value> {
        let days = match query.get("days") {
            Some(v) => v.parse::<u32>().context("bad_request: days must be a number")?,
            None => 30,
        };
        Ok(json!({ "cleanup": self.orchestrator.cleanup(days)? }))
    }
}

fn with_id<F>(raw: &str, f: F) -> Result<Value>
where
    F: FnOnce(i64) -> Result<Value>,
{
    let id = raw
        .parse::<i64>()
        .with_context(|| format!("bad_request: invalid run id {}", raw))?;
    f(id)
}

pub fn filter_from_query(query: &HashMap<String, String>) -> Result<MessageFilter> {
    let mut filter = MessageFilter::default();
    if let Some(class) = query.get("class") {
        filter.message_class = Some(
            MessageClass::parse(class)
                .ok_or_else(|| anyhow::anyhow!("bad_request: unknown class {}", class))?,
        );
    }
    if let Some(protocol) = query.get("protocol") {
        filter.protocol = Some(
            Protocol::parse(protocol)
                .ok_or_else(|| anyhow::anyhow!("bad_request: unknown protocol {}", protocol))?,
        );
    }
    if let Some(vehicle) = query.get("vehicle_id") {
        filter.vehicle_id = Some(vehicle.clone());
    }
    Ok(filter)
}

fn split_url(url: &str) -> (&str, HashMap<String, String>) {
    let (path, raw_query) = url.split_once('?').unwrap_or((url, ""));
    let query = form_urlencoded::parse(raw_query.as_bytes())
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    (path, query)
}

fn error_response(err: &anyhow::Error) -> ApiResponse {
    let message = err.to_string();
    let code = message
        .split_once(':')
        .map(|(code, _)| code)
        .filter(|code| !code.contains(' '))
        .unwrap_or("internal_error")
        .to_string();
    let status = match code.as_str() {
        "run_not_found" | "results_missing" => 404,
        "cancel_not_active" | "results_unavailable" => 409,
        "bad_request" => 400,
        _ => 500,
    };
    ApiResponse::error(status, &code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use v2x_core::{MessageRecord, Store, TestbedConfig};

    fn api(tag: &str) -> (Api, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "v2x_api_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let config = TestbedConfig {
            outputs_dir: root.join("outputs"),
            experiment_command: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            clear_command: vec!["true".to_string()],
            cancel_grace_secs: 1,
            min_free_bytes: 0,
            ..TestbedConfig::default()
        };
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let api = Api::new(
            Orchestrator::new(store.clone(), config),
            MetricsEngine::new(store),
        );
        (api, root)
    }

    #[test]
    fn submit_then_block_then_cancel() {
        let (api, root) = api("flow");
        let body = r#"{"name":"api_run","duration_seconds":60,"network_profile":"normal"}"#;
        let first = api.handle(&Method::Post, "/experiments", body);
        assert_eq!(first.status, 202, "{}", first.body);
        assert_eq!(first.body["outcome"]["status"], "accepted");
        let run_id = first.body["outcome"]["run_id"].as_i64().expect("run id");

        let second = api.handle(
            &Method::Post,
            "/experiments",
            r#"{"name":"other","duration_seconds":60,"network_profile":"normal"}"#,
        );
        assert_eq!(second.status, 409);
        assert_eq!(second.body["outcome"]["status"], "blocked");

        let running = api.handle(&Method::Get, "/experiments/running", "");
        assert_eq!(running.body["run"]["id"], run_id);

        let cancel = api.handle(&Method::Post, &format!("/experiments/{}/cancel", run_id), "");
        assert_eq!(cancel.status, 200, "{}", cancel.body);
        assert_eq!(cancel.body["run"]["status"], "cancelled");

        let again = api.handle(&Method::Post, &format!("/experiments/{}/cancel", run_id), "");
        assert_eq!(again.status, 409);
        assert_eq!(again.body["error"]["code"], "cancel_not_active");

        let results = api.handle(&Method::Get, &format!("/experiments/{}/results", run_id), "");
        assert_eq!(results.status, 409);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn validation_and_routing_errors() {
        let (api, root) = api("errors");
        let rejected = api.handle(
            &Method::Post,
            "/experiments",
            r#"{"name":"x","duration_seconds":5,"network_profile":"normal"}"#,
        );
        assert_eq!(rejected.status, 400);
        assert_eq!(
            rejected.body["outcome"]["reason"],
            "Duration must be between 10 and 300 seconds"
        );
        assert_eq!(api.handle(&Method::Post, "/experiments", "not json").status, 400);
        assert_eq!(api.handle(&Method::Get, "/experiments/42", "").status, 404);
        assert_eq!(api.handle(&Method::Get, "/experiments/abc", "").status, 400);
        assert_eq!(api.handle(&Method::Delete, "/experiments", "").status, 404);
        assert_eq!(api.handle(&Method::Get, "/metrics?class=bogus", "").status, 400);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn metrics_respect_query_filters() {
        let (api, root) = api("metrics");
        for (i, protocol) in [Protocol::Udp, Protocol::Udp, Protocol::Mqtt].into_iter().enumerate() {
            api.orchestrator
                .store()
                .insert_message(&MessageRecord {
                    message_id: format!("TEL_V_{}", i),
                    vehicle_id: "V".to_string(),
                    message_class: MessageClass::Telemetry,
                    send_timestamp: i as f64,
                    receive_timestamp: i as f64 + 0.01,
                    latency_ms: 10.0,
                    protocol,
                    sequence_gap: 0,
                    payload_size: 64,
                    created_at: None,
                })
                .expect("insert");
        }
        let all = api.handle(&Method::Get, "/metrics", "");
        assert_eq!(all.status, 200);
        assert_eq!(all.body["kpis"]["packet_loss"]["total_received"], 3);
        let udp = api.handle(&Method::Get, "/metrics?protocol=UDP&class=telemetry", "");
        assert_eq!(udp.body["kpis"]["packet_loss"]["total_received"], 2);
        assert_eq!(udp.body["protocol_summary"]["MQTT"]["total_messages"], 1);

        let cleanup = api.handle(&Method::Post, "/cleanup?days=7", "");
        assert_eq!(cleanup.status, 200);
        assert_eq!(cleanup.body["cleanup"]["deleted"], 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn query_strings_are_split() {
        let (path, query) = split_url("/experiments?limit=5&status=completed&empty=");
        assert_eq!(path, "/experiments");
        assert_eq!(query.get("limit").map(String::as_str), Some("5"));
        assert!(!query.contains_key("empty"));

        let (_, query) = split_url("/metrics?vehicle_id=VEH%5F001&class=safety+");
        assert_eq!(query.get("vehicle_id").map(String::as_str), Some("VEH_001"));
        assert_eq!(query.get("class").map(String::as_str), Some("safety "));
    }
}
