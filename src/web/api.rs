use super::error_reply;
use crate::config::SessionConfig;
use crate::flow::{FlowId, RequestModification, ResponseModification, Stage};
use crate::rules::Rule;
use crate::session::SessionController;
use crate::throttle::ThrottleProfile;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub fn routes(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let session = session_routes(controller.clone());
    let rules = rules_routes(controller.clone());
    let throttle = throttle_routes(controller.clone());
    let flows = flows_routes(controller.clone());
    let inspect = inspect_routes(controller);

    warp::path("api").and(session.or(rules).or(throttle).or(flows).or(inspect))
}

fn session_routes(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let status = warp::path!("session")
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .and_then(session_status);

    // An empty body starts with the configured defaults
    let start = warp::path!("session" / "start")
        .and(warp::post())
        .and(optional_json::<SessionConfig>())
        .and(with_controller(controller.clone()))
        .and_then(start_session);

    let stop = warp::path!("session" / "stop")
        .and(warp::post())
        .and(with_controller(controller))
        .and_then(stop_session);

    status.or(start).or(stop)
}

fn rules_routes(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let get = warp::path!("rules")
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .and_then(get_rules);

    let put = warp::path!("rules")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_controller(controller))
        .and_then(set_rules);

    get.or(put)
}

fn throttle_routes(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let get = warp::path!("throttle")
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .and_then(get_throttle);

    let put = warp::path!("throttle")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_controller(controller))
        .and_then(set_throttle);

    get.or(put)
}

fn flows_routes(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("flows")
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .and_then(list_flows);

    let get = warp::path!("flows" / String)
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .and_then(get_flow);

    let pause = warp::path!("flows" / String / "pause")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_controller(controller.clone()))
        .and_then(pause_flow);

    let resume = warp::path!("flows" / String / "resume")
        .and(warp::post())
        .and(optional_json::<ResumeRequest>())
        .and(with_controller(controller.clone()))
        .and_then(resume_flow);

    let abort = warp::path!("flows" / String / "abort")
        .and(warp::post())
        .and(with_controller(controller))
        .and_then(abort_flow);

    list.or(get).or(pause).or(resume).or(abort)
}

fn inspect_routes(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let breakpoints = warp::path!("breakpoints")
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .and_then(list_breakpoints);

    let certificate = warp::path!("certificate")
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .and_then(certificate_status);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_controller(controller))
        .and_then(get_metrics);

    breakpoints.or(certificate).or(metrics)
}

fn with_controller(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = (Arc<SessionController>,), Error = Infallible> + Clone {
    warp::any().map(move || controller.clone())
}

/// JSON body that may be absent or empty.
fn optional_json<T>() -> impl Filter<Extract = (Option<T>,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    warp::body::bytes().and_then(|body: bytes::Bytes| async move {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice::<T>(&body).map(Some).map_err(|e| {
            warp::reject::custom(BadRequest(format!("Request body deserialize error: {}", e)))
        })
    })
}

#[derive(Debug)]
pub(super) struct BadRequest(pub String);

impl warp::reject::Reject for BadRequest {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PauseRequest {
    stage: Stage,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeRequest {
    #[serde(default)]
    request: Option<RequestModification>,
    #[serde(default)]
    response: Option<ResponseModification>,
}

fn ok_json<T: serde::Serialize>(value: &T) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(value), StatusCode::OK)
}

async fn session_status(
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    Ok(ok_json(&controller.status()))
}

async fn start_session(
    config: Option<SessionConfig>,
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    let config = config.unwrap_or_else(|| controller.status().config());
    Ok(match controller.start(config).await {
        Ok(session) => ok_json(&session),
        Err(e) => error_reply(&e),
    })
}

async fn stop_session(controller: Arc<SessionController>) -> Result<impl Reply, Infallible> {
    Ok(match controller.stop().await {
        Ok(report) => ok_json(&report),
        Err(e) => error_reply(&e),
    })
}

async fn get_rules(controller: Arc<SessionController>) -> Result<impl Reply, Infallible> {
    Ok(ok_json(&controller.rules()))
}

async fn set_rules(
    rules: Vec<Rule>,
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    Ok(match controller.set_rules(rules) {
        Ok(()) => ok_json(&controller.rules()),
        Err(e) => error_reply(&e),
    })
}

async fn get_throttle(controller: Arc<SessionController>) -> Result<impl Reply, Infallible> {
    Ok(ok_json(&controller.throttle()))
}

async fn set_throttle(
    profile: ThrottleProfile,
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    Ok(match controller.set_throttle(profile) {
        Ok(()) => ok_json(&controller.throttle()),
        Err(e) => error_reply(&e),
    })
}

async fn list_flows(controller: Arc<SessionController>) -> Result<impl Reply, Infallible> {
    Ok(ok_json(&serde_json::json!({
        "active": controller.active_flows(),
        "recent": controller.recent_flows(),
    })))
}

async fn get_flow(
    id: String,
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    Ok(match controller.flow(&FlowId::new(id.clone())) {
        Some(flow) => ok_json(&flow),
        None => error_reply(&crate::error::ControlError::FlowNotFound(id)),
    })
}

async fn pause_flow(
    id: String,
    body: PauseRequest,
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    let timeout = body.timeout_ms.map(Duration::from_millis);
    Ok(
        match controller
            .pause_flow(&FlowId::new(id), body.stage, timeout)
            .await
        {
            Ok(ticket) => ok_json(&ticket),
            Err(e) => error_reply(&e),
        },
    )
}

async fn resume_flow(
    id: String,
    body: Option<ResumeRequest>,
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    let body = body.unwrap_or_default();
    Ok(
        match controller
            .resume_flow(&FlowId::new(id), body.request, body.response)
            .await
        {
            Ok(flow) => ok_json(&flow),
            Err(e) => error_reply(&e),
        },
    )
}

async fn abort_flow(
    id: String,
    controller: Arc<SessionController>,
) -> Result<impl Reply, Infallible> {
    Ok(match controller.abort_flow(&FlowId::new(id)).await {
        Ok(flow) => ok_json(&flow),
        Err(e) => error_reply(&e),
    })
}

async fn list_breakpoints(controller: Arc<SessionController>) -> Result<impl Reply, Infallible> {
    let (timeout_policy, stop_policy) = controller.breakpoint_policies();
    Ok(ok_json(&serde_json::json!({
        "timeoutPolicy": timeout_policy,
        "stopPolicy": stop_policy,
        "pending": controller.pending_breakpoints(),
    })))
}

async fn certificate_status(controller: Arc<SessionController>) -> Result<impl Reply, Infallible> {
    Ok(ok_json(&controller.certificate_status().await))
}

async fn get_metrics(controller: Arc<SessionController>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::with_header(
        controller.metrics().render(),
        "content-type",
        "text/plain; version=0.0.4",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flow::{FlowRequest, FlowStatus};
    use crate::rules::{RuleAction, RulePattern};
    use crate::test_utils::MockAdapter;

    fn setup() -> (Arc<MockAdapter>, Arc<SessionController>) {
        let adapter = Arc::new(MockAdapter::new());
        let controller =
            Arc::new(SessionController::new(adapter.clone(), &Config::default()).unwrap());
        (adapter, controller)
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let (adapter, controller) = setup();
        let api = routes(controller.clone());

        let resp = warp::test::request()
            .method("POST")
            .path("/api/session/start")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["state"], "running");
        assert_eq!(body["port"], 8080);
        assert_eq!(adapter.start_count(), 1);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/session/start")
            .json(&serde_json::json!({ "port": 9090 }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/session/stop")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["session"]["state"], "stopped");
    }

    #[tokio::test]
    async fn test_rules_round_trip() {
        let (_, controller) = setup();
        let api = routes(controller);

        let rules = serde_json::json!([{
            "id": "block-ads",
            "pattern": { "host": "ads.example.com" },
            "action": { "type": "block" },
            "priority": 10
        }]);
        let resp = warp::test::request()
            .method("PUT")
            .path("/api/rules")
            .json(&rules)
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = warp::test::request().path("/api/rules").reply(&api).await;
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body[0]["id"], "block-ads");
    }

    #[tokio::test]
    async fn test_invalid_throttle_is_rejected() {
        let (_, controller) = setup();
        let api = routes(controller.clone());

        let resp = warp::test::request()
            .method("PUT")
            .path("/api/throttle")
            .json(&serde_json::json!({ "packetLossPercent": 150.0 }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(controller.throttle(), ThrottleProfile::default());
    }

    #[tokio::test]
    async fn test_pause_and_resume_over_http() {
        let (adapter, controller) = setup();
        let api = routes(controller.clone());
        controller
            .set_rules(vec![Rule::new(
                RulePattern::host("example.com"),
                RuleAction::BreakpointRequest,
                0,
            )])
            .unwrap();
        controller.start(SessionConfig::default()).await.unwrap();

        adapter.request("f1", FlowRequest::new("GET", "https://example.com/"));
        let mut paused = false;
        for _ in 0..100 {
            if let Some(flow) = controller.flow(&FlowId::new("f1")) {
                if flow.status == FlowStatus::PausedAtRequestBreakpoint {
                    paused = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(paused);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/flows/f1/resume")
            .json(&serde_json::json!({ "request": { "headers": [["X-Debug", "1"]] } }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["modified"], true);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/flows/f1/resume")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_flow_is_not_found() {
        let (_, controller) = setup();
        let api = routes(controller);

        let resp = warp::test::request().path("/api/flows/nope").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_are_text() {
        let (_, controller) = setup();
        let api = routes(controller);

        let resp = warp::test::request().path("/api/metrics").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let text = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(text.contains("flowctl_"));
    }
}
