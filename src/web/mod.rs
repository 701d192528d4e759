use crate::config::ApiConfig;
use crate::error::{ConfigError, ControlError, Result};
use crate::session::SessionController;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub mod api;
pub mod ws;

/// Serves the control API until `shutdown` is cancelled.
pub async fn start_server(
    controller: Arc<SessionController>,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| ConfigError::Parse(format!("Invalid API address: {}", e)))?;

    tracing::info!("Starting control API on {}", addr);

    let routes = create_routes(controller, config.api_key.clone());
    let (_, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
        .map_err(|e| ControlError::Io(std::io::Error::new(std::io::ErrorKind::AddrInUse, e)))?;

    server.await;

    tracing::info!("Control API stopped");
    Ok(())
}

pub fn create_routes(
    controller: Arc<SessionController>,
    api_key: Option<String>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let api_routes = api::routes(controller.clone()).or(ws::route(controller));

    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "flowctl"
        }))
    });

    let protected = match api_key {
        Some(key) => api_key_auth(key).and(api_routes).boxed(),
        None => api_routes.boxed(),
    };

    health
        .or(protected)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "PUT", "DELETE"])
                .allow_headers(vec!["Content-Type", "Authorization"]),
        )
        .recover(handle_rejection)
}

fn api_key_auth(api_key: String) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |auth_header: Option<String>| {
            let api_key = api_key.clone();
            async move {
                match auth_header {
                    Some(header) if header == format!("Bearer {}", api_key) => Ok(()),
                    Some(_) => Err(warp::reject::custom(AuthError::invalid_api_key())),
                    None => Err(warp::reject::custom(AuthError::missing_api_key())),
                }
            }
        })
        .untuple_one()
}

#[derive(Debug)]
struct AuthError {
    kind: AuthErrorKind,
}

#[derive(Debug)]
enum AuthErrorKind {
    MissingApiKey,
    InvalidApiKey,
}

impl AuthError {
    fn missing_api_key() -> Self {
        Self {
            kind: AuthErrorKind::MissingApiKey,
        }
    }

    fn invalid_api_key() -> Self {
        Self {
            kind: AuthErrorKind::InvalidApiKey,
        }
    }
}

impl warp::reject::Reject for AuthError {}

/// Status code for a controller error surfaced over HTTP.
pub fn status_for(error: &ControlError) -> StatusCode {
    match error {
        ControlError::FlowNotFound(_) | ControlError::NoPendingBreakpoint(_) => {
            StatusCode::NOT_FOUND
        }
        ControlError::SessionAlreadyRunning
        | ControlError::SessionNotRunning
        | ControlError::DuplicateBreakpoint(_)
        | ControlError::StageMismatch(_)
        | ControlError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ControlError::InvalidRule(_) | ControlError::Config(_) | ControlError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        ControlError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ControlError::Adapter(_) => StatusCode::BAD_GATEWAY,
        ControlError::Overflow(_) | ControlError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_reply(error: &ControlError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = status_for(error);
    if status.is_server_error() {
        tracing::error!(error = %error, "Control API request failed");
    } else {
        tracing::debug!(error = %error, "Control API request rejected");
    }
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": error.to_string() })),
        status,
    )
}

async fn handle_rejection(rejection: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (status, message) = if let Some(auth) = rejection.find::<AuthError>() {
        let message = match auth.kind {
            AuthErrorKind::MissingApiKey => "missing API key",
            AuthErrorKind::InvalidApiKey => "invalid API key",
        };
        (StatusCode::UNAUTHORIZED, message.to_string())
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(api::BadRequest(message)) = rejection.find::<api::BadRequest>() {
        (StatusCode::BAD_REQUEST, message.clone())
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        tracing::warn!(?rejection, "Unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_utils::MockAdapter;

    fn controller() -> Arc<SessionController> {
        Arc::new(SessionController::new(Arc::new(MockAdapter::new()), &Config::default()).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let routes = create_routes(controller(), Some("secret".to_string()));
        let resp = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_required() {
        let routes = create_routes(controller(), Some("secret".to_string()));

        let resp = warp::test::request().path("/api/session").reply(&routes).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = warp::test::request()
            .path("/api/session")
            .header("authorization", "Bearer wrong")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = warp::test::request()
            .path("/api/session")
            .header("authorization", "Bearer secret")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&ControlError::FlowNotFound("f1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ControlError::DuplicateBreakpoint("f1".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ControlError::InvalidRule("bad".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
