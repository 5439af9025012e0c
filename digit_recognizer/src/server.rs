use crate::{
    config::Config, prediction::PredictionService, routes::api_routes, telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub prediction_service: Arc<PredictionService>,
    pub metrics: Arc<Metrics>,
    pub app_name: String,
}

pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        prediction_service: Arc<PredictionService>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let app_state = SharedState {
            metrics: prediction_service.metrics().clone(),
            prediction_service,
            app_name: config.app_name.clone(),
        };

        let router = build_router(app_state, config.server.max_upload_bytes);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let service = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, service)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                tracing::info!("HTTP server stopped");
                Ok(())
            }
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        normalizer::tests::solid_rgb_png,
        prediction::tests::{test_config, StubClassifier},
    };
    use axum::{
        body::{to_bytes, Body},
        extract::ConnectInfo,
        http::{header::CONTENT_TYPE, Request, StatusCode},
    };
    use tower::ServiceExt;

    const BOUNDARY: &str = "digit-recognizer-boundary";

    fn test_router() -> (Router, Arc<Metrics>) {
        let config = test_config();
        let metrics = Arc::new(Metrics::new().unwrap());
        let prediction_service = Arc::new(PredictionService::new(
            Arc::new(StubClassifier),
            metrics.clone(),
            &config,
        ));
        let state = SharedState {
            prediction_service,
            metrics: metrics.clone(),
            app_name: config.app_name.clone(),
        };
        (build_router(state, config.server.max_upload_bytes), metrics)
    }

    fn client(ip: &str) -> SocketAddr {
        format!("{}:40000", ip).parse().unwrap()
    }

    fn upload(client: SocketAddr, fields: &[(&str, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, content) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"upload.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let mut request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(client));
        request
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_predict_black_image() {
        let (router, metrics) = test_router();
        let png = solid_rgb_png(10, 10, [0, 0, 0]);

        let response = router
            .oneshot(upload(client("127.0.0.1"), &[("file", png.as_slice())]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body, serde_json::json!({ "digit": "7" }));
        assert_eq!(metrics.request_count("digit_recognizer", "127.0.0.1"), 1);
    }

    #[tokio::test]
    async fn test_predict_prefers_file_field() {
        let (router, _) = test_router();
        let white = solid_rgb_png(4, 4, [255, 255, 255]);
        let black = solid_rgb_png(4, 4, [0, 0, 0]);

        let response = router
            .oneshot(upload(
                client("127.0.0.1"),
                &[("thumbnail", black.as_slice()), ("file", white.as_slice())],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains(r#""digit":"1""#));
    }

    #[tokio::test]
    async fn test_predict_text_file_is_server_error() {
        let (router, metrics) = test_router();

        let response = router
            .oneshot(upload(
                client("127.0.0.1"),
                &[("file", &b"just some notes, no pixels here"[..])],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(metrics.request_count("digit_recognizer", "127.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_predict_without_fields_is_rejected() {
        let (router, _) = test_router();

        let response = router
            .oneshot(upload(client("127.0.0.1"), &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_separate_series() {
        let (router, metrics) = test_router();
        let png = solid_rgb_png(10, 10, [0, 0, 0]);

        let (first, second) = tokio::join!(
            router
                .clone()
                .oneshot(upload(client("10.1.1.1"), &[("file", png.as_slice())])),
            router
                .clone()
                .oneshot(upload(client("10.2.2.2"), &[("file", png.as_slice())])),
        );
        assert_eq!(first.unwrap().status(), StatusCode::OK);
        assert_eq!(second.unwrap().status(), StatusCode::OK);

        assert_eq!(metrics.request_count("digit_recognizer", "10.1.1.1"), 1);
        assert_eq!(metrics.request_count("digit_recognizer", "10.2.2.2"), 1);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], prometheus::TEXT_FORMAT);

        let exposition = body_string(response).await;
        assert!(exposition.contains(r#"request_input_length{client_ip="10.1.1.1"} 784"#));
        assert!(exposition.contains(r#"request_input_length{client_ip="10.2.2.2"} 784"#));
        assert!(exposition.contains(
            r#"request_count_total{app_name="digit_recognizer",client_ip="10.2.2.2"} 1"#
        ));
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let (router, _) = test_router();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health_check")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "Available");
        assert_eq!(body["app_name"], "digit_recognizer");
    }
}
