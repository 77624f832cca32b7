//! HTTP scrape endpoint for the metrics registry.

use hyper::service::Service;
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tracing::{error, info};

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text;charset=utf-8;version=1.0.0";

type SharedRegistry = Arc<Mutex<Registry>>;

/// Binds `addr` and serves `GET /metrics` from `registry` on a
/// background task. Bind failures are returned so startup can abort.
pub fn start_metrics_server(registry: Registry, addr: SocketAddr) -> anyhow::Result<()> {
    let server = hyper::Server::try_bind(&addr)?.serve(MakeMetricService::new(registry));
    info!("metrics server on http://{}/metrics", server.local_addr());
    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("metrics server error: {e}");
        }
    });
    Ok(())
}

struct MetricService {
    reg: SharedRegistry,
}

impl MetricService {
    fn respond_with_metrics(&self) -> Response<String> {
        let mut body = String::new();
        let reg = self.reg.lock().unwrap();
        if let Err(e) = encode(&mut body, &reg) {
            error!("failed to encode metrics: {e}");
            let mut response = Response::new(String::new());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }

        let mut response = Response::new(body);
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(METRICS_CONTENT_TYPE),
        );
        response
    }

    fn respond_with_404_not_found(&self) -> Response<String> {
        let mut response = Response::new("Not found, try /metrics".to_string());
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }
}

impl Service<Request<Body>> for MetricService {
    type Response = Response<String>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let resp = if req.method() == Method::GET && req.uri().path() == "/metrics" {
            self.respond_with_metrics()
        } else {
            self.respond_with_404_not_found()
        };
        Box::pin(async { Ok(resp) })
    }
}

struct MakeMetricService {
    reg: SharedRegistry,
}

impl MakeMetricService {
    fn new(registry: Registry) -> MakeMetricService {
        MakeMetricService {
            reg: Arc::new(Mutex::new(registry)),
        }
    }
}

impl<T> Service<T> for MakeMetricService {
    type Response = MetricService;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: T) -> Self::Future {
        let reg = self.reg.clone();
        Box::pin(async move { Ok(MetricService { reg }) })
    }
}
