use futures::prelude::*;
use hyper::{Body, Request, Response, StatusCode};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, instrument, warn};

/// Reports whether the server is ready to serve traffic.
pub(crate) type Readiness = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
struct Admin {
    ready: Readiness,
    metrics: Arc<Registry>,
}

#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn serve(
    addr: SocketAddr,
    ready: Readiness,
    metrics: Arc<Registry>,
    drain: drain::Watch,
) -> Result<(), hyper::Error> {
    let admin = Admin { ready, metrics };
    let server = hyper::server::Server::try_bind(&addr)?.serve(hyper::service::make_service_fn(
        move |_conn| {
            let admin = admin.clone();
            future::ok::<_, hyper::Error>(hyper::service::service_fn(
                move |req: Request<Body>| future::ok::<_, hyper::Error>(admin.handle(&req)),
            ))
        },
    ));
    let addr = server.local_addr();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::pin! {
        let srv = server.with_graceful_shutdown(close_rx.map(|_| {}));
    }

    info!(%addr, "HTTP admin server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

// === impl Admin ===

impl Admin {
    fn handle(&self, req: &Request<Body>) -> Response<Body> {
        if !matches!(*req.method(), hyper::Method::GET | hyper::Method::HEAD) {
            return text(StatusCode::METHOD_NOT_ALLOWED, "");
        }
        match req.uri().path() {
            "/ready" => {
                if (self.ready)() {
                    text(StatusCode::OK, "ready\n")
                } else {
                    text(StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
                }
            }
            "/live" => text(StatusCode::OK, "live\n"),
            "/metrics" => self.metrics(),
            _ => text(StatusCode::NOT_FOUND, ""),
        }
    }

    fn metrics(&self) -> Response<Body> {
        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, &self.metrics) {
            warn!(%error, "Failed to encode metrics");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "");
        }
        let mut rsp = Response::new(Body::from(buf));
        rsp.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            ),
        );
        rsp
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    if !body.is_empty() {
        rsp.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain"),
        );
    }
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::metrics::counter::Counter;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn admin(ready: Arc<AtomicBool>) -> Admin {
        let mut registry = Registry::default();
        let counter = Counter::<u64>::default();
        counter.inc();
        registry
            .sub_registry_with_prefix("discovery")
            .register("cache_clears", "Cache clears", counter);
        Admin {
            ready: Arc::new(move || ready.load(Ordering::Acquire)),
            metrics: Arc::new(registry),
        }
    }

    async fn get(admin: &Admin, path: &str) -> (StatusCode, String) {
        let rsp = admin.handle(&Request::get(path).body(Body::empty()).unwrap());
        let status = rsp.status();
        let body = hyper::body::to_bytes(rsp.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn readiness_follows_sync() {
        let ready = Arc::new(AtomicBool::new(false));
        let admin = admin(ready.clone());

        assert_eq!(
            get(&admin, "/ready").await,
            (StatusCode::INTERNAL_SERVER_ERROR, "not ready\n".to_string())
        );
        assert_eq!(get(&admin, "/live").await.0, StatusCode::OK);

        ready.store(true, Ordering::Release);
        assert_eq!(
            get(&admin, "/ready").await,
            (StatusCode::OK, "ready\n".to_string())
        );
    }

    #[tokio::test]
    async fn metrics_are_exported() {
        let admin = admin(Arc::new(AtomicBool::new(true)));
        let (status, body) = get(&admin, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("discovery_cache_clears_total 1"), "{body}");
    }

    #[tokio::test]
    async fn rejects_other_methods_and_paths() {
        let admin = admin(Arc::new(AtomicBool::new(true)));
        let req = Request::post("/ready").body(Body::empty()).unwrap();
        assert_eq!(admin.handle(&req).status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(get(&admin, "/debug").await.0, StatusCode::NOT_FOUND);
    }
}
