//! The v1 discovery API consumed by proxies.
//!
//! | path | response |
//! |---|---|
//! | `/v1/registration/{service-key}` | SDS hosts |
//! | `/v1/clusters/{cluster}/{node}` | CDS clusters |
//! | `/v1/listeners/{cluster}/{node}` | LDS listeners |
//! | `/v1/routes/{port}/{cluster}/{node}` | RDS route config |
//! | `/cache_stats` | per-path cache hits and misses |

use crate::{
    metrics::DiscoveryMetrics,
    resources::{Clusters, Hosts, Listeners, SdsHost, SdsHostTags},
    Context, Error, InvalidNode, Node,
};
use ahash::AHashMap as HashMap;
use futures::{future, prelude::*};
use hyper::{body::Bytes, Body, Request, Response, StatusCode};
use parking_lot::Mutex;
use pilot_core::{parse_service_key, ConfigStoreCache, Controller};
use pilot_model::{DESTINATION_POLICY, INGRESS_RULE, ROUTE_RULE};
use serde::Serialize;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use tracing::{debug, info, instrument, warn};


#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Context,
    cache_enabled: bool,
    cache: Mutex<Cache>,
    metrics: DiscoveryMetrics,
}

#[derive(Default)]
struct Cache {
    responses: HashMap<String, Bytes>,
    stats: BTreeMap<String, CacheStat>,

    /// Bumped on every clear. A response computed before a clear is stale
    /// and must not be cached.
    generation: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
struct CacheStat {
    hit: u64,
    miss: u64,
}

#[derive(Serialize)]
struct CacheStats<'a> {
    cache_stats: &'a BTreeMap<String, CacheStat>,
}

#[derive(Debug, PartialEq, Eq)]
enum Endpoint<'p> {
    Registration {
        key: &'p str,
    },
    Clusters {
        cluster: &'p str,
        node: &'p str,
    },
    Listeners {
        cluster: &'p str,
        node: &'p str,
    },
    Routes {
        name: &'p str,
        cluster: &'p str,
        node: &'p str,
    },
    CacheStats,
}

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("invalid service node: {0}")]
    Node(#[from] InvalidNode),

    #[error("unexpected service cluster {0:?}")]
    Cluster(String),

    #[error("unexpected route config name {0:?}")]
    RouteName(String),

    #[error("missing route config for port {0}")]
    RouteConfig(u16),

    #[error(transparent)]
    Translate(#[from] Error),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

// === impl DiscoveryService ===

impl DiscoveryService {
    pub fn new(ctx: Context, cache_enabled: bool, metrics: DiscoveryMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                cache_enabled,
                cache: Mutex::default(),
                metrics,
            }),
        }
    }

    /// Flushes cached responses whenever services, instances or routing
    /// configuration change.
    pub fn register_handlers(&self, registry: &dyn Controller, config: &dyn ConfigStoreCache) {
        let svc = self.clone();
        registry.append_service_handler(Arc::new(move |_, _| svc.clear_cache()));
        let svc = self.clone();
        registry.append_instance_handler(Arc::new(move |_, _| svc.clear_cache()));
        for ty in [ROUTE_RULE, DESTINATION_POLICY, INGRESS_RULE] {
            let svc = self.clone();
            config.register_event_handler(ty, Arc::new(move |_, _| svc.clear_cache()));
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.inner.cache.lock();
        cache.responses.clear();
        cache.generation = cache.generation.wrapping_add(1);
        self.inner.metrics.cleared();
        debug!("Cleared discovery cache");
    }

    /// Serves the discovery API until shutdown is signaled.
    #[instrument(skip_all, fields(port = %addr.port()))]
    pub async fn serve(self, addr: SocketAddr, drain: drain::Watch) -> Result<(), hyper::Error> {
        let server = hyper::server::Server::try_bind(&addr)?.serve(
            hyper::service::make_service_fn(move |_conn| {
                let svc = self.clone();
                future::ok::<_, hyper::Error>(hyper::service::service_fn(
                    move |req: Request<Body>| future::ok::<_, hyper::Error>(svc.handle(&req)),
                ))
            }),
        );
        let addr = server.local_addr();

        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::pin! {
            let srv = server.with_graceful_shutdown(close_rx.map(|_| {}));
        }

        info!(%addr, "Discovery server listening");
        tokio::select! {
            res = (&mut srv) => res?,
            handle = drain.signaled() => {
                let _ = close_tx.send(());
                handle.release_after(srv).await?
            }
        }
        Ok(())
    }

    pub fn handle(&self, req: &Request<Body>) -> Response<Body> {
        if req.method() != hyper::Method::GET {
            return status(StatusCode::METHOD_NOT_ALLOWED, String::new());
        }
        let path = req.uri().path();
        let Some(endpoint) = Endpoint::parse(path) else {
            return status(StatusCode::NOT_FOUND, format!("unknown path {path}\n"));
        };

        let name = endpoint.name();
        if endpoint == Endpoint::CacheStats {
            return match self.respond(&endpoint) {
                Ok(body) => json(Bytes::from(body)),
                Err(error) => status(error.status(), format!("{error}\n")),
            };
        }

        // The lock is never held while translating.
        let generation = {
            let mut cache = self.inner.cache.lock();
            if self.inner.cache_enabled {
                if let Some(body) = cache.responses.get(path).cloned() {
                    cache.stats.entry(path.to_string()).or_default().hit += 1;
                    self.inner.metrics.hit(name);
                    return json(body);
                }
            }
            cache.generation
        };

        let body = match self.respond(&endpoint) {
            Ok(body) => Bytes::from(body),
            Err(error) => {
                warn!(%error, %path, "Discovery request failed");
                if matches!(error, RequestError::Translate(_) | RequestError::Encode(_)) {
                    self.inner.metrics.error(name);
                }
                return status(error.status(), format!("{error}\n"));
            }
        };
        self.inner.metrics.miss(name);
        if self.inner.cache_enabled {
            let mut cache = self.inner.cache.lock();
            cache.stats.entry(path.to_string()).or_default().miss += 1;
            if cache.generation == generation {
                cache.responses.insert(path.to_string(), body.clone());
                self.inner.metrics.set_entries(cache.responses.len());
            } else {
                debug!(%path, "Cache cleared during translation; not caching response");
            }
        }
        json(body)
    }

    fn respond(&self, endpoint: &Endpoint<'_>) -> Result<Vec<u8>, RequestError> {
        let ctx = &self.inner.ctx;
        let body = match *endpoint {
            Endpoint::Registration { key } => {
                let (hostname, ports, tags) = parse_service_key(key);
                let hosts = ctx
                    .discovery
                    .instances(&hostname, &ports, &tags)
                    .map_err(Error::from)?
                    .into_iter()
                    .map(|instance| SdsHost {
                        ip_address: instance.endpoint.address,
                        port: instance.endpoint.port,
                        tags: instance.availability_zone.map(|az| SdsHostTags { az }),
                    })
                    .collect();
                serde_json::to_vec_pretty(&Hosts { hosts })?
            }
            Endpoint::Clusters { cluster, node } => {
                let config = ctx.build(&self.node(cluster, node)?)?;
                serde_json::to_vec_pretty(&Clusters {
                    clusters: config.clusters,
                })?
            }
            Endpoint::Listeners { cluster, node } => {
                let config = ctx.build(&self.node(cluster, node)?)?;
                serde_json::to_vec_pretty(&Listeners {
                    listeners: config.listeners,
                })?
            }
            Endpoint::Routes {
                name,
                cluster,
                node,
            } => {
                // Route configs are named by listener port.
                let port = name
                    .parse::<u16>()
                    .map_err(|_| RequestError::RouteName(name.to_string()))?;
                let node = self.node(cluster, node)?;
                let mut config = ctx.build(&node)?;
                let routes = config
                    .routes
                    .remove(&port)
                    .ok_or(RequestError::RouteConfig(port))?;
                serde_json::to_vec_pretty(&routes)?
            }
            Endpoint::CacheStats => {
                let cache = self.inner.cache.lock();
                serde_json::to_vec_pretty(&CacheStats {
                    cache_stats: &cache.stats,
                })?
            }
        };
        Ok(body)
    }

    fn node(&self, cluster: &str, node: &str) -> Result<Node, RequestError> {
        if cluster != self.inner.ctx.mesh.istio_service_cluster {
            return Err(RequestError::Cluster(cluster.to_string()));
        }
        Ok(node.parse()?)
    }
}

// === impl Endpoint ===

impl<'p> Endpoint<'p> {
    fn parse(path: &'p str) -> Option<Self> {
        let segments = path.trim_start_matches('/').split('/').collect::<Vec<_>>();
        let endpoint = match segments[..] {
            ["v1", "registration", key] => Self::Registration { key },
            ["v1", "clusters", cluster, node] => Self::Clusters { cluster, node },
            ["v1", "listeners", cluster, node] => Self::Listeners { cluster, node },
            ["v1", "routes", name, cluster, node] => Self::Routes {
                name,
                cluster,
                node,
            },
            ["cache_stats"] => Self::CacheStats,
            _ => return None,
        };
        Some(endpoint)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Registration { .. } => "sds",
            Self::Clusters { .. } => "cds",
            Self::Listeners { .. } => "lds",
            Self::Routes { .. } => "rds",
            Self::CacheStats => "cache_stats",
        }
    }
}

// === impl RequestError ===

impl RequestError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Node(_) => StatusCode::BAD_REQUEST,
            Self::Cluster(_) | Self::RouteName(_) | Self::RouteConfig(_) => StatusCode::NOT_FOUND,
            Self::Translate(_) | Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn json(body: Bytes) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    rsp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    rsp
}

fn status(code: StatusCode, body: String) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = code;
    rsp
}
