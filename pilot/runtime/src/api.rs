//! A REST API over a config store.
//!
//! | method | path | |
//! |---|---|---|
//! | `GET` | `/v1alpha1/version` | server version |
//! | `GET` | `/v1alpha1/config/{type}` | list objects |
//! | `GET` | `/v1alpha1/config/{type}/{key}` | get an object |
//! | `POST` | `/v1alpha1/config/{type}/{key}` | create an object |
//! | `PUT` | `/v1alpha1/config/{type}/{key}` | replace an object at a revision |
//! | `DELETE` | `/v1alpha1/config/{type}/{key}` | delete an object |

use futures::prelude::*;
use hyper::{Body, Method, Request, Response, StatusCode};
use pilot_core::{Config, ConfigStore, Error, ErrorKind, Message, Revision, Schema};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, info, instrument};

/// The wire form of a stored object.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Record {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    ty: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    revision: Option<Revision>,

    spec: serde_json::Value,
}

#[derive(Serialize)]
struct Version {
    version: &'static str,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("unknown type {0:?}")]
    UnknownType(String),

    #[error("invalid request body: {0}")]
    Body(#[source] serde_json::Error),

    #[error("body {field} {actual:?} does not match the path ({expected:?})")]
    Mismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("PUT requires a revision")]
    MissingRevision,

    #[error("failed to read request body: {0}")]
    Read(#[from] hyper::Error),

    #[error(transparent)]
    Store(#[from] Error),
}

#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn serve(
    addr: SocketAddr,
    store: Arc<dyn ConfigStore>,
    drain: drain::Watch,
) -> Result<(), hyper::Error> {
    // Captured through a named type (as in `admin`): capturing the trait
    // object or a borrowing handler future directly trips rustc's
    // higher-ranked `Send` check where `serve` is spawned.
    let store = Store(store);
    let server = hyper::server::Server::try_bind(&addr)?.serve(hyper::service::make_service_fn(
        move |_conn| {
            let store = store.clone();
            future::ok::<_, hyper::Error>(hyper::service::service_fn(move |req: Request<Body>| {
                let store = store.clone();
                store.handle(req).map(Ok::<_, hyper::Error>)
            }))
        },
    ));
    let addr = server.local_addr();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::pin! {
        let srv = server.with_graceful_shutdown(close_rx.map(|_| {}));
    }

    info!(%addr, "Config API server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

pub(crate) async fn handle(store: &dyn ConfigStore, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments = path
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    let res = match (&method, segments.as_slice()) {
        (&Method::GET, ["v1alpha1", "version"]) => json(
            StatusCode::OK,
            &Version {
                version: env!("CARGO_PKG_VERSION"),
            },
        ),
        (&Method::GET, ["v1alpha1", "config", ty]) => list(store, ty),
        (&Method::GET, ["v1alpha1", "config", ty, key]) => get(store, ty, key),
        (&Method::POST, ["v1alpha1", "config", ty, key]) => match body(req).await {
            Ok(record) => post(store, ty, key, record),
            Err(error) => Err(error),
        },
        (&Method::PUT, ["v1alpha1", "config", ty, key]) => match body(req).await {
            Ok(record) => put(store, ty, key, record),
            Err(error) => Err(error),
        },
        (&Method::DELETE, ["v1alpha1", "config", ty, key]) => {
            delete(store, ty, key).map(|()| empty(StatusCode::OK))
        }
        (_, ["v1alpha1", "version"]) | (_, ["v1alpha1", "config", ..]) => {
            Ok(empty(StatusCode::METHOD_NOT_ALLOWED))
        }
        _ => Ok(empty(StatusCode::NOT_FOUND)),
    };

    res.unwrap_or_else(|error| {
        debug!(%error, %method, %path, "Config request failed");
        let mut rsp = Response::new(Body::from(format!("{error}\n")));
        *rsp.status_mut() = error.status();
        rsp
    })
}

fn list(store: &dyn ConfigStore, ty: &str) -> Result<Response<Body>, ApiError> {
    known_type(store, ty)?;
    let records = store
        .list(ty)?
        .into_iter()
        .map(Record::from)
        .collect::<Vec<_>>();
    json(StatusCode::OK, &records)
}

fn get(store: &dyn ConfigStore, ty: &str, key: &str) -> Result<Response<Body>, ApiError> {
    known_type(store, ty)?;
    let (content, revision) = store
        .get(ty, key)
        .ok_or_else(|| Error::not_found(ty, key))?;
    json(
        StatusCode::OK,
        &Record {
            ty: ty.to_string(),
            key: key.to_string(),
            revision: Some(revision),
            spec: content.value,
        },
    )
}

fn post(
    store: &dyn ConfigStore,
    ty: &str,
    key: &str,
    record: Record,
) -> Result<Response<Body>, ApiError> {
    let message = message(store, ty, key, &record)?;
    let revision = store.post(message)?;
    info!(r#type = %ty, %key, %revision, "Created config");
    json(
        StatusCode::CREATED,
        &Record {
            ty: ty.to_string(),
            key: key.to_string(),
            revision: Some(revision),
            spec: record.spec,
        },
    )
}

fn put(
    store: &dyn ConfigStore,
    ty: &str,
    key: &str,
    record: Record,
) -> Result<Response<Body>, ApiError> {
    let message = message(store, ty, key, &record)?;
    let current = record.revision.as_ref().ok_or(ApiError::MissingRevision)?;
    let revision = store.put(message, current)?;
    info!(r#type = %ty, %key, %revision, "Updated config");
    json(
        StatusCode::OK,
        &Record {
            ty: ty.to_string(),
            key: key.to_string(),
            revision: Some(revision),
            spec: record.spec,
        },
    )
}

fn delete(store: &dyn ConfigStore, ty: &str, key: &str) -> Result<(), ApiError> {
    known_type(store, ty)?;
    store.delete(ty, key)?;
    info!(r#type = %ty, %key, "Deleted config");
    Ok(())
}

async fn body(req: Request<Body>) -> Result<Record, ApiError> {
    let bytes = hyper::body::to_bytes(req.into_body()).await?;
    serde_json::from_slice(&bytes).map_err(ApiError::Body)
}

/// Checks the body against the path and builds the message to store.
fn message(
    store: &dyn ConfigStore,
    ty: &str,
    key: &str,
    record: &Record,
) -> Result<Message, ApiError> {
    let schema = known_type(store, ty)?;
    if !record.ty.is_empty() && record.ty != ty {
        return Err(ApiError::Mismatch {
            field: "type",
            expected: ty.to_string(),
            actual: record.ty.clone(),
        });
    }
    let message = Message {
        name: schema.message_name.to_string(),
        value: record.spec.clone(),
    };
    let actual = schema
        .key(&message)
        .map_err(|source| Error::validation(ty, source))?;
    if actual != key {
        return Err(ApiError::Mismatch {
            field: "key",
            expected: key.to_string(),
            actual,
        });
    }
    Ok(message)
}

fn known_type<'s>(store: &'s dyn ConfigStore, ty: &str) -> Result<&'s Schema, ApiError> {
    store
        .descriptor()
        .get(ty)
        .ok_or_else(|| ApiError::UnknownType(ty.to_string()))
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>, ApiError> {
    let body = serde_json::to_vec_pretty(body).map_err(|e| Error::Internal(e.to_string()))?;
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(rsp)
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut rsp = Response::new(Body::empty());
    *rsp.status_mut() = status;
    rsp
}

/// Wraps the store so the server's service types name no lifetimes.
#[derive(Clone)]
struct Store(Arc<dyn ConfigStore>);

impl Store {
    async fn handle(self, req: Request<Body>) -> Response<Body> {
        handle(&*self.0, req).await
    }
}

// === impl Record ===

impl From<Config> for Record {
    fn from(config: Config) -> Self {
        Self {
            ty: config.ty,
            key: config.key,
            revision: Some(config.revision),
            spec: config.content.value,
        }
    }
}

// === impl ApiError ===

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownType(_)
            | Self::Body(_)
            | Self::Mismatch { .. }
            | Self::MissingRevision
            | Self::Read(_) => StatusCode::BAD_REQUEST,
            Self::Store(error) => match error.kind() {
                ErrorKind::UnknownType | ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::AlreadyExists | ErrorKind::RevisionMismatch => StatusCode::CONFLICT,
                ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Conflict | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}
