//! gRPC document store service
//!
//! Shares one [`MemoryStore`] between processes, so callers and callees on
//! different machines signal through the same records.

use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use futures_util::{Stream, StreamExt};
use log::{debug, info};
use tonic::{Request, Response, Result, Status};

use crate::{
    pb::{
        document_store_server::{DocumentStore, DocumentStoreServer},
        AppendReq, AppendRsp, CreateReq, CreateRsp, DocKey, GetReq, GetRsp, MergeReq, MergeRsp,
        WatchAppendedReq, WatchAppendedRsp, WatchLatestReq, WatchLatestRsp, WatchReq, WatchRsp,
    },
    store::{
        decode_document, encode_document, LatestQuery, MemoryStore, Precondition, SignallingStore,
        StoreError,
    },
};

fn to_status(e: StoreError) -> Status {
    match e {
        StoreError::NotFound { .. } => Status::not_found(e.to_string()),
        StoreError::AlreadyExists { .. } => Status::already_exists(e.to_string()),
        StoreError::PreconditionFailed { current } => Status::failed_precondition(encode_document(&current)),
        StoreError::InvalidDocument(_) => Status::invalid_argument(e.to_string()),
        StoreError::Unavailable(_) => Status::unavailable(e.to_string()),
    }
}

fn parse_json(json: &str) -> Result<serde_json::Value> {
    serde_json::from_str(json).map_err(|e| Status::invalid_argument(format!("invalid JSON ({e})")))
}

fn require_doc(doc: Option<DocKey>) -> Result<DocKey> {
    doc.ok_or(Status::invalid_argument("missing document key"))
}

/// A teleconsult document store service
#[derive(Debug)]
pub struct DocumentStoreService {
    inner: Arc<MemoryStore>,
}

impl DocumentStoreService {
    /// Create new `tonic`-wrapped [`DocumentStoreService`]
    pub fn new_svc(store: Arc<MemoryStore>) -> DocumentStoreServer<DocumentStoreService> {
        DocumentStoreServer::new(DocumentStoreService { inner: store })
    }
}

type WatchStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'static>>;

#[tonic::async_trait]
impl DocumentStore for DocumentStoreService {
    async fn create(&self, request: Request<CreateReq>) -> Result<Response<CreateRsp>> {
        let message = request.into_inner();
        let doc = require_doc(message.doc)?;
        debug!("received create request ({}/{})", doc.collection, doc.key);
        let document = decode_document(&message.json).map_err(to_status)?;
        self.inner
            .create(&doc.collection, &doc.key, document)
            .await
            .map_err(to_status)?;
        Ok(Response::new(CreateRsp {}))
    }

    async fn get(&self, request: Request<GetReq>) -> Result<Response<GetRsp>> {
        let doc = require_doc(request.into_inner().doc)?;
        let document = self.inner.get(&doc.collection, &doc.key).await.map_err(to_status)?;
        Ok(Response::new(GetRsp { json: document.as_ref().map(encode_document) }))
    }

    async fn merge(&self, request: Request<MergeReq>) -> Result<Response<MergeRsp>> {
        let message = request.into_inner();
        let doc = require_doc(message.doc)?;
        debug!("received merge request ({}/{})", doc.collection, doc.key);
        let fields = decode_document(&message.fields_json).map_err(to_status)?;
        let preconditions = message
            .preconditions
            .into_iter()
            .map(|p| {
                let values = p.one_of_json.iter().map(|v| parse_json(v)).collect::<Result<Vec<_>>>()?;
                Ok(Precondition::one_of(p.field, values))
            })
            .collect::<Result<Vec<_>>>()?;
        let merged = self
            .inner
            .merge(&doc.collection, &doc.key, fields, preconditions)
            .await
            .map_err(to_status)?;
        Ok(Response::new(MergeRsp { json: encode_document(&merged) }))
    }

    async fn watch(&self, request: Request<WatchReq>) -> Result<Response<Self::WatchStream>> {
        let doc = require_doc(request.into_inner().doc)?;
        debug!("received watch request ({}/{})", doc.collection, doc.key);
        let (rx, cancel) = self
            .inner
            .watch(&doc.collection, &doc.key)
            .await
            .map_err(to_status)?
            .into_parts();
        let outbound = async_stream::stream! {
            // the store watch lives as long as the client stream
            let _cancel = cancel;
            while let Ok(document) = rx.recv_async().await {
                yield Ok(WatchRsp { json: document.as_ref().map(encode_document) });
            }
        };
        Ok(Response::new(outbound.boxed()))
    }
    type WatchStream = WatchStream<WatchRsp>;

    async fn append(&self, request: Request<AppendReq>) -> Result<Response<AppendRsp>> {
        let message = request.into_inner();
        let doc = require_doc(message.doc)?;
        let item = decode_document(&message.json).map_err(to_status)?;
        self.inner
            .append(&doc.collection, &doc.key, &message.sub, item)
            .await
            .map_err(to_status)?;
        Ok(Response::new(AppendRsp {}))
    }

    async fn watch_appended(
        &self,
        request: Request<WatchAppendedReq>,
    ) -> Result<Response<Self::WatchAppendedStream>> {
        let message = request.into_inner();
        let doc = require_doc(message.doc)?;
        debug!("received watch appended request ({}/{}/{})", doc.collection, doc.key, message.sub);
        let (rx, cancel) = self
            .inner
            .watch_appended(&doc.collection, &doc.key, &message.sub)
            .await
            .map_err(to_status)?
            .into_parts();
        let outbound = async_stream::stream! {
            let _cancel = cancel;
            while let Ok(item) = rx.recv_async().await {
                yield Ok(WatchAppendedRsp { json: encode_document(&item) });
            }
        };
        Ok(Response::new(outbound.boxed()))
    }
    type WatchAppendedStream = WatchStream<WatchAppendedRsp>;

    async fn watch_latest(
        &self,
        request: Request<WatchLatestReq>,
    ) -> Result<Response<Self::WatchLatestStream>> {
        let message = request.into_inner();
        debug!("received watch latest request ({})", message.collection);
        let mut query = LatestQuery::new(message.collection, message.order_by);
        for filter in message.filters {
            query = query.filter(filter.field, parse_json(&filter.value_json)?);
        }
        let (rx, cancel) = self.inner.watch_latest(query).await.map_err(to_status)?.into_parts();
        let outbound = async_stream::stream! {
            let _cancel = cancel;
            while let Ok(latest) = rx.recv_async().await {
                let (key, json) = match latest {
                    Some((key, document)) => (Some(key), Some(encode_document(&document))),
                    None => (None, None),
                };
                yield Ok(WatchLatestRsp { key, json });
            }
        };
        Ok(Response::new(outbound.boxed()))
    }
    type WatchLatestStream = WatchStream<WatchLatestRsp>;
}

/// Keepalive and optional TLS, shared by the native and web servers
fn configure<L>(
    builder: tonic::transport::Server<L>,
    http2_keepalive_interval: Option<Duration>,
    http2_keepalive_timeout: Option<Duration>,
    tls_pem: Option<(String, String)>,
) -> Result<tonic::transport::Server<L>, tonic::transport::Error> {
    let builder = builder
        .http2_keepalive_interval(http2_keepalive_interval)
        .http2_keepalive_timeout(http2_keepalive_timeout);
    match tls_pem {
        Some((cert_pem, key_pem)) => {
            let server_identity = tonic::transport::Identity::from_pem(cert_pem, key_pem);
            builder.tls_config(tonic::transport::ServerTlsConfig::new().identity(server_identity))
        }
        None => Ok(builder),
    }
}

/// Start service for native clients
pub async fn serve(
    store: Arc<MemoryStore>,
    addr: SocketAddr,
    http2_keepalive_interval: Option<Duration>,
    http2_keepalive_timeout: Option<Duration>,
    tls_pem: Option<(String, String)>,
) -> Result<(), tonic::transport::Error> {
    let store_svc = DocumentStoreService::new_svc(store);
    let mut builder = configure(
        tonic::transport::Server::builder(),
        http2_keepalive_interval,
        http2_keepalive_timeout,
        tls_pem,
    )?;
    info!("Running native gRPC store server ({addr})");
    builder.add_service(store_svc).serve(addr).await?;
    Ok(())
}

#[cfg(feature = "server-web")]
/// Start service for web clients
pub async fn serve_web(
    store: Arc<MemoryStore>,
    addr: SocketAddr,
    http2_keepalive_interval: Option<Duration>,
    http2_keepalive_timeout: Option<Duration>,
    tls_pem: Option<(String, String)>,
) -> Result<(), tonic::transport::Error> {
    let store_svc = DocumentStoreService::new_svc(store);
    // CORS layer control
    const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
    const DEFAULT_EXPOSED_HEADERS: [&str; 3] =
        ["grpc-status", "grpc-message", "grpc-status-details-bin"];
    const DEFAULT_ALLOW_HEADERS: [&str; 4] =
        ["x-grpc-web", "content-type", "x-user-agent", "grpc-timeout"];
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
        .allow_credentials(true)
        .max_age(DEFAULT_MAX_AGE)
        .expose_headers(
            DEFAULT_EXPOSED_HEADERS
                .iter()
                .cloned()
                .map(http::HeaderName::from_static)
                .collect::<Vec<http::HeaderName>>(),
        )
        .allow_headers(
            DEFAULT_ALLOW_HEADERS
                .iter()
                .cloned()
                .map(http::HeaderName::from_static)
                .collect::<Vec<http::HeaderName>>(),
        );
    let builder = tonic::transport::Server::builder()
        .accept_http1(tls_pem.is_none())
        .layer(cors)
        .layer(tonic_web::GrpcWebLayer::new());
    let mut builder = configure(builder, http2_keepalive_interval, http2_keepalive_timeout, tls_pem)?;
    info!("Running web gRPC store server ({addr})");
    builder.add_service(store_svc).serve(addr).await?;
    Ok(())
}
