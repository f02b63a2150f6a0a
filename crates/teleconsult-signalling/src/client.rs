//! gRPC client for a remote document store

use std::time::Duration;

use log::{trace, warn};
use tonic::{metadata::MetadataMap, Extensions, Request, Status, Streaming};

use crate::{
    config::DEFAULT_REQUEST_DEADLINE,
    pb::{
        document_store_client::DocumentStoreClient, AppendReq, CreateReq, DocKey, Filter, GetReq,
        MergeReq, WatchAppendedReq, WatchLatestReq, WatchReq,
    },
    store::{
        decode_document, encode_document, Document, LatestQuery, Precondition, SignallingStore,
        StoreError, Watch, WatchCancel,
    },
};

fn doc_key(collection: &str, key: &str) -> Option<DocKey> {
    Some(DocKey { collection: collection.to_string(), key: key.to_string() })
}

fn from_status(status: Status, collection: &str, key: &str) -> StoreError {
    match status.code() {
        tonic::Code::NotFound => StoreError::NotFound { collection: collection.to_string(), key: key.to_string() },
        tonic::Code::AlreadyExists => {
            StoreError::AlreadyExists { collection: collection.to_string(), key: key.to_string() }
        }
        tonic::Code::FailedPrecondition => match decode_document(status.message()) {
            Ok(current) => StoreError::PreconditionFailed { current },
            Err(e) => e,
        },
        tonic::Code::InvalidArgument => StoreError::InvalidDocument(status.message().to_string()),
        _ => StoreError::Unavailable(status.to_string()),
    }
}

/// Forward a server stream into a [`Watch`] until the watch is cancelled
fn forward<M, T>(mut stream: Streaming<M>, decode: fn(M) -> Result<T, StoreError>) -> Watch<T>
where
    M: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = flume::unbounded();
    let task = tokio::spawn(async move {
        loop {
            match stream.message().await {
                Ok(Some(message)) => match decode(message) {
                    Ok(item) => {
                        if tx.send(item).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("dropping undecodable watch message ({e})"),
                },
                Ok(None) => break,
                Err(status) => {
                    warn!("watch stream closed by server ({status})");
                    break;
                }
            }
        }
        trace!("watch stream finished");
    });
    Watch::new(rx, WatchCancel::new(move || task.abort()))
}

/// [`SignallingStore`] backed by a remote `teleconsult-signalling` server
#[derive(Debug, Clone)]
pub struct RemoteStore {
    grpc_metadata: MetadataMap,
    inner: DocumentStoreClient<tonic::transport::Channel>,
}

impl RemoteStore {
    /// Connect to the store server at `addr` (`host:port`).
    ///
    /// TLS is used when both `domain` and `tls_ca_pem` are given. `timeout`
    /// bounds unary requests only, watches stay open.
    pub async fn connect(
        addr: String,
        timeout: Option<Duration>,
        domain: Option<String>,
        tls_ca_pem: Option<String>,
    ) -> Result<Self, StoreError> {
        // create an empty temp request to build timeout metadata
        let mut tmp_req = Request::new(());
        tmp_req.set_timeout(timeout.unwrap_or(DEFAULT_REQUEST_DEADLINE));
        let (grpc_metadata, _, _) = tmp_req.into_parts();
        let transport_error = |e: tonic::transport::Error| StoreError::Unavailable(e.to_string());
        let endpoint = match (domain, tls_ca_pem) {
            (Some(domain), Some(tls_ca_pem)) => {
                let ca_certificate = tonic::transport::Certificate::from_pem(tls_ca_pem);
                let tls_config = tonic::transport::ClientTlsConfig::new()
                    .domain_name(domain)
                    .ca_certificate(ca_certificate);
                tonic::transport::Channel::from_shared(format!("https://{addr}"))
                    .map_err(|e| StoreError::Unavailable(format!("invalid URL ({e})")))?
                    .tls_config(tls_config)
                    .map_err(transport_error)?
            }
            _ => tonic::transport::Channel::from_shared(format!("http://{addr}"))
                .map_err(|e| StoreError::Unavailable(format!("invalid URL ({e})")))?,
        };
        let channel = endpoint.connect().await.map_err(transport_error)?;
        Ok(Self { grpc_metadata, inner: DocumentStoreClient::new(channel) })
    }

    /// Unary request carrying the deadline metadata
    fn request<T>(&self, message: T) -> Request<T> {
        Request::from_parts(self.grpc_metadata.clone(), Extensions::default(), message)
    }
}

impl SignallingStore for RemoteStore {
    async fn create(&self, collection: &str, key: &str, document: Document) -> Result<(), StoreError> {
        let request = self.request(CreateReq { doc: doc_key(collection, key), json: encode_document(&document) });
        let mut client = self.inner.clone();
        client.create(request).await.map_err(|s| from_status(s, collection, key))?;
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let request = self.request(GetReq { doc: doc_key(collection, key) });
        let mut client = self.inner.clone();
        let response = client.get(request).await.map_err(|s| from_status(s, collection, key))?;
        response.into_inner().json.as_deref().map(decode_document).transpose()
    }

    async fn merge(
        &self,
        collection: &str,
        key: &str,
        fields: Document,
        preconditions: Vec<Precondition>,
    ) -> Result<Document, StoreError> {
        let preconditions = preconditions
            .into_iter()
            .map(|p| crate::pb::Precondition {
                field: p.field,
                one_of_json: p.one_of.iter().map(|v| v.to_string()).collect(),
            })
            .collect();
        let request = self.request(MergeReq {
            doc: doc_key(collection, key),
            fields_json: encode_document(&fields),
            preconditions,
        });
        let mut client = self.inner.clone();
        let response = client.merge(request).await.map_err(|s| from_status(s, collection, key))?;
        decode_document(&response.into_inner().json)
    }

    async fn watch(&self, collection: &str, key: &str) -> Result<Watch<Option<Document>>, StoreError> {
        let mut client = self.inner.clone();
        let stream = client
            .watch(Request::new(WatchReq { doc: doc_key(collection, key) }))
            .await
            .map_err(|s| from_status(s, collection, key))?
            .into_inner();
        Ok(forward(stream, |message| message.json.as_deref().map(decode_document).transpose()))
    }

    async fn append(&self, collection: &str, key: &str, sub: &str, item: Document) -> Result<(), StoreError> {
        let request = self.request(AppendReq {
            doc: doc_key(collection, key),
            sub: sub.to_string(),
            json: encode_document(&item),
        });
        let mut client = self.inner.clone();
        client.append(request).await.map_err(|s| from_status(s, collection, key))?;
        Ok(())
    }

    async fn watch_appended(&self, collection: &str, key: &str, sub: &str) -> Result<Watch<Document>, StoreError> {
        let mut client = self.inner.clone();
        let request = Request::new(WatchAppendedReq { doc: doc_key(collection, key), sub: sub.to_string() });
        let stream = client
            .watch_appended(request)
            .await
            .map_err(|s| from_status(s, collection, key))?
            .into_inner();
        Ok(forward(stream, |message| decode_document(&message.json)))
    }

    async fn watch_latest(&self, query: LatestQuery) -> Result<Watch<Option<(String, Document)>>, StoreError> {
        let collection = query.collection.clone();
        let request = Request::new(WatchLatestReq {
            collection: query.collection,
            filters: query
                .filters
                .into_iter()
                .map(|(field, value)| Filter { field, value_json: value.to_string() })
                .collect(),
            order_by: query.order_by,
        });
        let mut client = self.inner.clone();
        let stream = client
            .watch_latest(request)
            .await
            .map_err(|s| from_status(s, &collection, ""))?
            .into_inner();
        Ok(forward(stream, |message| match (message.key, message.json) {
            (Some(key), Some(json)) => Ok(Some((key, decode_document(&json)?))),
            _ => Ok(None),
        }))
    }
}
