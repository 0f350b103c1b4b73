use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::Request;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ExistingPolicy;
use crate::error::Error;
use crate::pki::certificate_pem;

/// Name under which the cluster's own CA certificate is requested.
pub const CLUSTER_CA: &str = "k8s-master";

/// The handful of REST calls the bootstrap makes against the API server.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// POST `body` to the collection at `path`. An existing object is a conflict.
    async fn create(&self, path: &str, body: &Value) -> Result<Value, Error>;
    /// PUT `body` to the object (or subresource) at `path`.
    async fn replace(&self, path: &str, body: &Value) -> Result<Value, Error>;
    /// GET the object at `path`; `None` when it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Value>, Error>;
    /// PEM of a named trust certificate the cluster environment supplies.
    async fn trusted_certificate(&self, name: &str) -> Result<String, Error>;
}

pub struct KubeClusterApi {
    client: Client,
    cluster_ca: Option<String>,
    extra_certs: PathBuf,
}

impl KubeClusterApi {
    pub async fn try_default(extra_certs: PathBuf) -> Result<KubeClusterApi, Error> {
        let config = kube::Config::infer()
            .await
            .map_err(|e| Error::configuration(format!("unable to load kube config: {}", e)))?;
        let cluster_ca = config
            .root_cert
            .as_ref()
            .and_then(|certs| certs.first())
            .map(|der| certificate_pem(der.clone()));
        let client = Client::try_from(config)?;
        Ok(KubeClusterApi {
            client,
            cluster_ca,
            extra_certs,
        })
    }

    async fn send(&self, request: Request<Vec<u8>>) -> Result<Value, Error> {
        let path = request.uri().to_string();
        match self.client.request::<Value>(request).await {
            Ok(v) => Ok(v),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Err(Error::conflict("object", path)),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create(&self, path: &str, body: &Value) -> Result<Value, Error> {
        let request = Request::post(path)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(body)?)?;
        self.send(request).await
    }

    async fn replace(&self, path: &str, body: &Value) -> Result<Value, Error> {
        let request = Request::put(path)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(body)?)?;
        self.send(request).await
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, Error> {
        let request = Request::get(path).body(Vec::new())?;
        match self.client.request::<Value>(request).await {
            Ok(v) => Ok(Some(v)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn trusted_certificate(&self, name: &str) -> Result<String, Error> {
        if name == CLUSTER_CA {
            return self
                .cluster_ca
                .clone()
                .ok_or_else(|| Error::configuration("kube config carries no cluster CA"));
        }
        let path = self.extra_certs.join(format!("{}.pem", name));
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::configuration(format!(
                "unable to read trusted certificate {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Collection path for `K`, namespaced when `namespace` is given.
pub fn collection_path<K>(namespace: Option<&str>) -> String
where
    K: Resource<DynamicType = ()>,
{
    K::url_path(&(), namespace)
}

pub fn item_path<K>(name: &str, namespace: Option<&str>) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!("{}/{}", collection_path::<K>(namespace), name)
}

fn name_of<K: Resource>(value: &K) -> Result<&str, Error> {
    value
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::configuration("object has no metadata.name"))
}

/// POST `value` to its collection. A conflict names the object's kind.
pub async fn perform_create<K>(api: &dyn ClusterApi, value: &K) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Debug,
{
    let name = name_of(value)?;
    let namespace = value.meta().namespace.as_deref();
    let kind = K::kind(&()).to_string();

    let body = serde_json::to_value(value)?;
    let result = api
        .create(&collection_path::<K>(namespace), &body)
        .await
        .map_err(|e| match e {
            Error::ResourceConflict { .. } => Error::conflict(&kind, name),
            e => e,
        })?;
    Ok(serde_json::from_value(result)?)
}

pub async fn perform_get<K>(
    api: &dyn ClusterApi,
    name: &str,
    namespace: Option<&str>,
) -> Result<Option<K>, Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match api.get(&item_path::<K>(name, namespace)).await? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

/// Creates `value` after checking whether it already exists, honouring `policy`.
pub async fn ensure_created<K>(
    api: &dyn ClusterApi,
    policy: ExistingPolicy,
    value: &K,
) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Debug,
{
    let name = name_of(value)?;
    let namespace = value.meta().namespace.as_deref();
    let kind = K::kind(&()).to_string();

    if let Some(existing) = perform_get::<K>(api, name, namespace).await? {
        return match policy {
            ExistingPolicy::Fail => Err(Error::conflict(kind, name)),
            ExistingPolicy::Adopt => {
                info!(%kind, name, namespace, "Adopting existing object");
                Ok(existing)
            }
        };
    }

    debug!(%kind, name, namespace, "Creating object");
    let created = perform_create(api, value).await?;
    info!(%kind, name, namespace, "Created");
    Ok(created)
}
