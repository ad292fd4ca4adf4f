//! Kubernetes `Secret` change feed.
//!
//! Each watch is a server-side watch narrowed with a `metadata.name` field
//! selector, so the loader only ever receives events for its own secret.
//! Starting from resource version `"0"` makes the API server replay the
//! current object as `ADDED` before streaming changes.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::Client;
use tracing::debug;

use super::{ChangeFeed, RawSecretPayload, SecretEvent, SecretEventStream, SecretRef};
use crate::error::WatchError;

/// Change feed backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretFeed {
    client: Client,
    default_namespace: String,
}

impl KubeSecretFeed {
    /// Feed using an existing client.
    #[must_use]
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }

    /// Feed using in-cluster config or the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns the client construction error.
    pub async fn try_default(default_namespace: impl Into<String>) -> Result<Self, kube::Error> {
        Ok(Self::new(Client::try_default().await?, default_namespace))
    }
}

impl std::fmt::Debug for KubeSecretFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretFeed")
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeFeed for KubeSecretFeed {
    async fn watch(&self, secret: &str) -> Result<SecretEventStream, WatchError> {
        let secret_ref = SecretRef::parse(secret, &self.default_namespace)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let params = WatchParams::default().fields(&format!("metadata.name={}", secret_ref.name));
        let secret = secret.to_string();

        let events = async_stream::stream! {
            let watch = match api.watch(&params, "0").await {
                Ok(watch) => watch,
                Err(e) => {
                    yield SecretEvent::Error(WatchError::Establish {
                        secret: secret.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            let mut watch = std::pin::pin!(watch);

            while let Some(item) = watch.next().await {
                let event = match item {
                    Ok(WatchEvent::Added(s)) => SecretEvent::Added(payload_of(s)),
                    Ok(WatchEvent::Modified(s)) => SecretEvent::Modified(payload_of(s)),
                    Ok(WatchEvent::Deleted(_)) => SecretEvent::Deleted,
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(status)) => SecretEvent::Error(WatchError::Stream {
                        secret: secret.clone(),
                        reason: format!("{} ({})", status.message, status.code),
                    }),
                    Err(e) => SecretEvent::Error(WatchError::Stream {
                        secret: secret.clone(),
                        reason: e.to_string(),
                    }),
                };
                let is_error = matches!(event, SecretEvent::Error(_));
                yield event;
                if is_error {
                    return;
                }
            }
            debug!(secret = %secret, "Kubernetes watch closed by server");
        };

        Ok(events.boxed())
    }
}

fn payload_of(secret: Secret) -> RawSecretPayload {
    let data: HashMap<String, Vec<u8>> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(field, bytes)| (field, bytes.0))
        .collect();
    RawSecretPayload::new(data)
}
