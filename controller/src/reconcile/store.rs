use crate::tracker::SharedTracker;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    api::{Api, DeleteParams, PostParams},
    ResourceExt,
};
use std::future::Future;
use tokio::time;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("namespace {0} is being terminated")]
    NamespaceTerminating(String),

    #[error("write timed out after {0:?}")]
    Timeout(time::Duration),

    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Writes EndpointSlices to the API server.
#[async_trait::async_trait]
pub trait SliceWriter: Send + Sync {
    async fn create(
        &self,
        namespace: &str,
        slice: EndpointSlice,
    ) -> Result<EndpointSlice, WriteError>;

    async fn update(
        &self,
        namespace: &str,
        slice: EndpointSlice,
    ) -> Result<EndpointSlice, WriteError>;

    async fn delete(&self, namespace: &str, slice: &EndpointSlice) -> Result<(), WriteError>;
}

/// A [`SliceWriter`] backed by a Kubernetes client. Every write is recorded in the slice tracker.
#[derive(Clone)]
pub struct KubeSliceWriter {
    client: kube::Client,
    tracker: SharedTracker,
    timeout: time::Duration,
}

// === impl KubeSliceWriter ===

impl KubeSliceWriter {
    pub fn new(client: kube::Client, tracker: SharedTracker, timeout: time::Duration) -> Self {
        Self {
            client,
            tracker,
            timeout,
        }
    }

    fn api(&self, namespace: &str) -> Api<EndpointSlice> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn timed<T>(
        &self,
        write: impl Future<Output = kube::Result<T>>,
    ) -> Result<kube::Result<T>, WriteError> {
        time::timeout(self.timeout, write)
            .await
            .map_err(|_| WriteError::Timeout(self.timeout))
    }
}

#[async_trait::async_trait]
impl SliceWriter for KubeSliceWriter {
    async fn create(
        &self,
        namespace: &str,
        slice: EndpointSlice,
    ) -> Result<EndpointSlice, WriteError> {
        let api = self.api(namespace);
        let created = match self.timed(api.create(&PostParams::default(), &slice)).await? {
            Ok(created) => created,
            Err(error) if is_namespace_terminating(&error) => {
                return Err(WriteError::NamespaceTerminating(namespace.to_string()))
            }
            Err(error) => return Err(error.into()),
        };
        tracing::debug!(slice = %created.name_any(), "created EndpointSlice");
        self.tracker.lock().update(&created);
        Ok(created)
    }

    async fn update(
        &self,
        namespace: &str,
        slice: EndpointSlice,
    ) -> Result<EndpointSlice, WriteError> {
        let api = self.api(namespace);
        let name = slice.name_any();
        let updated = self
            .timed(api.replace(&name, &PostParams::default(), &slice))
            .await??;
        tracing::debug!(slice = %name, "updated EndpointSlice");
        self.tracker.lock().update(&updated);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, slice: &EndpointSlice) -> Result<(), WriteError> {
        let api = self.api(namespace);
        let name = slice.name_any();
        // Marked before the request so the watch can't report the deletion first.
        self.tracker.lock().expect_deletion(slice);
        let res = self.timed(api.delete(&name, &DeleteParams::default())).await;
        match res {
            Ok(Ok(_)) => {
                tracing::debug!(slice = %name, "deleted EndpointSlice");
                Ok(())
            }
            Ok(Err(kube::Error::Api(rsp))) if rsp.code == 404 => {
                // No deletion event will follow.
                self.tracker.lock().handle_deletion(slice);
                tracing::debug!(slice = %name, "EndpointSlice already deleted");
                Ok(())
            }
            Ok(Err(error)) => {
                self.tracker.lock().cancel_deletion(slice);
                Err(error.into())
            }
            Err(error) => {
                self.tracker.lock().cancel_deletion(slice);
                Err(error)
            }
        }
    }
}

/// Creates fail with a Forbidden status while a namespace is being torn down.
fn is_namespace_terminating(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(rsp) => {
            rsp.code == 403 && rsp.message.contains("because it is being terminated")
        }
        _ => false,
    }
}
