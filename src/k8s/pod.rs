use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::DeleteParams;
use tracing::info;

use crate::error::{UpgradeError, api_code};
use crate::upgrade::{DeleteOutcome, PodDeleteEngine, PodRef};

pub struct KubePodDeleter {
    client: kube::Client,
}

impl KubePodDeleter {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

fn delete_params(grace_period_seconds: Option<u32>) -> DeleteParams {
    DeleteParams {
        grace_period_seconds,
        ..DeleteParams::default()
    }
}

#[async_trait]
impl PodDeleteEngine for KubePodDeleter {
    async fn delete_pod(
        &self,
        pod: &PodRef,
        grace_period_seconds: Option<u32>,
    ) -> Result<DeleteOutcome, UpgradeError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        match api
            .delete(&pod.name, &delete_params(grace_period_seconds))
            .await
        {
            Ok(_) => {
                info!(pod = %pod, "Deleted driver pod");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if api_code(&e) == Some(404) => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(UpgradeError::Delete {
                pod: pod.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
