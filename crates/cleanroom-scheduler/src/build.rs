//! Build orchestrator - turns a submission into a running image build.

use crate::context::{ContextFiles, assemble_build_context};
use bytes::Bytes;
use cleanroom_config::SystemConfig;
use cleanroom_core::cloud::CloudProvider;
use cleanroom_core::runner::{
    ANNOTATION_JOB_CREATOR, ANNOTATION_JOB_UUID, ANNOTATION_USER_TOKEN, BuildJobSpec, JobRunner,
};
use cleanroom_core::{Error, Result, paths};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build jobs are reaped by the cluster this long after they finish.
pub const BUILD_JOB_TTL: Duration = Duration::from_secs(24 * 3600);

const BUILDER_FLAGS: [&str; 5] = [
    "--dockerfile=Dockerfile",
    "--reproducible",
    "--compressed-caching=false",
    "--cache=true",
    "--cache-ttl=72h",
];

/// Identity of the build being launched.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub uuid: &'a str,
    pub creator: &'a str,
    pub notebook_name: &'a str,
    /// Bearer token of the submitter, carried to the status callback.
    pub token: &'a str,
}

pub struct BuildOrchestrator {
    cloud: Arc<dyn CloudProvider>,
    runner: Arc<dyn JobRunner>,
    config: SystemConfig,
}

impl BuildOrchestrator {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        runner: Arc<dyn JobRunner>,
        config: SystemConfig,
    ) -> Self {
        Self {
            cloud,
            runner,
            config,
        }
    }

    /// Builder invocation for one job.
    ///
    /// `impersonation` is the identity the build uses for KMS calls; empty
    /// when the service has none.
    pub fn build_job_spec(&self, request: &BuildRequest<'_>, impersonation: &str) -> BuildJobSpec {
        let cloud = &self.config.cloud;
        let (uuid, creator, notebook) = (request.uuid, request.creator, request.notebook_name);

        let build_args = [
            ("CREATOR", creator.to_string()),
            (
                "OUTPUTPATH",
                cloud.storage_uri(&paths::output_path(creator, uuid, notebook)),
            ),
            (
                "ENCRYPTED_FILENAME",
                paths::encrypted_output_filename(uuid, notebook),
            ),
            (
                "ENCRYPTED_CLOUDSTORAGE_PATH",
                cloud.storage_uri(&paths::encrypted_output_path(creator, uuid, notebook)),
            ),
            ("JUPYTER_FILENAME", notebook.to_string()),
            ("USER_WORKSPACE", paths::workspace_dir(creator)),
            ("BASE_IMAGE", cloud.base_image()),
            (
                "CUSTOMTOKEN_CLOUDSTORAGE_PATH",
                cloud.storage_uri(&paths::attestation_token_path(creator, uuid)),
            ),
            ("IMPERSONATION_SERVICE_ACCOUNT", impersonation.to_string()),
        ];

        let mut args: Vec<String> = BUILDER_FLAGS.iter().map(|f| f.to_string()).collect();
        args.push(format!(
            "--context={}",
            cloud.storage_uri(&paths::build_context_path(creator, uuid))
        ));
        args.push(format!("--destination={}", cloud.image_tag(creator, uuid)));
        args.extend(
            build_args
                .into_iter()
                .map(|(name, value)| format!("--build-arg={}={}", name, value)),
        );

        let annotations = BTreeMap::from([
            (ANNOTATION_JOB_UUID.to_string(), uuid.to_string()),
            (ANNOTATION_JOB_CREATOR.to_string(), creator.to_string()),
            (ANNOTATION_USER_TOKEN.to_string(), request.token.to_string()),
        ]);

        BuildJobSpec {
            name: paths::build_job_name(uuid),
            annotations,
            image: self.config.build.builder_image.clone(),
            args,
            memory_request: self.config.build.memory_request.clone(),
            service_account: Some(self.config.cluster.pod_service_account.clone()),
            ttl: BUILD_JOB_TTL,
        }
    }

    /// Package the creator's workspace and launch its image build.
    ///
    /// Returns once the build job is accepted by the runner.
    pub async fn launch(&self, request: BuildRequest<'_>) -> Result<()> {
        let workspace = self
            .cloud
            .download(&paths::workspace_path(request.creator))
            .await?;

        let scratch_dir = PathBuf::from(&self.config.build.scratch_dir);
        let files = ContextFiles {
            dockerfile: PathBuf::from(&self.config.build.dockerfile),
            config_file: PathBuf::from(&self.config.build.config_file),
        };
        let tarball = tokio::task::spawn_blocking(move || {
            assemble_build_context(&workspace, &scratch_dir, &files)
        })
        .await
        .map_err(|e| Error::Internal(format!("build context task failed: {}", e)))??;

        let context_path = paths::build_context_path(request.creator, request.uuid);
        self.cloud
            .upload(&context_path, Bytes::from(tarball), true)
            .await?;

        let impersonation = self
            .cloud
            .service_account_email()
            .await?
            .unwrap_or_default();
        let spec = self.build_job_spec(&request, &impersonation);
        let name = spec.name.clone();
        self.runner.create(spec).await?;

        info!(
            job_uuid = %request.uuid,
            creator = %request.creator,
            build_job = %name,
            "Launched image build"
        );
        Ok(())
    }
}
