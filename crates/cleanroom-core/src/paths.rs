//! Deterministic names for everything a job touches outside the database.
//!
//! These are shared by the API server and the reconciliation monitor, which
//! recover a job's resources from names alone, so they must stay bit-exact.

use regex::Regex;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Prefix of every build job created for a submission.
pub const BUILD_JOB_PREFIX: &str = "kaniko-";

const PROVIDER_NAME_MAX: usize = 32;

static CREATOR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,39}$").expect("valid creator pattern"));

fn short(uuid: &str) -> &str {
    uuid.get(..8).unwrap_or(uuid)
}

/// Directory name the user's workspace archive unpacks into.
pub fn workspace_dir(creator: &str) -> String {
    format!("{}-workspace", creator)
}

pub fn workspace_file(creator: &str) -> String {
    format!("{}.tar.gz", workspace_dir(creator))
}

/// `<creator>/<creator>-workspace.tar.gz`
pub fn workspace_path(creator: &str) -> String {
    format!("{}/{}", creator, workspace_file(creator))
}

/// `<creator>/context-<uuid>.tar.gz`
pub fn build_context_path(creator: &str, uuid: &str) -> String {
    format!("{}/context-{}.tar.gz", creator, uuid)
}

/// `out-<uuid[:8]>-<filename>`; identifiers shorter than 8 characters are used whole.
pub fn output_filename(id: &str, filename: &str) -> String {
    format!("out-{}-{}", short(id), filename)
}

pub fn encrypted_output_filename(uuid: &str, filename: &str) -> String {
    format!("enc-{}-{}", short(uuid), filename)
}

/// `<creator>/output/out-<uuid[:8]>-<filename>`
pub fn output_path(creator: &str, uuid: &str, filename: &str) -> String {
    format!("{}/output/{}", creator, output_filename(uuid, filename))
}

/// `<creator>/output/enc-<uuid[:8]>-<filename>`
pub fn encrypted_output_path(creator: &str, uuid: &str, filename: &str) -> String {
    format!(
        "{}/output/{}",
        creator,
        encrypted_output_filename(uuid, filename)
    )
}

/// `<creator>/output/<uuid>-token`
pub fn attestation_token_path(creator: &str, uuid: &str) -> String {
    format!("{}/output/{}-token", creator, uuid)
}

/// Image repository name of a job's build: `<creator>-<uuid>`.
pub fn image_name(creator: &str, uuid: &str) -> String {
    format!("{}-{}", creator, uuid)
}

/// `<creator>-<uuid[:8]>`
pub fn instance_name(creator: &str, uuid: &str) -> String {
    format!("{}-{}", creator, short(uuid))
}

/// Recover the creator from an instance name built by [`instance_name`].
pub fn creator_from_instance_name<'a>(name: &'a str, uuid: &str) -> Option<&'a str> {
    name.strip_suffix(short(uuid))
        .and_then(|rest| rest.strip_suffix('-'))
        .filter(|creator| !creator.is_empty())
}

/// `<creator>-tee-provider`, truncated to 32 characters.
pub fn provider_name(creator: &str) -> String {
    format!("{}-tee-provider", creator)
        .chars()
        .take(PROVIDER_NAME_MAX)
        .collect()
}

/// Identifier of the creator's KMS key within the key ring.
pub fn key_id(creator: &str) -> String {
    format!("{}-key", creator)
}

/// `kaniko-<uuid>`
pub fn build_job_name(uuid: &str) -> String {
    format!("{}{}", BUILD_JOB_PREFIX, uuid)
}

/// Creators are embedded in bucket paths, image names and instance names.
pub fn validate_creator(creator: &str) -> Result<()> {
    if CREATOR_PATTERN.is_match(creator) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "creator '{}' must be 1-40 lowercase letters, digits or '-'",
            creator
        )))
    }
}

pub fn validate_notebook_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(Error::InvalidInput(format!(
            "invalid notebook file name '{}'",
            name
        )));
    }
    Ok(())
}
