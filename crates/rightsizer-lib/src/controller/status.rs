//! Status writes with optimistic concurrency

use super::cluster::ClusterApi;
use crate::crd::RightSizingPolicy;
use crate::error::{Error, Result};
use kube::ResourceExt;
use tracing::debug;

/// Replace the status of `policy` with its in-memory status.
///
/// On a resourceVersion conflict the latest object is fetched, the desired
/// status is laid over it and the write is retried, up to `retries` times.
/// On success `policy` is replaced by the object the server returned.
pub async fn write_status(
    cluster: &dyn ClusterApi,
    policy: &mut RightSizingPolicy,
    retries: u32,
) -> Result<()> {
    let desired = policy.status.clone();
    let mut attempt = 0;

    loop {
        match cluster.replace_policy_status(policy).await {
            Ok(updated) => {
                *policy = updated;
                return Ok(());
            }
            Err(e) if e.is_conflict() && attempt < retries => {
                attempt += 1;
                debug!(
                    policy = %policy.key(),
                    attempt = attempt,
                    "Status write conflict, refetching"
                );
                let namespace = policy.namespace().unwrap_or_default();
                let latest = cluster
                    .get_policy(&namespace, &policy.name_any())
                    .await?
                    .ok_or_else(|| Error::NotFound {
                        kind: "RightSizingPolicy",
                        name: policy.key(),
                    })?;
                *policy = latest;
                policy.status = desired.clone();
            }
            Err(e) if e.is_conflict() => return Err(Error::Conflict(policy.key())),
            Err(e) => return Err(e),
        }
    }
}
