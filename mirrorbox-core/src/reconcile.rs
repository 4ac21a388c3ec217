//! Startup reconciliation.
//!
//! The cloud side is protected across downtime by the persisted
//! continuation cursor; the local side is not. This pass closes the gap by
//! diffing the two shadows after the feed has drained to idle: first the
//! cloud-side surplus is resolved, then, once the processor is idle again,
//! the local-side surplus.
//!
//! Direction is governed by one policy knob: everything under the
//! mirror-only prefix flows cloud to local, unconditionally. Outside the
//! prefix, `remote_precedence` decides who wins for entries only one side
//! has: a freshly built cloud manifest cannot distinguish "created remotely
//! while we were down" from "deleted locally while we were down", so the
//! cloud copy is kept; a resumed manifest can, so the local state is
//! canonical.

use crate::change::{ChangeInfo, ChangeKind, RepoTag};
use crate::checksum::{CHECKSUM_UNKNOWN, CHECKSUM_UNREADABLE};
use crate::drive::DRIVE_ROOT_NAME;
use crate::error::Result;
use crate::manifest::{FileRecord, Manifest};
use crate::path::SyncPath;
use crate::processor::{ChangeProcessor, ChangeSink};
use crate::repository::cloud::CloudRepository;
use crate::repository::local::LocalRepository;

/// Path prefix whose contents mirror one-way, cloud to local. Local edits
/// beneath it are overwritten.
pub const MIRROR_ONLY_PREFIX: &str = "My Drive/Mirror";

pub async fn reconcile(
    cloud: &CloudRepository,
    local: &LocalRepository,
    processor: &ChangeProcessor,
    remote_precedence: bool,
) -> Result<()> {
    let cloud_manifest = cloud.manifest_snapshot().await;
    let local_manifest = local.manifest_snapshot().await;

    for change in plan_cloud_phase(&cloud_manifest, &local_manifest, remote_precedence) {
        processor.queue_change(change).await;
    }
    processor.wait_idle().await;

    // The first phase mutated both shadows; re-snapshot before diffing the
    // other direction.
    let cloud_manifest = cloud.manifest_snapshot().await;
    let local_manifest = local.manifest_snapshot().await;

    for change in plan_local_phase(&cloud_manifest, &local_manifest) {
        processor.queue_change(change).await;
    }
    processor.wait_idle().await;
    Ok(())
}

fn mirror_prefix() -> SyncPath {
    SyncPath::new(MIRROR_ONLY_PREFIX).expect("mirror prefix is a valid path")
}

/// Cloud entries the local side lacks.
pub(crate) fn plan_cloud_phase(
    cloud: &Manifest,
    local: &Manifest,
    remote_precedence: bool,
) -> Vec<ChangeInfo> {
    let mirror = mirror_prefix();
    let mut plan = Vec::new();

    // Folders first so file creations land in existing directories.
    for (_, path) in cloud.folders() {
        if path.as_str() == DRIVE_ROOT_NAME || local.id_at(path).is_some() {
            continue;
        }
        // The prefix root itself always mirrors downward.
        if path.starts_with(&mirror) || remote_precedence {
            plan.push(ChangeInfo::new(
                RepoTag::GoogleDrive,
                ChangeKind::Created,
                path.clone(),
                true,
                CHECKSUM_UNKNOWN,
            ));
        } else {
            plan.push(ChangeInfo::new(
                RepoTag::LocalDrive,
                ChangeKind::Removed,
                path.clone(),
                true,
                CHECKSUM_UNKNOWN,
            ));
        }
    }

    for (_, record) in cloud.files() {
        if local.id_at(&record.path).is_some() {
            continue;
        }
        if record.path.starts_with(&mirror) || remote_precedence {
            plan.push(ChangeInfo::new(
                RepoTag::GoogleDrive,
                ChangeKind::Created,
                record.path.clone(),
                false,
                record.checksum.clone(),
            ));
        } else {
            // The local deletion is canonical; take the file down remotely.
            plan.push(ChangeInfo::new(
                RepoTag::LocalDrive,
                ChangeKind::Removed,
                record.path.clone(),
                false,
                record.checksum.clone(),
            ));
        }
    }

    plan
}

/// Local entries the cloud side lacks or holds differently.
pub(crate) fn plan_local_phase(cloud: &Manifest, local: &Manifest) -> Vec<ChangeInfo> {
    let mirror = mirror_prefix();
    let mut plan = Vec::new();

    for (_, path) in local.folders() {
        if path.as_str() == DRIVE_ROOT_NAME || cloud.id_at(path).is_some() {
            continue;
        }
        if path.starts_with(&mirror) && path.as_str() != MIRROR_ONLY_PREFIX {
            // Mirror-only means the cloud is truth: take it down locally.
            plan.push(ChangeInfo::new(
                RepoTag::GoogleDrive,
                ChangeKind::Removed,
                path.clone(),
                true,
                CHECKSUM_UNKNOWN,
            ));
        } else if path.as_str() != MIRROR_ONLY_PREFIX {
            plan.push(ChangeInfo::new(
                RepoTag::LocalDrive,
                ChangeKind::Created,
                path.clone(),
                true,
                CHECKSUM_UNKNOWN,
            ));
        }
    }

    for (_, record) in local.files() {
        match cloud.file_at(&record.path) {
            Some(cloud_record) if !records_differ(cloud_record, record) => {}
            Some(cloud_record) => {
                if record.path.starts_with(&mirror) {
                    plan.push(
                        ChangeInfo::new(
                            RepoTag::GoogleDrive,
                            ChangeKind::Modified,
                            record.path.clone(),
                            false,
                            cloud_record.checksum.clone(),
                        )
                        .with_old_checksum(record.checksum.clone()),
                    );
                } else {
                    plan.push(
                        ChangeInfo::new(
                            RepoTag::LocalDrive,
                            ChangeKind::Modified,
                            record.path.clone(),
                            false,
                            record.checksum.clone(),
                        )
                        .with_old_checksum(cloud_record.checksum.clone()),
                    );
                }
            }
            None => {
                if record.path.starts_with(&mirror) {
                    plan.push(ChangeInfo::new(
                        RepoTag::GoogleDrive,
                        ChangeKind::Removed,
                        record.path.clone(),
                        false,
                        record.checksum.clone(),
                    ));
                } else {
                    plan.push(ChangeInfo::new(
                        RepoTag::LocalDrive,
                        ChangeKind::Created,
                        record.path.clone(),
                        false,
                        record.checksum.clone(),
                    ));
                }
            }
        }
    }

    plan
}

/// Divergence test for reconciliation: checksums when both are known,
/// sizes otherwise.
fn records_differ(a: &FileRecord, b: &FileRecord) -> bool {
    let known = |sum: &str| sum != CHECKSUM_UNKNOWN && sum != CHECKSUM_UNREADABLE;
    if known(&a.checksum) && known(&b.checksum) {
        a.checksum != b.checksum
    } else {
        a.size != b.size
    }
}
