//! ENI lifecycle: create and attach on setup, detach and delete on teardown.

use itertools::Itertools;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::ec2::{CreateRequest, Ec2Api, InterfaceStatus};
use crate::error::{EniError, Result};
use crate::metadata::{self, InvocationContext, MetadataSource};
use crate::netns::NetworkStack;
use crate::state::{EniRecord, HostLock, Response, WorkDir};
use crate::wait::{self, Backoff};

/// Tag carrying the owning container id on every interface we create
pub const CONTAINER_TAG: &str = "cni.container-id";

const MAX_ATTACH_ATTEMPTS: u32 = 4;
const MAX_DELETE_ATTEMPTS: u32 = 5;

/// Drives an [`Ec2Api`] through the interface lifecycle and keeps the
/// working directory's record in step with it
pub struct EniProvisioner<'a, A: Ec2Api> {
    api: &'a A,
    settings: &'a Settings,
    retry_delay: Duration,
}

impl<'a, A: Ec2Api> EniProvisioner<'a, A> {
    pub fn new(api: &'a A, settings: &'a Settings) -> Self {
        Self {
            api,
            settings,
            retry_delay: Duration::from_millis(250),
        }
    }

    /// Initial delay between retries of provider calls
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn retry_backoff(&self, timeout: Duration) -> Backoff {
        Backoff {
            initial: self.retry_delay,
            max: self.retry_delay.saturating_mul(16),
            timeout,
        }
    }

    /// Create an interface in the context's subnet, attach it to this
    /// instance and wait for its device to appear on the host.
    ///
    /// Any failure after creation deletes the interface again.
    pub fn create_and_attach(
        &self,
        ctx: &InvocationContext,
        metadata: &impl MetadataSource,
        stack: &impl NetworkStack,
    ) -> Result<EniRecord> {
        let work_dir = &ctx.work_dir;
        work_dir.create()?;

        if let Some(stale) = work_dir.load_record()? {
            warn!(
                container_id = %ctx.container_id,
                interface_id = %stale.interface_id,
                "Found interface from an earlier setup attempt, releasing it first"
            );
            self.detach(work_dir, Some(&stale))?;
            self.delete(work_dir, Some(&stale))?;
        }

        let mut tags = ctx.tags.clone();
        tags.insert(CONTAINER_TAG.to_string(), ctx.container_id.clone());
        let description = format!("CNI interface for container {}", ctx.container_id);

        info!(
            subnet_id = %ctx.subnet_id,
            security_groups = %ctx.security_groups.iter().join(","),
            "Creating network interface"
        );
        let created = self
            .api
            .create_interface(&CreateRequest {
                region: &ctx.region,
                subnet_id: &ctx.subnet_id,
                security_groups: &ctx.security_groups,
                tags: &tags,
                description: &description,
            })
            .map_err(EniError::Provision)?;
        info!(interface_id = %created.interface_id, mac = %created.mac_address, "Created network interface");

        let mut record = EniRecord::new(&ctx.container_id, &ctx.region, &created.interface_id, &created.mac_address);
        record.private_ip = created.private_ip.clone();

        let attached = work_dir
            .save_response(Response::Create, &created.raw)
            .and_then(|_| work_dir.save_record(&record))
            .and_then(|_| self.attach(ctx, metadata, stack, &mut record));

        match attached {
            Ok(()) => Ok(record),
            Err(e) => {
                error!(error = %e, interface_id = %record.interface_id, "Setup failed after creating interface, rolling back");
                self.rollback(work_dir, &record);
                Err(e)
            }
        }
    }

    fn attach(
        &self,
        ctx: &InvocationContext,
        metadata: &impl MetadataSource,
        stack: &impl NetworkStack,
        record: &mut EniRecord,
    ) -> Result<()> {
        // Index selection and attach must not interleave with another setup on this host
        let _lock = HostLock::acquire(&self.settings.state_dir)?;

        let mut index = metadata::device_count(metadata)?;
        let backoff = self.retry_backoff(self.settings.attach_timeout);

        let attachment = wait::retry("attach", MAX_ATTACH_ATTEMPTS, backoff, EniError::is_retryable, |_| {
            let device_index = index;
            debug!(device_index, interface_id = %record.interface_id, "Attaching network interface");
            self.api
                .attach_interface(&ctx.region, &record.interface_id, &ctx.instance_id, device_index)
                .map(|a| (a, device_index))
                .map_err(|source| {
                    if source.is_device_index_in_use() {
                        index += 1;
                    }
                    if source.is_attachment_limit() {
                        EniError::AttachLimitExceeded {
                            instance_id: ctx.instance_id.clone(),
                            message: source.message,
                        }
                    } else {
                        EniError::Attach {
                            interface_id: record.interface_id.clone(),
                            source,
                        }
                    }
                })
        });
        let (attachment, device_index) = attachment?;

        info!(
            attachment_id = %attachment.attachment_id,
            device_index,
            "Attached network interface"
        );
        record.attachment_id = Some(attachment.attachment_id.clone());
        record.device_index = Some(device_index);
        ctx.work_dir.save_response(Response::Attach, &attachment.raw)?;
        ctx.work_dir.save_record(record)?;

        if let Err(e) = self
            .api
            .set_delete_on_termination(&ctx.region, &record.interface_id, &attachment.attachment_id)
        {
            warn!(error = %e, "Could not mark interface for deletion on instance termination");
        }

        let mac = record.mac_address.clone();
        let link = wait::poll_until(
            &format!("device with MAC {}", mac),
            self.retry_backoff(self.settings.attach_timeout),
            || stack.link_by_mac(&mac),
        )
        .map_err(|e| match e {
            EniError::Timeout { waited, .. } => EniError::DeviceTimeout {
                mac: mac.clone(),
                waited,
            },
            other => other,
        })?;
        info!(link = %link, mac = %mac, "Interface device appeared on host");

        record.link_name = Some(link);
        ctx.work_dir.save_record(record)
    }

    /// Detach the recorded attachment. Nothing to do without a record or
    /// before the interface was attached.
    pub fn detach(&self, work_dir: &WorkDir, record: Option<&EniRecord>) -> Result<()> {
        let Some(attachment_id) = record.and_then(|r| r.attachment_id.as_deref()) else {
            debug!(path = %work_dir.path().display(), "No attachment recorded, nothing to detach");
            return Ok(());
        };
        let region = record.map(|r| r.region.as_str()).unwrap_or_default();

        match self.api.detach_interface(region, attachment_id) {
            Ok(raw) => {
                if let Err(e) = work_dir.save_response(Response::Detach, &raw) {
                    debug!(error = %e, "Could not save detach response");
                }
                info!(attachment_id, "Detached network interface");
                Ok(())
            }
            Err(source) if source.is_not_found() => {
                info!(attachment_id, "Attachment already gone");
                Ok(())
            }
            Err(source) => Err(EniError::Detach {
                attachment_id: attachment_id.to_string(),
                source,
            }),
        }
    }

    /// Delete the recorded interface once the provider reports it detached.
    /// Nothing to do without a record.
    pub fn delete(&self, work_dir: &WorkDir, record: Option<&EniRecord>) -> Result<()> {
        let Some(record) = record else {
            debug!(path = %work_dir.path().display(), "No record, nothing to delete");
            return Ok(());
        };
        let interface_id = record.interface_id.as_str();
        let backoff = self.retry_backoff(self.settings.detach_timeout);

        let settled = wait::poll_until("interface to become available", backoff, || {
            match self.api.interface_status(&record.region, interface_id) {
                Ok(InterfaceStatus::Available) => Ok(Some(true)),
                Ok(status) => {
                    debug!(interface_id, ?status, "Interface not yet available");
                    Ok(None)
                }
                Err(source) if source.is_not_found() => Ok(Some(false)),
                Err(source) => Err(EniError::Delete {
                    interface_id: interface_id.to_string(),
                    source,
                }),
            }
        });

        match settled {
            Ok(false) => {
                info!(interface_id, "Interface already deleted");
                return Ok(());
            }
            Ok(true) => {}
            Err(EniError::Timeout { waited, .. }) => {
                warn!(interface_id, ?waited, "Interface still attached, attempting delete anyway");
            }
            Err(e) => return Err(e),
        }

        let raw = wait::retry("delete", MAX_DELETE_ATTEMPTS, backoff, EniError::is_retryable, |_| {
            match self.api.delete_interface(&record.region, interface_id) {
                Ok(raw) => Ok(raw),
                Err(source) if source.is_not_found() => Ok(String::new()),
                Err(source) => Err(EniError::Delete {
                    interface_id: interface_id.to_string(),
                    source,
                }),
            }
        })?;

        if let Err(e) = work_dir.save_response(Response::Delete, &raw) {
            debug!(error = %e, "Could not save delete response");
        }
        info!(interface_id, "Deleted network interface");
        Ok(())
    }

    /// Undo a partial setup. Failures are logged as leaks.
    pub fn rollback(&self, work_dir: &WorkDir, record: &EniRecord) {
        if let Err(e) = self.detach(work_dir, Some(record)) {
            warn!(error = %e, "Rollback could not detach interface");
        }
        match self.delete(work_dir, Some(record)) {
            Ok(()) => {
                if let Err(e) = work_dir.remove() {
                    warn!(error = %e, "Could not remove working directory");
                }
            }
            Err(e) => error!(
                error = %e,
                interface_id = %record.interface_id,
                path = %work_dir.path().display(),
                "Leaked network interface during rollback; record kept for later release"
            ),
        }
    }
}
