use super::CloudObjectRegistry;
use crate::error::Result;
use crate::messages::{HostCommand, HostReply};
use std::sync::Arc;
use tracing::debug;

impl CloudObjectRegistry {
    /// Executes one remote command against this registry
    pub async fn handle(self: &Arc<Self>, command: HostCommand) -> Result<HostReply> {
        debug!(host = %self.host_id, action = command.action(), "handling host command");
        match command {
            HostCommand::CreateObject { type_name, params, param_names } => {
                let object_id = self.create_new_cloud_object(&type_name, params, param_names).await?;
                Ok(HostReply::Created { object_id })
            }
            HostCommand::StartInvocation { request } => {
                let request_id = self.start_invoking_cloud_object(request)?;
                Ok(HostReply::InvocationStarted { request_id })
            }
            HostCommand::GetField { object_id, field } => {
                let value = self.get_cloud_object_field(object_id, &field)?;
                Ok(HostReply::Field { value })
            }
            HostCommand::SetField { object_id, field, value } => {
                self.set_cloud_object_field(object_id, &field, &value)?;
                Ok(HostReply::Done)
            }
            HostCommand::SuspendInvocation { object_id, request_id } => {
                self.suspend_invocation(object_id, request_id)?;
                Ok(HostReply::Done)
            }
            HostCommand::ResumeInvocation { object_id, request_id } => {
                self.resume_invocation(object_id, request_id)?;
                Ok(HostReply::Done)
            }
            HostCommand::DestroyObject { object_id } => {
                self.destroy_cloud_object(object_id)?;
                Ok(HostReply::Done)
            }
            HostCommand::GetObjectType { object_id } => {
                let type_name = self.get_cloud_object_type(object_id)?;
                Ok(HostReply::TypeName { type_name })
            }
            HostCommand::KeepAlive { object_id } => {
                self.keep_alive_cloud_object(object_id)?;
                Ok(HostReply::Done)
            }
            HostCommand::Shutdown => {
                self.shutdown();
                Ok(HostReply::Done)
            }
            HostCommand::DescribeObjects => Ok(HostReply::Objects { objects: self.descriptors() }),
            HostCommand::PrepareMigration { object_id } => {
                let payload = self.prepare_migration(object_id).await?;
                Ok(HostReply::Prepared { payload })
            }
            HostCommand::DeployMigrated { request } => {
                self.deploy_migrated(request).await?;
                Ok(HostReply::Done)
            }
            HostCommand::CompleteMigration { object_id } => {
                self.complete_migration(object_id)?;
                Ok(HostReply::Done)
            }
            HostCommand::AbortMigration { object_id } => {
                self.abort_migration(object_id)?;
                Ok(HostReply::Done)
            }
            HostCommand::RemoveMigrated { request } => {
                self.remove_migrated(request.object_id)?;
                Ok(HostReply::Done)
            }
        }
    }
}
