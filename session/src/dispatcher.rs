//! Routes classified responses to the project model and the event hub.

use std::sync::Arc;

use crate::collaborators::ProjectModel;
use crate::events::EventHub;
use crate::response::Response;

pub struct ResponseDispatcher {
    hub: Arc<EventHub>,
}

impl ResponseDispatcher {
    #[must_use]
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }

    /// Classify `frame`, apply project side effects, then publish.
    ///
    /// Side effects run first so observers of a result see the updated model.
    pub fn dispatch(&self, frame: &serde_json::Value, project: Option<&mut dyn ProjectModel>) {
        let response = Response::classify(frame);
        let hub = &self.hub;

        match response {
            Response::Hello(hello) => {
                tracing::info!(
                    api_level = hello.api_level,
                    api_compat_level = hello.api_compat_level,
                    "Build tool handshake"
                );
                hub.hello.emit(&hello);
            }
            Response::ProjectResolved(result) => {
                if let Some(project) = project {
                    project.set_data(frame, true);
                    project.update_steps();
                }
                hub.project_resolved.emit(&result);
            }
            Response::ProjectBuilt(result) => {
                if let Some(project) = project {
                    project.set_data(frame, false);
                    project.update_steps();
                }
                hub.project_built.emit(&result);
            }
            Response::ProjectCleaned(result) => {
                if let Some(project) = project {
                    project.update_steps();
                }
                hub.project_cleaned.emit(&result);
            }
            Response::ProjectInstalled(result) => hub.project_installed.emit(&result),
            Response::LogMessage(message) => hub.log_message.emit(&message),
            Response::Warning(warning) => hub.warning_message.emit(&warning),
            Response::TaskStarted(task) => hub.task_started.emit(&task),
            Response::TaskProgress(progress) => hub.task_progress.emit(&progress),
            Response::TaskMaxProgress(max) => hub.task_max_progress.emit(&max),
            Response::CommandDescription(desc) => hub.command_description.emit(&desc),
            Response::ProcessResult(result) => hub.process_result.emit(&result),
            Response::RunEnvironment(result) => {
                if let Some(project) = project {
                    project.set_run_environment(&result.environment);
                }
                hub.run_environment.emit(&result);
            }
            Response::Ignored(kind) => tracing::debug!(%kind, "Ignoring response"),
            Response::Unknown(kind) => tracing::debug!(%kind, "Unknown response type"),
        }
    }
}
