//! Remote backend surface
//!
//! The backend is an opaque asynchronous service. Every operation may reject
//! with an unstructured [`Failure`]; interpretation happens in the client's
//! error classifier, never here.

use std::sync::Arc;

use crate::failure::Failure;
use crate::identity::Identity;
use crate::types::{
    ExportBundle, Field, FieldDraft, FieldId, Task, TaskAttribute, TaskDraft, TaskId, UserProfile,
};

/// Remote procedure interface of the Fieldtask backend
///
/// Implementations are bound to the identity they were created for; the
/// caller of each operation is that identity.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    // Profile

    /// Profile of the caller; `None` for users that have not set one up
    async fn get_caller_profile(&self) -> Result<Option<UserProfile>, Failure>;

    /// Create or replace the caller's profile
    async fn save_caller_profile(&self, profile: UserProfile) -> Result<(), Failure>;

    // Fields

    /// Create a field
    async fn create_field(&self, draft: FieldDraft) -> Result<FieldId, Failure>;

    /// All of the caller's fields
    async fn list_fields(&self) -> Result<Vec<Field>, Failure>;

    /// Replace a field's name and appearance
    async fn update_field(&self, id: FieldId, draft: FieldDraft) -> Result<(), Failure>;

    /// Delete a field and its tasks
    async fn delete_field(&self, id: FieldId) -> Result<(), Failure>;

    // Tasks

    /// Create a task
    async fn create_task(&self, draft: TaskDraft) -> Result<TaskId, Failure>;

    /// All of the caller's tasks
    async fn list_all_tasks(&self) -> Result<Vec<Task>, Failure>;

    /// Tasks of one field
    async fn list_tasks_by_field(&self, field: FieldId) -> Result<Vec<Task>, Failure>;

    /// Replace a task's attributes
    async fn update_task(&self, id: TaskId, draft: TaskDraft) -> Result<(), Failure>;

    /// Delete a task
    async fn delete_task(&self, id: TaskId) -> Result<(), Failure>;

    /// Mark a task completed
    async fn mark_completed(&self, id: TaskId) -> Result<(), Failure>;

    /// Revert a completion
    async fn undo_completion(&self, id: TaskId) -> Result<(), Failure>;

    /// Move a task to another field
    async fn move_to_field(&self, id: TaskId, field: FieldId) -> Result<(), Failure>;

    /// Case-insensitive name search within a field
    async fn search_tasks(&self, field: FieldId, term: String) -> Result<Vec<Task>, Failure>;

    /// Tasks of a field whose attribute lies within `min..=max`
    async fn filter_by_attribute(
        &self,
        field: FieldId,
        attribute: TaskAttribute,
        min: u64,
        max: u64,
    ) -> Result<Vec<Task>, Failure>;

    // Bulk

    /// Export every field and task of the caller
    async fn export_all(&self) -> Result<ExportBundle, Failure>;

    /// Replace all of the caller's data with the bundle
    async fn import_all(&self, bundle: ExportBundle) -> Result<(), Failure>;
}

/// Builds a backend client bound to an identity
///
/// Construction is a network round trip and may fail or hang.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Create a backend client acting as `identity`
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn Backend>, Failure>;
}
