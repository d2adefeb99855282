//! In-memory backend shared by every connection of a test

use chrono::Utc;
use dashmap::DashMap;
use fieldtask_model::{
    Backend, ExportBundle, Failure, Field, FieldDraft, FieldId, FieldMetrics, Identity, Principal,
    Task, TaskAttribute, TaskDraft, TaskId, UserProfile,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

pub const NOT_REGISTERED: &str = "Unauthorized: User is not registered";
pub const ANONYMOUS_REJECTED: &str = "Unauthorized: Anonymous callers cannot perform this action";

/// Data and fault knobs shared by all [`InMemoryBackend`]s built from it
#[derive(Debug, Default)]
pub struct InMemoryStore {
    profiles: DashMap<Principal, UserProfile>,
    fields: DashMap<FieldId, Field>,
    tasks: DashMap<TaskId, Task>,
    profile_failures: Mutex<VecDeque<Failure>>,
    profile_delay: Mutex<Option<Duration>>,
    profile_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend acting as `identity`
    pub fn backend_for(self: &Arc<Self>, identity: &Identity) -> InMemoryBackend {
        InMemoryBackend {
            store: Arc::clone(self),
            caller: identity.principal().clone(),
        }
    }

    /// Register a user
    pub fn seed_profile(&self, principal: &Principal, profile: UserProfile) {
        self.profiles.insert(principal.clone(), profile);
    }

    /// Fail the next profile fetch with `failure`
    pub fn fail_profile_next(&self, failure: Failure) {
        self.profile_failures.lock().push_back(failure);
    }

    /// Delay every profile fetch
    pub fn delay_profile(&self, delay: Option<Duration>) {
        *self.profile_delay.lock() = delay;
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn profile_of(&self, principal: &Principal) -> Option<UserProfile> {
        self.profiles.get(principal).map(|p| p.value().clone())
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// [`Backend`] over an [`InMemoryStore`], bound to one caller
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    store: Arc<InMemoryStore>,
    caller: Principal,
}

impl InMemoryBackend {
    pub fn caller(&self) -> &Principal {
        &self.caller
    }

    fn require_user(&self) -> Result<(), Failure> {
        if self.caller.is_anonymous() {
            return Err(Failure::reject(5, ANONYMOUS_REJECTED));
        }
        if !self.store.profiles.contains_key(&self.caller) {
            return Err(Failure::reject(5, NOT_REGISTERED));
        }
        Ok(())
    }

    fn owned_field(&self, id: &FieldId) -> Result<Field, Failure> {
        match self.store.fields.get(id) {
            Some(field) if field.created_by == self.caller => Ok(field.value().clone()),
            Some(_) => Err(Failure::reject(5, "Unauthorized: Field belongs to another user")),
            None => Err(Failure::reject(4, format!("Field not found: {id}"))),
        }
    }

    fn owned_task(&self, id: &TaskId) -> Result<Task, Failure> {
        match self.store.tasks.get(id) {
            Some(task) if task.created_by == self.caller => Ok(task.value().clone()),
            Some(_) => Err(Failure::reject(5, "Unauthorized: Task belongs to another user")),
            None => Err(Failure::reject(4, format!("Task not found: {id}"))),
        }
    }

    fn caller_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .store
            .tasks
            .iter()
            .filter(|t| t.created_by == self.caller)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    fn with_metrics(&self, mut field: Field) -> Field {
        let tasks: Vec<Task> = self
            .caller_tasks()
            .into_iter()
            .filter(|t| t.field_id == field.id)
            .collect();
        field.metrics = FieldMetrics::compute(&tasks);
        field
    }

    fn update_task_with(&self, id: &TaskId, f: impl FnOnce(&mut Task)) -> Result<(), Failure> {
        self.require_user()?;
        let mut task = self.owned_task(id)?;
        f(&mut task);
        self.store.tasks.insert(id.clone(), task);
        Ok(())
    }
}

fn invalid(err: impl std::fmt::Display) -> Failure {
    Failure::reject(4, format!("Invalid input: {err}"))
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    async fn get_caller_profile(&self) -> Result<Option<UserProfile>, Failure> {
        self.store.profile_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.store.profile_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.store.profile_failures.lock().pop_front();
        if let Some(failure) = failure {
            return Err(failure);
        }
        if self.caller.is_anonymous() {
            return Ok(None);
        }
        match self.store.profile_of(&self.caller) {
            Some(profile) => Ok(Some(profile)),
            None => Err(Failure::reject(5, NOT_REGISTERED)),
        }
    }

    async fn save_caller_profile(&self, profile: UserProfile) -> Result<(), Failure> {
        if self.caller.is_anonymous() {
            return Err(Failure::reject(5, ANONYMOUS_REJECTED));
        }
        if profile.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        self.store.profiles.insert(self.caller.clone(), profile);
        Ok(())
    }

    async fn create_field(&self, draft: FieldDraft) -> Result<FieldId, Failure> {
        self.require_user()?;
        draft.validate().map_err(invalid)?;
        let id = FieldId(Ulid::new().to_string());
        let field = Field {
            id: id.clone(),
            name: draft.name,
            icon: draft.icon,
            color: draft.color,
            background: draft.background,
            created_at: Utc::now(),
            created_by: self.caller.clone(),
            metrics: FieldMetrics::default(),
        };
        self.store.fields.insert(id.clone(), field);
        Ok(id)
    }

    async fn list_fields(&self) -> Result<Vec<Field>, Failure> {
        self.require_user()?;
        let mut fields: Vec<Field> = self
            .store
            .fields
            .iter()
            .filter(|f| f.created_by == self.caller)
            .map(|f| self.with_metrics(f.value().clone()))
            .collect();
        fields.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(fields)
    }

    async fn update_field(&self, id: FieldId, draft: FieldDraft) -> Result<(), Failure> {
        self.require_user()?;
        draft.validate().map_err(invalid)?;
        let mut field = self.owned_field(&id)?;
        field.name = draft.name;
        field.icon = draft.icon;
        field.color = draft.color;
        field.background = draft.background;
        self.store.fields.insert(id, field);
        Ok(())
    }

    async fn delete_field(&self, id: FieldId) -> Result<(), Failure> {
        self.require_user()?;
        self.owned_field(&id)?;
        self.store.fields.remove(&id);
        self.store.tasks.retain(|_, task| task.field_id != id);
        Ok(())
    }

    async fn create_task(&self, draft: TaskDraft) -> Result<TaskId, Failure> {
        self.require_user()?;
        draft.validate().map_err(invalid)?;
        self.owned_field(&draft.field_id)?;
        for dependency in &draft.dependencies {
            self.owned_task(dependency)?;
        }
        let id = TaskId(Ulid::new().to_string());
        let task = Task {
            id: id.clone(),
            field_id: draft.field_id,
            name: draft.name,
            urgency: draft.urgency,
            value: draft.value,
            interest: draft.interest,
            influence: draft.influence,
            duration: draft.duration,
            duration_unit: draft.duration_unit,
            dependencies: draft.dependencies,
            completed: false,
            created_at: Utc::now(),
            created_by: self.caller.clone(),
        };
        self.store.tasks.insert(id.clone(), task);
        Ok(id)
    }

    async fn list_all_tasks(&self) -> Result<Vec<Task>, Failure> {
        self.require_user()?;
        Ok(self.caller_tasks())
    }

    async fn list_tasks_by_field(&self, field: FieldId) -> Result<Vec<Task>, Failure> {
        self.require_user()?;
        self.owned_field(&field)?;
        Ok(self
            .caller_tasks()
            .into_iter()
            .filter(|t| t.field_id == field)
            .collect())
    }

    async fn update_task(&self, id: TaskId, draft: TaskDraft) -> Result<(), Failure> {
        draft.validate().map_err(invalid)?;
        if draft.dependencies.contains(&id) {
            return Err(invalid("task cannot depend on itself"));
        }
        self.update_task_with(&id, |task| {
            task.field_id = draft.field_id;
            task.name = draft.name;
            task.urgency = draft.urgency;
            task.value = draft.value;
            task.interest = draft.interest;
            task.influence = draft.influence;
            task.duration = draft.duration;
            task.duration_unit = draft.duration_unit;
            task.dependencies = draft.dependencies;
        })
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), Failure> {
        self.require_user()?;
        self.owned_task(&id)?;
        self.store.tasks.remove(&id);
        Ok(())
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), Failure> {
        self.update_task_with(&id, |task| task.completed = true)
    }

    async fn undo_completion(&self, id: TaskId) -> Result<(), Failure> {
        self.update_task_with(&id, |task| task.completed = false)
    }

    async fn move_to_field(&self, id: TaskId, field: FieldId) -> Result<(), Failure> {
        self.require_user()?;
        self.owned_field(&field)?;
        self.update_task_with(&id, |task| task.field_id = field)
    }

    async fn search_tasks(&self, field: FieldId, term: String) -> Result<Vec<Task>, Failure> {
        let needle = term.to_lowercase();
        Ok(self
            .list_tasks_by_field(field)
            .await?
            .into_iter()
            .filter(|t| t.name.to_lowercase().contains(&needle))
            .collect())
    }

    async fn filter_by_attribute(
        &self,
        field: FieldId,
        attribute: TaskAttribute,
        min: u64,
        max: u64,
    ) -> Result<Vec<Task>, Failure> {
        Ok(self
            .list_tasks_by_field(field)
            .await?
            .into_iter()
            .filter(|t| (min..=max).contains(&attribute.read(t)))
            .collect())
    }

    async fn export_all(&self) -> Result<ExportBundle, Failure> {
        Ok(ExportBundle {
            fields: self.list_fields().await?,
            tasks: self.list_all_tasks().await?,
        })
    }

    async fn import_all(&self, bundle: ExportBundle) -> Result<(), Failure> {
        self.require_user()?;
        self.store.fields.retain(|_, f| f.created_by != self.caller);
        self.store.tasks.retain(|_, t| t.created_by != self.caller);
        for mut field in bundle.fields {
            field.created_by = self.caller.clone();
            self.store.fields.insert(field.id.clone(), field);
        }
        for mut task in bundle.tasks {
            task.created_by = self.caller.clone();
            self.store.tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldtask_model::DurationUnit;
    use pretty_assertions::assert_eq;

    fn registered() -> (Arc<InMemoryStore>, InMemoryBackend) {
        let store = InMemoryStore::new();
        let alice = Identity::new(Principal::new("alice"));
        store.seed_profile(alice.principal(), UserProfile::new("Alice"));
        let backend = store.backend_for(&alice);
        (store, backend)
    }

    #[tokio::test]
    async fn unregistered_caller_is_rejected() {
        let store = InMemoryStore::new();
        let backend = store.backend_for(&Identity::new(Principal::new("bob")));
        let err = backend.get_caller_profile().await.unwrap_err();
        assert!(err.to_string().contains("not registered"));
        assert!(backend.list_fields().await.is_err());

        backend.save_caller_profile(UserProfile::new("Bob")).await.unwrap();
        assert_eq!(backend.get_caller_profile().await.unwrap(), Some(UserProfile::new("Bob")));
    }

    #[tokio::test]
    async fn field_metrics_track_tasks() {
        let (_, backend) = registered();
        let field = backend.create_field(FieldDraft::named("Work")).await.unwrap();
        let a = backend
            .create_task(
                TaskDraft::new(field.clone(), "Write report")
                    .with_scores(5, 4, 3, 2)
                    .with_duration(2, DurationUnit::Hours),
            )
            .await
            .unwrap();
        backend
            .create_task(TaskDraft::new(field.clone(), "Email").with_scores(1, 2, 3, 4))
            .await
            .unwrap();
        backend.mark_completed(a.clone()).await.unwrap();

        let fields = backend.list_fields().await.unwrap();
        let metrics = fields[0].metrics;
        assert_eq!(metrics.task_count, 1);
        assert_eq!(metrics.total_task_count, 2);
        assert_eq!(metrics.avg_urgency, 1);
        assert_eq!(metrics.total_task_duration, 150);
        assert_eq!(metrics.total_active_task_duration, 30);

        backend.undo_completion(a).await.unwrap();
        let found = backend.search_tasks(field.clone(), "REPORT".into()).await.unwrap();
        assert_eq!(found.len(), 1);
        let urgent = backend
            .filter_by_attribute(field, TaskAttribute::Urgency, 4, 5)
            .await
            .unwrap();
        assert_eq!(urgent.len(), 1);
    }

    #[tokio::test]
    async fn callers_are_isolated() {
        let (store, alice) = registered();
        let field = alice.create_field(FieldDraft::named("Private")).await.unwrap();

        let bob_id = Identity::new(Principal::new("bob"));
        store.seed_profile(bob_id.principal(), UserProfile::new("Bob"));
        let bob = store.backend_for(&bob_id);
        assert!(bob.list_fields().await.unwrap().is_empty());
        assert!(bob.delete_field(field).await.is_err());
    }

    #[tokio::test]
    async fn export_import_replaces_data() {
        let (_, backend) = registered();
        let field = backend.create_field(FieldDraft::named("Home")).await.unwrap();
        backend.create_task(TaskDraft::new(field, "Dishes")).await.unwrap();
        let bundle = backend.export_all().await.unwrap();

        backend.create_field(FieldDraft::named("Extra")).await.unwrap();
        backend.import_all(bundle.clone()).await.unwrap();
        assert_eq!(backend.export_all().await.unwrap(), bundle);
    }

    #[tokio::test]
    async fn profile_fault_knobs() {
        let (store, backend) = registered();
        store.fail_profile_next(Failure::from("network error"));
        assert!(backend.get_caller_profile().await.is_err());
        assert!(backend.get_caller_profile().await.unwrap().is_some());
        assert_eq!(store.profile_calls(), 2);
    }
}
