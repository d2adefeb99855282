//! Core types for Fieldtask
//!
//! Defines the records exchanged with the backend:
//! - User profiles
//! - Fields (task categories) and their derived metrics
//! - Tasks with their five scalar attributes and dependency links
//! - The bulk export bundle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Principal;

/// Backend timestamp
pub type Timestamp = DateTime<Utc>;

/// Lowest allowed task attribute score
pub const ATTRIBUTE_MIN: u8 = 1;
/// Highest allowed task attribute score
pub const ATTRIBUTE_MAX: u8 = 5;

/// Backend-assigned field identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub String);

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-assigned task identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Display name
    pub name: String,
}

impl UserProfile {
    /// Create profile
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Unit of a task duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    /// Minutes
    #[default]
    Minutes,
    /// Hours
    Hours,
    /// Days
    Days,
}

impl DurationUnit {
    /// Convert an amount in this unit to minutes
    #[inline]
    #[must_use]
    pub fn to_minutes(self, amount: u64) -> u64 {
        match self {
            Self::Minutes => amount,
            Self::Hours => amount * 60,
            Self::Days => amount * 1440,
        }
    }
}

/// Scalar task attribute usable in range filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAttribute {
    /// Urgency score
    Urgency,
    /// Value score
    Value,
    /// Interest score
    Interest,
    /// Influence score
    Influence,
    /// Duration in minutes
    Duration,
}

impl TaskAttribute {
    /// Read this attribute from a task (duration normalised to minutes)
    #[must_use]
    pub fn read(self, task: &Task) -> u64 {
        match self {
            Self::Urgency => u64::from(task.urgency),
            Self::Value => u64::from(task.value),
            Self::Interest => u64::from(task.interest),
            Self::Influence => u64::from(task.influence),
            Self::Duration => task.duration_minutes(),
        }
    }
}

impl std::str::FromStr for TaskAttribute {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "urgency" => Ok(Self::Urgency),
            "value" => Ok(Self::Value),
            "interest" => Ok(Self::Interest),
            "influence" => Ok(Self::Influence),
            "duration" => Ok(Self::Duration),
            other => Err(ValidationError::UnknownAttribute(other.to_string())),
        }
    }
}

/// Validation failures for drafts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Name is empty after trimming
    #[error("name must not be empty")]
    EmptyName,

    /// Attribute score outside 1..=5
    #[error("{attribute} must be between 1 and 5, got {value}")]
    AttributeOutOfRange {
        /// Attribute name
        attribute: &'static str,
        /// Offending value
        value: u8,
    },

    /// Unknown attribute name in a filter
    #[error("unknown task attribute: {0}")]
    UnknownAttribute(String),

    /// Task lists itself as a dependency
    #[error("task cannot depend on itself")]
    SelfDependency,
}

/// Input for creating or updating a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDraft {
    /// Field name
    pub name: String,
    /// Icon identifier
    pub icon: String,
    /// Accent color identifier
    pub color: String,
    /// Card background identifier
    pub background: String,
}

impl FieldDraft {
    /// Draft with default appearance
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: "folder".to_string(),
            color: "slate".to_string(),
            background: "plain".to_string(),
        }
    }

    /// Check the draft before sending it
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        Ok(())
    }
}

/// A user-defined category grouping tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Identifier
    pub id: FieldId,
    /// Name
    pub name: String,
    /// Icon identifier
    pub icon: String,
    /// Accent color identifier
    pub color: String,
    /// Card background identifier
    pub background: String,
    /// Creation time
    pub created_at: Timestamp,
    /// Owner
    pub created_by: Principal,
    /// Aggregates over the field's tasks
    pub metrics: FieldMetrics,
}

/// Aggregate metrics derived from a field's tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetrics {
    /// Active (not completed) tasks
    pub task_count: u64,
    /// All tasks
    pub total_task_count: u64,
    /// Rounded mean urgency of active tasks
    pub avg_urgency: u64,
    /// Rounded mean value of active tasks
    pub avg_value: u64,
    /// Rounded mean interest of active tasks
    pub avg_interest: u64,
    /// Rounded mean influence of active tasks
    pub avg_influence: u64,
    /// Sum of all task durations, in minutes
    pub total_task_duration: u64,
    /// Sum of active task durations, in minutes
    pub total_active_task_duration: u64,
}

impl FieldMetrics {
    /// Compute metrics over the given tasks
    #[must_use]
    pub fn compute<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut metrics = Self::default();
        let (mut urgency, mut value, mut interest, mut influence) = (0u64, 0u64, 0u64, 0u64);

        for task in tasks {
            let minutes = task.duration_minutes();
            metrics.total_task_count += 1;
            metrics.total_task_duration += minutes;
            if task.completed {
                continue;
            }
            metrics.task_count += 1;
            metrics.total_active_task_duration += minutes;
            urgency += u64::from(task.urgency);
            value += u64::from(task.value);
            interest += u64::from(task.interest);
            influence += u64::from(task.influence);
        }

        if metrics.task_count > 0 {
            let n = metrics.task_count;
            let mean = |sum: u64| (sum + n / 2) / n;
            metrics.avg_urgency = mean(urgency);
            metrics.avg_value = mean(value);
            metrics.avg_interest = mean(interest);
            metrics.avg_influence = mean(influence);
        }
        metrics
    }
}

/// Input for creating or updating a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    /// Owning field
    pub field_id: FieldId,
    /// Name
    pub name: String,
    /// Urgency 1..=5
    pub urgency: u8,
    /// Value 1..=5
    pub value: u8,
    /// Interest 1..=5
    pub interest: u8,
    /// Influence 1..=5
    pub influence: u8,
    /// Duration amount
    pub duration: u64,
    /// Duration unit
    pub duration_unit: DurationUnit,
    /// Tasks this one depends on
    pub dependencies: Vec<TaskId>,
}

impl TaskDraft {
    /// Draft with mid-range scores and no dependencies
    #[must_use]
    pub fn new(field_id: FieldId, name: impl Into<String>) -> Self {
        Self {
            field_id,
            name: name.into(),
            urgency: 3,
            value: 3,
            interest: 3,
            influence: 3,
            duration: 30,
            duration_unit: DurationUnit::Minutes,
            dependencies: Vec::new(),
        }
    }

    /// With attribute scores (urgency, value, interest, influence)
    #[must_use]
    pub fn with_scores(mut self, urgency: u8, value: u8, interest: u8, influence: u8) -> Self {
        self.urgency = urgency;
        self.value = value;
        self.interest = interest;
        self.influence = influence;
        self
    }

    /// With duration
    #[must_use]
    pub fn with_duration(mut self, duration: u64, unit: DurationUnit) -> Self {
        self.duration = duration;
        self.duration_unit = unit;
        self
    }

    /// With dependencies
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Check the draft before sending it
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        for (attribute, value) in [
            ("urgency", self.urgency),
            ("value", self.value),
            ("interest", self.interest),
            ("influence", self.influence),
        ] {
            if !(ATTRIBUTE_MIN..=ATTRIBUTE_MAX).contains(&value) {
                return Err(ValidationError::AttributeOutOfRange { attribute, value });
            }
        }
        Ok(())
    }
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier
    pub id: TaskId,
    /// Owning field
    pub field_id: FieldId,
    /// Name
    pub name: String,
    /// Urgency 1..=5
    pub urgency: u8,
    /// Value 1..=5
    pub value: u8,
    /// Interest 1..=5
    pub interest: u8,
    /// Influence 1..=5
    pub influence: u8,
    /// Duration amount
    pub duration: u64,
    /// Duration unit
    pub duration_unit: DurationUnit,
    /// Tasks this one depends on
    pub dependencies: Vec<TaskId>,
    /// Completion flag
    pub completed: bool,
    /// Creation time
    pub created_at: Timestamp,
    /// Owner
    pub created_by: Principal,
}

impl Task {
    /// Duration normalised to minutes
    #[inline]
    #[must_use]
    pub fn duration_minutes(&self) -> u64 {
        self.duration_unit.to_minutes(self.duration)
    }
}

/// Full export of a caller's data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBundle {
    /// All fields
    pub fields: Vec<Field>,
    /// All tasks
    pub tasks: Vec<Task>,
}

/// Render a total duration in minutes for display
#[must_use]
pub fn format_total_duration(minutes: u64) -> String {
    fn plural(n: u64, one: &str, many: &str) -> String {
        format!("{n} {}", if n == 1 { one } else { many })
    }

    if minutes == 0 {
        return "0 min".to_string();
    }
    if minutes < 60 {
        return format!("{minutes} min");
    }
    if minutes < 1440 {
        let (hours, rest) = (minutes / 60, minutes % 60);
        let mut out = plural(hours, "hr", "hrs");
        if rest > 0 {
            out.push_str(&format!(" {rest} min"));
        }
        return out;
    }

    let days = minutes / 1440;
    let hours = (minutes % 1440) / 60;
    let rest = minutes % 60;
    let mut out = plural(days, "day", "days");
    if hours > 0 {
        out.push(' ');
        out.push_str(&plural(hours, "hr", "hrs"));
    }
    if rest > 0 {
        out.push_str(&format!(" {rest} min"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(urgency: u8, duration: u64, unit: DurationUnit, completed: bool) -> Task {
        Task {
            id: TaskId("t".into()),
            field_id: FieldId("f".into()),
            name: "task".into(),
            urgency,
            value: 2,
            interest: 4,
            influence: 1,
            duration,
            duration_unit: unit,
            dependencies: vec![],
            completed,
            created_at: Utc::now(),
            created_by: Principal::new("owner"),
        }
    }

    #[test]
    fn duration_conversion() {
        assert_eq!(DurationUnit::Minutes.to_minutes(45), 45);
        assert_eq!(DurationUnit::Hours.to_minutes(2), 120);
        assert_eq!(DurationUnit::Days.to_minutes(1), 1440);
    }

    #[test]
    fn metrics_ignore_completed_tasks_in_averages() {
        let tasks = vec![
            task(5, 1, DurationUnit::Hours, false),
            task(2, 30, DurationUnit::Minutes, false),
            task(1, 1, DurationUnit::Days, true),
        ];
        let metrics = FieldMetrics::compute(&tasks);

        assert_eq!(metrics.task_count, 2);
        assert_eq!(metrics.total_task_count, 3);
        assert_eq!(metrics.avg_urgency, 4); // (5 + 2) / 2 rounded
        assert_eq!(metrics.total_active_task_duration, 90);
        assert_eq!(metrics.total_task_duration, 90 + 1440);
    }

    #[test]
    fn metrics_of_empty_field() {
        assert_eq!(FieldMetrics::compute(std::iter::empty()), FieldMetrics::default());
    }

    #[test]
    fn draft_validation() {
        let draft = TaskDraft::new(FieldId("f".into()), "write report");
        assert!(draft.validate().is_ok());

        let bad = draft.clone().with_scores(0, 3, 3, 3);
        assert_eq!(
            bad.validate(),
            Err(ValidationError::AttributeOutOfRange {
                attribute: "urgency",
                value: 0
            })
        );

        let unnamed = TaskDraft::new(FieldId("f".into()), "   ");
        assert_eq!(unnamed.validate(), Err(ValidationError::EmptyName));
        assert_eq!(FieldDraft::named("").validate(), Err(ValidationError::EmptyName));
    }

    #[test]
    fn attribute_parsing() {
        assert_eq!("Urgency".parse::<TaskAttribute>(), Ok(TaskAttribute::Urgency));
        assert!("colour".parse::<TaskAttribute>().is_err());
    }

    #[test]
    fn total_duration_formatting() {
        assert_eq!(format_total_duration(0), "0 min");
        assert_eq!(format_total_duration(45), "45 min");
        assert_eq!(format_total_duration(60), "1 hr");
        assert_eq!(format_total_duration(125), "2 hrs 5 min");
        assert_eq!(format_total_duration(1440 + 180), "1 day 3 hrs");
        assert_eq!(format_total_duration(2 * 1440 + 7), "2 days 7 min");
    }
}
