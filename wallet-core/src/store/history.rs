use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StoreRecord;

/// One line of the wallet activity log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub description: String,
    #[serde(default)]
    pub notes: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            notes: String::new(),
            created: Utc::now(),
            modified: None,
        }
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.notes = notes.into();
        self.modified = Some(Utc::now());
    }
}

impl StoreRecord for HistoryEntry {
    const KIND: &'static str = "history";
    const FILE_NAME: &'static str = "history.store";

    fn id(&self) -> Uuid {
        self.id
    }

    fn searchable_text(&self) -> Vec<&str> {
        vec![&self.description, &self.notes]
    }
}
