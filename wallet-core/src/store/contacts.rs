use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StoreRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub bitcoin_address: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: None,
            bitcoin_address: None,
            notes: String::new(),
            tags: Vec::new(),
            created: Utc::now(),
            modified: None,
        }
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.notes = notes.into();
        self.modified = Some(Utc::now());
    }
}

impl StoreRecord for Contact {
    const KIND: &'static str = "contacts";
    const FILE_NAME: &'static str = "contacts.store";

    fn id(&self) -> Uuid {
        self.id
    }

    fn searchable_text(&self) -> Vec<&str> {
        let mut fields = vec![self.name.as_str(), self.notes.as_str()];
        fields.extend(self.email.as_deref());
        fields.extend(self.bitcoin_address.as_deref());
        fields.extend(self.tags.iter().map(String::as_str));
        fields
    }
}
