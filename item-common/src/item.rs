use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9+_.-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
        .expect("email pattern is a valid regex")
});

pub type ItemId = i64;

/// Lifecycle tag of an Item.
/// New: An item as created through the API.
/// Processed: An item that went through a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    #[default]
    New,
    Processed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "NEW",
            ItemStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ItemStatus")]
pub struct ParseItemStatusError(pub String);

/// Allow casting ItemStatus from the strings we store.
impl FromStr for ItemStatus {
    type Err = ParseItemStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(ItemStatus::New),
            "PROCESSED" => Ok(ItemStatus::Processed),
            invalid => Err(ParseItemStatusError(invalid.to_owned())),
        }
    }
}

/// An Item record. `id` is `None` until the store assigns one on first save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub id: Option<ItemId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ItemStatus,
    pub email: String,
}

impl Item {
    pub fn new(name: &str, description: &str, email: &str) -> Self {
        Self {
            id: None,
            name: name.to_owned(),
            description: description.to_owned(),
            status: ItemStatus::New,
            email: email.to_owned(),
        }
    }

    /// Check the fields a client is allowed to get wrong.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::BlankName);
        }

        if !EMAIL_PATTERN.is_match(&self.email) {
            return Err(ValidationError::InvalidEmail(self.email.to_owned()));
        }

        Ok(())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name must not be blank")]
    BlankName,
    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),
}
