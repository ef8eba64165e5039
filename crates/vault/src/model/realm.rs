use std::fmt;

use serde::{Deserialize, Serialize};

/// How files in a realm are protected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealmPolicy {
    /// Signed plaintext, readable by anyone with store access
    Public,
    /// Sealed to the user named by the first path segment
    Home,
    /// Encrypted with the realm's current group key
    Group,
}

/// Namespace selecting the encryption policy of a vault
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Realm(String);

impl Realm {
    pub const ALL: &'static str = "all";
    pub const HOME: &'static str = "home";
    pub const USERS: &'static str = "users";

    pub fn new(name: impl Into<String>) -> Self {
        Realm(name.into())
    }

    pub fn all() -> Self {
        Realm::new(Self::ALL)
    }

    pub fn home() -> Self {
        Realm::new(Self::HOME)
    }

    pub fn users() -> Self {
        Realm::new(Self::USERS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn policy(&self) -> RealmPolicy {
        match self.0.as_str() {
            Self::ALL => RealmPolicy::Public,
            Self::HOME => RealmPolicy::Home,
            _ => RealmPolicy::Group,
        }
    }

    /// Root of the file layout: `<realm>/data`
    pub fn data_dir(&self) -> String {
        format!("{}/data", self.0)
    }

    /// Root of the ledger: `<realm>/blockchain`
    pub fn ledger_dir(&self) -> String {
        format!("{}/blockchain", self.0)
    }

    /// Object whose modification time signals new files
    pub fn change_file(&self) -> String {
        format!("{}/data/.change", self.0)
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Realm {
    fn from(name: &str) -> Self {
        Realm::new(name)
    }
}
