use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(UserId);
string_id!(CallId);
string_id!(GroupName);

impl CallId {
    /// Locally generated id, used only until the remote party or the
    /// middleware supplies an authoritative one.
    pub fn generate(caller: &UserId, callee: &UserId, unix_millis: i64) -> Self {
        Self(format!("{}_{}_{}", caller.0, callee.0, unix_millis))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Key of one conversation timeline in the message cache.
///
/// Rendered as `user_<peer>` or `group_<name>`, matching the keys the
/// gateway uses in its pending-message records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ConversationKey {
    User(UserId),
    Group(GroupName),
}

impl ConversationKey {
    pub fn user(peer: impl Into<String>) -> Self {
        Self::User(UserId::new(peer))
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::Group(GroupName::new(name))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(peer) => write!(f, "user_{peer}"),
            Self::Group(name) => write!(f, "group_{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_keys_render_like_gateway_keys() {
        assert_eq!(ConversationKey::user("alice").to_string(), "user_alice");
        assert_eq!(ConversationKey::group("rust").to_string(), "group_rust");
    }

    #[test]
    fn generated_call_ids_embed_both_parties() {
        let id = CallId::generate(&UserId::new("bob"), &UserId::new("alice"), 1_700_000_000_000);
        assert_eq!(id.as_str(), "bob_alice_1700000000000");
    }
}
