use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value.len() > 64 {
        return Err(format!("{kind} must be at most 64 characters"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

// Tenant ids double as directory names, so the charset above is what keeps
// `ipc/{tenant}` and `groups/{tenant}` from ever escaping their parents.
define_id_type!(TenantId, "tenant id");
define_id_type!(TaskId, "task id");

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `width` random base36 characters drawn from the OS entropy source.
pub fn random_base36(width: usize) -> Result<String, String> {
    let mut bytes = vec![0_u8; width];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| format!("failed to read randomness for id suffix: {err}"))?;
    Ok(bytes
        .iter()
        .map(|byte| BASE36_ALPHABET[(*byte as usize) % 36] as char)
        .collect())
}

/// `task-{unix_ms}-{random base36}`
pub fn generate_task_id(now_ms: i64) -> Result<TaskId, String> {
    TaskId::parse(&format!("task-{now_ms}-{}", random_base36(6)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_ids_reject_path_components() {
        assert!(TenantId::parse("family-chat").is_ok());
        assert!(TenantId::parse("../main").is_err());
        assert!(TenantId::parse("a/b").is_err());
        assert!(TenantId::parse(".").is_err());
        assert!(TenantId::parse("").is_err());
    }

    #[test]
    fn ids_deserialize_through_validation() {
        let ok: TaskId = serde_json::from_str("\"task-1\"").expect("valid id");
        assert_eq!(ok.as_str(), "task-1");
        let err = serde_json::from_str::<TaskId>("\"task 1\"").expect_err("space rejected");
        assert!(err.to_string().contains("invalid task id"));
    }

    #[test]
    fn generated_task_ids_are_valid_and_distinct() {
        let a = generate_task_id(1_700_000_000_000).expect("id a");
        let b = generate_task_id(1_700_000_000_000).expect("id b");
        assert!(a.as_str().starts_with("task-1700000000000-"));
        assert_eq!(a.as_str().len(), "task-1700000000000-".len() + 6);
        assert_ne!(a, b);
    }
}
