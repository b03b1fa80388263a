use getrandom::getrandom;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == ':')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-', '_' or ':'"
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

define_id_type!(GroupId, "group id");
define_id_type!(TaskId, "task id");

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.into_iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

/// Compact sortable-ish id: `<prefix>-<base36 timestamp>-<4 random base36 chars>`.
pub fn new_compact_id(prefix: &str, now: i64) -> Result<String, String> {
    let timestamp = u64::try_from(now)
        .map_err(|_| format!("{prefix} id requires a non-negative timestamp"))?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes).map_err(|err| format!("failed to generate id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % 36_u32.pow(4);
    Ok(format!(
        "{prefix}-{}-{}",
        base36_encode_u64(timestamp),
        base36_encode_fixed_u32(sample, 4)
    ))
}

/// Directory name for a group's on-disk state. Sanitization alone is lossy
/// (`tg:x` and `tg_x` collapse to the same string), so a short digest of the
/// raw id keeps distinct groups in distinct directories.
pub fn group_dir_name(group_id: &str) -> String {
    let digest = Sha256::digest(group_id.as_bytes());
    format!(
        "{}-{:02x}{:02x}{:02x}{:02x}",
        sanitize_filename_component(group_id),
        digest[0],
        digest[1],
        digest[2],
        digest[3]
    )
}

pub fn sanitize_filename_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_accepts_channel_qualified_names() {
        assert!(GroupId::parse("slack:family-chat").is_ok());
        assert!(GroupId::parse("").is_err());
        assert!(GroupId::parse("bad id").is_err());
    }

    #[test]
    fn compact_ids_carry_prefix_and_timestamp() {
        let id = new_compact_id("wake", 1_700_000_000).expect("id");
        assert!(id.starts_with("wake-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn negative_timestamp_is_rejected() {
        assert!(new_compact_id("wake", -1).is_err());
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_filename_component("a/b c"), "a_b_c");
    }

    #[test]
    fn group_dir_names_never_collide_across_sanitization() {
        assert_ne!(group_dir_name("tg:family"), group_dir_name("tg_family"));
        assert!(group_dir_name("tg:family").starts_with("tg_family-"));
        assert_eq!(group_dir_name("tg:family"), group_dir_name("tg:family"));
    }
}
