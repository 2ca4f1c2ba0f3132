use std::fmt;
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Event name the consumer is keyed on. Changing it breaks queued jobs.
pub const CODE_AGENT_RUN_EVENT: &str = "code-agent/run";

/// A generation request. Named `Project` throughout storage and the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    User,
    Agent,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Agent => "AGENT",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "AGENT" => Ok(Self::Agent),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Result,
    Error,
    Progress,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "RESULT",
            Self::Error => "ERROR",
            Self::Progress => "PROGRESS",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESULT" => Ok(Self::Result),
            "ERROR" => Ok(Self::Error),
            "PROGRESS" => Ok(Self::Progress),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

/// Normalize an agent-supplied path into a relative, forward-slash key.
///
/// Backslashes become `/`, leading `./` and `/` are dropped and empty
/// segments collapse. Returns `None` when nothing is left.
pub fn normalize_path(path: &str) -> Option<String> {
    let unified = path.trim().replace('\\', "/");
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Path → content mapping produced by the agent.
///
/// Keeps insertion order (the explorer selects the first inserted file by
/// default). Re-inserting an existing path replaces its content in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCollection {
    entries: Vec<(String, String)>,
}

impl FileCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file. Returns `false` if the path normalizes to nothing.
    pub fn insert(&mut self, path: &str, content: impl Into<String>) -> bool {
        let Some(key) = normalize_path(path) else {
            return false;
        };
        let content = content.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = content,
            None => self.entries.push((key, content)),
        }
        true
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == path)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, path: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == path)
    }

    pub fn first_key(&self) -> Option<&str> {
        self.entries.first().map(|(k, _)| k.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for FileCollection {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut files = FileCollection::new();
        for (path, content) in iter {
            files.insert(path.as_ref(), content);
        }
        files
    }
}

impl Serialize for FileCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FileCollection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilesVisitor;

        impl<'de> Visitor<'de> for FilesVisitor {
            type Value = FileCollection;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of file paths to file contents")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut files = FileCollection::new();
                while let Some((path, content)) = access.next_entry::<String, String>()? {
                    files.insert(&path, content);
                }
                Ok(files)
            }
        }

        deserializer.deserialize_map(FilesVisitor)
    }
}

/// Agent output attached to exactly one AGENT message. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fragment {
    pub id: String,
    pub message_id: String,
    pub sandbox_url: Option<String>,
    pub title: String,
    pub files: FileCollection,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub content: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Queue event that produced this message (AGENT messages only).
    pub job_id: Option<String>,
    pub created_at: String,
    pub fragment: Option<Fragment>,
}

/// Fragment data handed to the database before ids are assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewFragment {
    pub sandbox_url: Option<String>,
    pub title: String,
    pub files: FileCollection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A durable queue row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub available_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Payload of a `code-agent/run` event.
///
/// `value` stays a raw JSON value: the consumer coerces it to text when it
/// builds the prompt, so non-string payloads are still accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(rename = "projectId", alias = "requestId")]
    pub project_id: String,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_role_roundtrip() {
        for role in [MessageRole::User, MessageRole::Agent] {
            assert_eq!(role.as_str().parse::<MessageRole>().unwrap(), role);
        }
        assert!("assistant".parse::<MessageRole>().is_err());
    }

    #[test]
    fn test_message_type_roundtrip() {
        for ty in [MessageType::Result, MessageType::Error, MessageType::Progress] {
            assert_eq!(ty.as_str().parse::<MessageType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&MessageRole::Agent).unwrap(), "\"AGENT\"");
        assert_eq!(serde_json::to_string(&MessageType::Result).unwrap(), "\"RESULT\"");
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"queued\"");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("src/app.ts").as_deref(), Some("src/app.ts"));
        assert_eq!(normalize_path("./src//app.ts").as_deref(), Some("src/app.ts"));
        assert_eq!(normalize_path("/index.html").as_deref(), Some("index.html"));
        assert_eq!(normalize_path("lib\\util.ts").as_deref(), Some("lib/util.ts"));
        assert_eq!(normalize_path(""), None);
        assert_eq!(normalize_path("/./"), None);
    }

    #[test]
    fn test_file_collection_keeps_insertion_order() {
        let mut files = FileCollection::new();
        files.insert("b.ts", "b");
        files.insert("a.ts", "a");
        files.insert("./b.ts", "b2");
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["b.ts", "a.ts"]);
        assert_eq!(files.get("b.ts"), Some("b2"));
        assert_eq!(files.first_key(), Some("b.ts"));
        assert!(!files.insert("//", "nothing"));
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_file_collection_json_preserves_order() {
        let json = r#"{"z.ts":"1","a.ts":"2","./m/n.ts":"3"}"#;
        let files: FileCollection = serde_json::from_str(json).unwrap();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["z.ts", "a.ts", "m/n.ts"]);
        let back = serde_json::to_string(&files).unwrap();
        assert_eq!(back, r#"{"z.ts":"1","a.ts":"2","m/n.ts":"3"}"#);
    }

    #[test]
    fn test_job_payload_accepts_both_id_names() {
        let a: JobPayload =
            serde_json::from_str(r#"{"value":"todo app","projectId":"p1"}"#).unwrap();
        let b: JobPayload =
            serde_json::from_str(r#"{"value":"todo app","requestId":"p1"}"#).unwrap();
        assert_eq!(a, b);
        let out = serde_json::to_value(&a).unwrap();
        assert_eq!(out["projectId"], "p1");
    }

    #[test]
    fn test_job_payload_missing_value_is_null() {
        let p: JobPayload = serde_json::from_str(r#"{"projectId":"p1"}"#).unwrap();
        assert!(p.value.is_null());
    }

    #[test]
    fn test_message_serializes_type_field() {
        let msg = Message {
            id: "m1".into(),
            project_id: "p1".into(),
            content: "hi".into(),
            role: MessageRole::User,
            message_type: MessageType::Result,
            job_id: None,
            created_at: "2025-01-01T00:00:00.000000Z".into(),
            fragment: None,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "RESULT");
        assert_eq!(v["role"], "USER");
    }
}
