//! Persistent chat sessions, one JSON file per session id.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::ChatMessage;

const SESSION_SCHEMA_VERSION: &str = "localscout.session.v1";

pub fn now_rfc3339() -> String {
    match OffsetDateTime::now_utc().format(&Rfc3339) {
        Ok(ts) => ts,
        // formatting Rfc3339 from a valid instant cannot realistically fail
        Err(_) => String::from("1970-01-01T00:00:00Z"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(id: &str, system_prompt: Option<&str>) -> Self {
        let now = now_rfc3339();
        let mut messages = Vec::new();
        if let Some(prompt) = system_prompt {
            if !prompt.trim().is_empty() {
                messages.push(ChatMessage::system(prompt.trim()));
            }
        }
        Self {
            id: id.to_string(),
            created_at: now.clone(),
            updated_at: now,
            messages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFile {
    schema_version: String,
    id: String,
    created_at: String,
    updated_at: String,
    messages: Vec<ChatMessage>,
}

/// File-backed session store. Saves are atomic (tmp file + rename) so a
/// crashed run never leaves a half-written session behind.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn load_or_create(
        &self,
        id: &str,
        system_prompt: Option<&str>,
    ) -> anyhow::Result<ChatSession> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(ChatSession::new(id, system_prompt));
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading session file {}", path.display()))?;
        let file: SessionFile =
            serde_json::from_str(&raw).context("failed parsing session JSON")?;
        if file.schema_version != SESSION_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported session schema {} (expected {SESSION_SCHEMA_VERSION})",
                file.schema_version
            ));
        }
        Ok(ChatSession {
            id: file.id,
            created_at: file.created_at,
            updated_at: file.updated_at,
            messages: file.messages,
        })
    }

    pub fn save(&self, session: &ChatSession) -> anyhow::Result<()> {
        let out = SessionFile {
            schema_version: SESSION_SCHEMA_VERSION.to_string(),
            id: session.id.clone(),
            created_at: session.created_at.clone(),
            updated_at: now_rfc3339(),
            messages: session.messages.clone(),
        };
        write_json_atomic(&self.session_path(&session.id), &out)
    }

    pub fn reset(&self, id: &str, system_prompt: Option<&str>) -> anyhow::Result<ChatSession> {
        let path = self.session_path(id);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed removing session file {}", path.display()))?;
        }
        let session = ChatSession::new(id, system_prompt);
        self.save(&session)?;
        Ok(session)
    }
}

/// Stage the document next to its destination, then rename into place so a
/// crash mid-write cannot leave a torn session file.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("session.json");
    let staging = path.with_file_name(format!(".{file_name}.partial-{}", Uuid::new_v4()));
    std::fs::write(&staging, serde_json::to_vec_pretty(value)?)?;
    if let Err(e) = std::fs::rename(&staging, path) {
        let _ = std::fs::remove_file(&staging);
        return Err(e.into());
    }
    Ok(())
}
