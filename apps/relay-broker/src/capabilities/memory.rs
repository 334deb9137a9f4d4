use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::capability::{Capability, Topic};
use crate::heartbeat::DeviceType;
use crate::session::SessionContext;
use crate::store::{MemoryStore, StoreError};

pub const DATA_TOPIC: &str = "memory_data";
pub const ENTRY_STORED: &str = "MemoryEntryStored";
pub const USER_DATA_SET: &str = "UserDataSet";

const FIELD_DELIMITER: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTopic {
    UserSession,
    AddEntry,
    SetUserData,
    GetUserData,
}

impl Topic for MemoryTopic {
    const ALL: &'static [Self] = &[
        MemoryTopic::UserSession,
        MemoryTopic::AddEntry,
        MemoryTopic::SetUserData,
        MemoryTopic::GetUserData,
    ];

    fn as_str(self) -> &'static str {
        match self {
            MemoryTopic::UserSession => "memory_user_session",
            MemoryTopic::AddEntry => "memory_add_entry",
            MemoryTopic::SetUserData => "memory_set_user_data",
            MemoryTopic::GetUserData => "memory_get_user_data",
        }
    }
}

impl MemoryTopic {
    fn format(self) -> &'static str {
        match self {
            MemoryTopic::UserSession => "user_id",
            MemoryTopic::AddEntry => "user_id;entry_name;entry",
            MemoryTopic::SetUserData => "user_id;key;value",
            MemoryTopic::GetUserData => "user_id;key",
        }
    }

    fn field_count(self) -> usize {
        self.format().split(FIELD_DELIMITER).count()
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("payload does not have format `{expected}`")]
    Format { expected: &'static str },
    #[error("entry is not a JSON list of objects: {0}")]
    Entry(String),
    #[error("interactant `{0}` does not exist")]
    UnknownInteractant(String),
    #[error("no `{field}` stored for interactant `{user_id}`")]
    MissingField { user_id: String, field: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Key of the hash holding one interactant's profile.
pub fn interactant_key(user_id: &str) -> String {
    format!("interactant:{user_id}")
}

/// Splits a `;`-delimited payload into exactly the topic's fields. The last
/// field keeps any further delimiters, so JSON entries may contain `;`.
fn fields(topic: MemoryTopic, payload: &[u8]) -> Result<Vec<String>, MemoryError> {
    let text = String::from_utf8_lossy(payload);
    let count = topic.field_count();
    let fields: Vec<String> = text
        .trim_end_matches(['\r', '\n'])
        .splitn(count, FIELD_DELIMITER)
        .map(str::to_string)
        .collect();
    if fields.len() != count || fields[0].is_empty() {
        return Err(MemoryError::Format {
            expected: topic.format(),
        });
    }
    Ok(fields)
}

/// Flattens `[{"k": v}, {"k2": v2}]` into hash fields; strings are stored
/// unquoted, other values as JSON text.
fn entry_fields(raw: &str) -> Result<Vec<(String, String)>, MemoryError> {
    let items: Vec<Value> =
        serde_json::from_str(raw).map_err(|err| MemoryError::Entry(err.to_string()))?;
    let mut merged: Vec<(String, String)> = Vec::new();
    for item in items {
        let Value::Object(object) = item else {
            return Err(MemoryError::Entry("list item is not an object".into()));
        };
        for (key, value) in object {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            match merged.iter_mut().find(|(existing, _)| *existing == key) {
                Some(slot) => slot.1 = value,
                None => merged.push((key, value)),
            }
        }
    }
    Ok(merged)
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Conversational memory for a robot: per-interactant profiles and
/// numbered memory entries.
pub struct RobotMemory {
    store: Arc<dyn MemoryStore>,
}

impl RobotMemory {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    async fn user_session(&self, ctx: &SessionContext, payload: &[u8]) -> Result<(), MemoryError> {
        let fields = fields(MemoryTopic::UserSession, payload)?;
        let key = interactant_key(&fields[0]);
        let now = timestamp();
        let session = if self.store.exists(&key).await? {
            self.store.record_interaction(&key, &now).await?
        } else {
            self.store
                .write_hash(
                    &key,
                    &[
                        ("creation_date".to_string(), now.clone()),
                        ("last_interaction".to_string(), now),
                        ("session_number".to_string(), "1".to_string()),
                    ],
                )
                .await?;
            info!(identifier = %ctx.identifier(), interactant = %fields[0], "interactant created");
            1
        };
        self.produce_data(ctx, "session_number", &session.to_string()).await;
        Ok(())
    }

    async fn add_entry(&self, ctx: &SessionContext, payload: &[u8]) -> Result<(), MemoryError> {
        let fields = fields(MemoryTopic::AddEntry, payload)?;
        let (user_id, entry_name) = (&fields[0], &fields[1]);
        let mut entry = entry_fields(&fields[2])?;
        let key = interactant_key(user_id);
        if !self.store.exists(&key).await? {
            return Err(MemoryError::UnknownInteractant(user_id.clone()));
        }
        let count = self.store.increment(&key, entry_name, 1).await?;
        entry.retain(|(field, _)| field != "datetime");
        entry.push(("datetime".to_string(), timestamp()));
        let entry_key = format!("{entry_name}:{user_id}:{count}");
        self.store.write_hash(&entry_key, &entry).await?;
        info!(identifier = %ctx.identifier(), entry = %entry_key, "memory entry stored");
        self.produce_event(ctx, ENTRY_STORED).await;
        Ok(())
    }

    async fn set_user_data(&self, ctx: &SessionContext, payload: &[u8]) -> Result<(), MemoryError> {
        let fields = fields(MemoryTopic::SetUserData, payload)?;
        self.store
            .write_hash(
                &interactant_key(&fields[0]),
                &[(fields[1].clone(), fields[2].clone())],
            )
            .await?;
        self.produce_event(ctx, USER_DATA_SET).await;
        Ok(())
    }

    async fn get_user_data(&self, ctx: &SessionContext, payload: &[u8]) -> Result<(), MemoryError> {
        let fields = fields(MemoryTopic::GetUserData, payload)?;
        let (user_id, field) = (&fields[0], &fields[1]);
        let value = self
            .store
            .get_field(&interactant_key(user_id), field)
            .await?
            .ok_or_else(|| MemoryError::MissingField {
                user_id: user_id.clone(),
                field: field.clone(),
            })?;
        self.produce_data(ctx, field, &value).await;
        Ok(())
    }

    async fn produce_data(&self, ctx: &SessionContext, key: &str, value: &str) {
        let payload = format!("{key}{FIELD_DELIMITER}{value}");
        if let Err(err) = ctx.publish(DATA_TOPIC, payload).await {
            warn!(identifier = %ctx.identifier(), error = %err, "publishing memory data failed");
        }
    }

    async fn produce_event(&self, ctx: &SessionContext, event: &str) {
        if let Err(err) = ctx.produce_event(event).await {
            warn!(identifier = %ctx.identifier(), event, error = %err, "publishing memory event failed");
        }
    }
}

#[async_trait]
impl Capability for RobotMemory {
    type Topic = MemoryTopic;

    fn device_type(&self) -> DeviceType {
        DeviceType::Robot
    }

    async fn handle(
        self: Arc<Self>,
        ctx: SessionContext,
        topic: MemoryTopic,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        let result = match topic {
            MemoryTopic::UserSession => self.user_session(&ctx, &payload).await,
            MemoryTopic::AddEntry => self.add_entry(&ctx, &payload).await,
            MemoryTopic::SetUserData => self.set_user_data(&ctx, &payload).await,
            MemoryTopic::GetUserData => self.get_user_data(&ctx, &payload).await,
        };
        match result {
            Ok(()) => Ok(()),
            // Bad requests are dropped here; only store faults reach the session log.
            Err(MemoryError::Store(err)) => Err(err.into()),
            Err(err) => {
                warn!(identifier = %ctx.identifier(), topic = topic.as_str(), error = %err, "memory request dropped");
                Ok(())
            }
        }
    }
}
