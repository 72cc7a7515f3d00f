//! Builders for destinations and inbound event messages.

use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use courier_core::{Destination, DestinationId, DestinationStatus, SigningSecret};
use serde_json::{json, Value};
use uuid::Uuid;

/// Secret used by destinations built without an explicit one.
pub const TEST_SECRET: &str = "whsec_test_secret";

/// Builder for test destinations.
#[derive(Debug, Clone)]
pub struct DestinationBuilder {
    url: String,
    secret: String,
    event_types: Vec<String>,
    is_active: bool,
    status: DestinationStatus,
    timeout: Duration,
    max_attempts: u32,
    rate_limit: Option<u32>,
    headers: HashMap<String, String>,
}

impl DestinationBuilder {
    /// Creates a builder targeting `url` and subscribed to every event type.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: TEST_SECRET.to_string(),
            event_types: vec!["*".to_string()],
            is_active: true,
            status: DestinationStatus::Active,
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            rate_limit: None,
            headers: HashMap::new(),
        }
    }

    /// Replaces the subscribed patterns.
    #[must_use]
    pub fn event_types(mut self, patterns: &[&str]) -> Self {
        self.event_types = patterns.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Marks the destination inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Sets the administrative status.
    #[must_use]
    pub fn status(mut self, status: DestinationStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Limits requests per second.
    #[must_use]
    pub fn rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = Some(per_second);
        self
    }

    /// Adds a custom outbound header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builds the destination.
    pub fn build(self) -> Destination {
        let now = Utc::now();
        Destination {
            id: DestinationId::new(),
            owner_id: format!("owner_{}", Uuid::new_v4().simple()),
            url: self.url,
            secret: SigningSecret::new(self.secret),
            event_types: self.event_types,
            is_active: self.is_active,
            timeout: self.timeout,
            max_attempts: self.max_attempts,
            rate_limit: self.rate_limit,
            headers: self.headers,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            status: self.status,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Builder for the JSON body of a broker message.
#[derive(Debug, Clone)]
pub struct EventMessageBuilder {
    id: Option<Value>,
    event_type: Option<String>,
    data: Option<Value>,
    use_aliases: bool,
}

impl EventMessageBuilder {
    /// Creates a message for `event_type` with a random id and empty data.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: Some(json!(format!("evt_{}", Uuid::new_v4().simple()))),
            event_type: Some(event_type.into()),
            data: Some(json!({})),
            use_aliases: false,
        }
    }

    /// Sets the event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Drops the event id field.
    #[must_use]
    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    /// Drops the event type field.
    #[must_use]
    pub fn without_event_type(mut self) -> Self {
        self.event_type = None;
        self
    }

    /// Sets the event data.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Drops the data field.
    #[must_use]
    pub fn without_data(mut self) -> Self {
        self.data = None;
        self
    }

    /// Emits `eventId` and `eventType` instead of `id` and `event`.
    #[must_use]
    pub fn with_aliases(mut self) -> Self {
        self.use_aliases = true;
        self
    }

    /// Returns the message as a JSON value.
    pub fn to_value(&self) -> Value {
        let (id_key, type_key) =
            if self.use_aliases { ("eventId", "eventType") } else { ("id", "event") };
        let mut object = serde_json::Map::new();
        if let Some(id) = &self.id {
            object.insert(id_key.to_string(), id.clone());
        }
        if let Some(event_type) = &self.event_type {
            object.insert(type_key.to_string(), Value::String(event_type.clone()));
        }
        if let Some(data) = &self.data {
            object.insert("data".to_string(), data.clone());
        }
        Value::Object(object)
    }

    /// Returns the message body bytes.
    pub fn build(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }
}
