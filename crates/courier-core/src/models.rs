//! Core domain models and strongly-typed identifiers.
//!
//! Defines destinations, deliveries and audit log entries along with the
//! newtype IDs that keep them from being mixed up. Database encoding for the
//! PostgreSQL repository lives next to each type.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sqlx::Row;
use uuid::Uuid;

use crate::pattern;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

macro_rules! text_enum_sqlx {
    ($name:ident) => {
        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <str as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(s.parse::<Self>()?)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a registered destination.
    ///
    /// Sent to receivers in the `X-Webhook-ID` header.
    DestinationId
);

uuid_id!(
    /// Identifier of one (destination, event) delivery record.
    DeliveryId
);

uuid_id!(
    /// Identifier of an audit log entry.
    LogId
);

/// Producer-assigned event identifier.
///
/// This is the idempotency key: a destination receives a given event id at
/// most once no matter how often the broker redelivers it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Wraps a producer-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// HMAC signing secret of a destination.
///
/// `Debug`, `Display` and `Serialize` only ever show the masked form. Use
/// [`SigningSecret::expose`] at the single point where the raw bytes are
/// needed.
///
/// Serialization is display-only: `Deserialize` accepts a raw secret, so a
/// serialized value deserializes to the mask, not to the original secret.
/// Storage reads the raw column through [`SigningSecret::new`] and never
/// goes through serde.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SigningSecret(String);

impl SigningSecret {
    /// Wraps a raw secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the raw secret for signing.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the first four characters followed by a mask.
    pub fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("{prefix}****")
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningSecret({})", self.masked())
    }
}

impl fmt::Display for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl Serialize for SigningSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.masked())
    }
}

/// Administrative status of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationStatus {
    /// Receiving deliveries.
    #[default]
    Active,
    /// Paused by its owner or by operations.
    Suspended,
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

impl FromStr for DestinationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "SUSPENDED" => Ok(Self::Suspended),
            other => Err(format!("invalid destination status: {other}")),
        }
    }
}

text_enum_sqlx!(DestinationStatus);

/// A registered HTTP receiver subscribed to event-type patterns.
///
/// The serialized form masks `secret` and is meant for display and logs. It
/// does not round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    /// Unique identifier.
    pub id: DestinationId,

    /// Owner of the destination.
    pub owner_id: String,

    /// URL that receives POST requests.
    pub url: String,

    /// Secret used to sign envelopes.
    pub secret: SigningSecret,

    /// Subscribed event-type patterns, exact or with a trailing `*`.
    pub event_types: Vec<String>,

    /// Whether the owner has enabled the destination.
    pub is_active: bool,

    /// Per-attempt HTTP timeout.
    pub timeout: Duration,

    /// Attempts allowed before a delivery becomes terminally failed.
    pub max_attempts: u32,

    /// Optional ceiling on requests per second.
    pub rate_limit: Option<u32>,

    /// Headers added to every outbound request.
    pub headers: HashMap<String, String>,

    /// Total successful attempts.
    pub success_count: i64,

    /// Total failed attempts.
    pub failure_count: i64,

    /// Failed attempts since the last success.
    pub consecutive_failures: i64,

    /// Administrative status.
    pub status: DestinationStatus,

    /// Time of the most recent successful attempt.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Time of the most recent failed attempt.
    pub last_failure_at: Option<DateTime<Utc>>,

    /// When the destination was registered.
    pub created_at: DateTime<Utc>,

    /// When the destination was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Destination {
    /// Returns true when the destination may receive attempts.
    pub fn accepts_deliveries(&self) -> bool {
        self.is_active && self.status == DestinationStatus::Active
    }

    /// Returns true when any subscribed pattern matches `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        pattern::matches_any(&self.event_types, event_type)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Destination {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let headers: sqlx::types::Json<HashMap<String, String>> = row.try_get("headers")?;
        let timeout_ms: i64 = row.try_get("timeout_ms")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let rate_limit: Option<i32> = row.try_get("rate_limit")?;
        let secret: String = row.try_get("secret")?;

        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            url: row.try_get("url")?,
            secret: SigningSecret::new(secret),
            event_types: row.try_get("event_types")?,
            is_active: row.try_get("is_active")?,
            timeout: Duration::from_millis(non_negative(timeout_ms, "timeout_ms")?),
            max_attempts: u32::try_from(max_attempts)
                .map_err(|_| sqlx::Error::Decode("max_attempts cannot be negative".into()))?,
            rate_limit: rate_limit
                .map(u32::try_from)
                .transpose()
                .map_err(|_| sqlx::Error::Decode("rate_limit cannot be negative".into()))?,
            headers: headers.0,
            success_count: row.try_get("success_count")?,
            failure_count: row.try_get("failure_count")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            status: row.try_get("status")?,
            last_success_at: row.try_get("last_success_at")?,
            last_failure_at: row.try_get("last_failure_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Lifecycle state of a delivery.
///
/// ```text
/// PENDING ──claim──▶ DELIVERING ──2xx──▶ DELIVERED
///    ▲                   │
///    └──── retry ────────┤
///                        └─exhausted──▶ FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Waiting for an attempt.
    Pending,
    /// An attempt is in progress.
    Delivering,
    /// A 2xx response was received.
    Delivered,
    /// Attempts were exhausted.
    Failed,
}

impl DeliveryStatus {
    /// Returns true for states that only a manual retry can leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Delivering => write!(f, "DELIVERING"),
            Self::Delivered => write!(f, "DELIVERED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "DELIVERING" => Ok(Self::Delivering),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("invalid delivery status: {other}")),
        }
    }
}

text_enum_sqlx!(DeliveryStatus);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, reset or TLS failure.
    Network,
    /// No response within the destination timeout.
    Timeout,
    /// The destination answered with a non-2xx status.
    HttpStatus(u16),
    /// Anything that could not be classified.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::HttpStatus(code) => write!(f, "http_status:{code}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Self::Network),
            "timeout" => Ok(Self::Timeout),
            "unknown" => Ok(Self::Unknown),
            other => other
                .strip_prefix("http_status:")
                .and_then(|code| code.parse::<u16>().ok())
                .map(Self::HttpStatus)
                .ok_or_else(|| format!("invalid error kind: {other}")),
        }
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for ErrorKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

text_enum_sqlx!(ErrorKind);

/// One (destination, event) pairing and the state of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Unique identifier.
    pub id: DeliveryId,
    /// Destination receiving the event.
    pub destination_id: DestinationId,
    /// Producer-assigned event id.
    pub event_id: EventId,
    /// Dot-namespaced event type.
    pub event_type: String,
    /// Exact envelope bytes that were signed and are sent on every attempt.
    pub payload: String,
    /// `sha256=<hex>` signature of `payload`.
    pub signature: String,
    /// Current lifecycle state.
    pub status: DeliveryStatus,
    /// Attempts made so far. Never decreases.
    pub attempts: u32,
    /// Attempt budget copied from the destination at creation.
    pub max_attempts: u32,
    /// Status code of the last response.
    pub response_status: Option<u16>,
    /// Truncated body of the last response.
    pub response_body: Option<String>,
    /// Redacted headers of the last response.
    pub response_headers: Option<HashMap<String, String>>,
    /// Duration of the last attempt in milliseconds.
    pub latency_ms: Option<u64>,
    /// Message of the last failure.
    pub error_message: Option<String>,
    /// Classification of the last failure.
    pub error_kind: Option<ErrorKind>,
    /// When the next attempt becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the delivery succeeded.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the delivery was last claimed for an attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the delivery was created.
    pub created_at: DateTime<Utc>,
    /// When the delivery was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery that is due immediately.
    pub fn new(
        destination: &Destination,
        event_id: EventId,
        event_type: impl Into<String>,
        payload: String,
        signature: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            destination_id: destination.id,
            event_id,
            event_type: event_type.into(),
            payload,
            signature,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: destination.max_attempts,
            response_status: None,
            response_body: None,
            response_headers: None,
            latency_ms: None,
            error_message: None,
            error_kind: None,
            next_retry_at: Some(now),
            delivered_at: None,
            last_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the delivery is DELIVERED or FAILED.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true when an attempt may start at `now`, regardless of the
    /// attempt budget.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Returns true when a sweep at `now` should pick this delivery up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_ready(now) && self.attempts < self.max_attempts
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Delivery {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let response_status: Option<i32> = row.try_get("response_status")?;
        let response_headers: Option<sqlx::types::Json<HashMap<String, String>>> =
            row.try_get("response_headers")?;
        let latency_ms: Option<i64> = row.try_get("latency_ms")?;

        Ok(Self {
            id: row.try_get("id")?,
            destination_id: row.try_get("destination_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            signature: row.try_get("signature")?,
            status: row.try_get("status")?,
            attempts: u32::try_from(attempts)
                .map_err(|_| sqlx::Error::Decode("attempts cannot be negative".into()))?,
            max_attempts: u32::try_from(max_attempts)
                .map_err(|_| sqlx::Error::Decode("max_attempts cannot be negative".into()))?,
            response_status: response_status
                .map(u16::try_from)
                .transpose()
                .map_err(|_| sqlx::Error::Decode("response_status out of range".into()))?,
            response_body: row.try_get("response_body")?,
            response_headers: response_headers.map(|h| h.0),
            latency_ms: latency_ms.map(|ms| non_negative(ms, "latency_ms")).transpose()?,
            error_message: row.try_get("error_message")?,
            error_kind: row.try_get("error_kind")?,
            next_retry_at: row.try_get("next_retry_at")?,
            delivered_at: row.try_get("delivered_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Kind of audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    /// A delivery was created by event fan-out.
    DeliveryCreated,
    /// An operator re-opened a delivery.
    DeliveryRetried,
    /// A delivery reached DELIVERED.
    DeliverySucceeded,
    /// A delivery reached FAILED.
    DeliveryFailed,
    /// A synthetic test event was sent to a destination.
    DestinationTested,
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeliveryCreated => "delivery_created",
            Self::DeliveryRetried => "delivery_retried",
            Self::DeliverySucceeded => "delivery_succeeded",
            Self::DeliveryFailed => "delivery_failed",
            Self::DestinationTested => "destination_tested",
        };
        f.write_str(name)
    }
}

impl FromStr for LogAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivery_created" => Ok(Self::DeliveryCreated),
            "delivery_retried" => Ok(Self::DeliveryRetried),
            "delivery_succeeded" => Ok(Self::DeliverySucceeded),
            "delivery_failed" => Ok(Self::DeliveryFailed),
            "destination_tested" => Ok(Self::DestinationTested),
            other => Err(format!("invalid log action: {other}")),
        }
    }
}

text_enum_sqlx!(LogAction);

/// Structured audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLog {
    /// Unique identifier.
    pub id: LogId,
    /// Destination the entry concerns.
    pub destination_id: DestinationId,
    /// Delivery the entry concerns, if any.
    pub delivery_id: Option<DeliveryId>,
    /// What happened.
    pub action: LogAction,
    /// Human-readable summary.
    pub message: String,
    /// Structured details.
    pub metadata: serde_json::Value,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl DeliveryLog {
    /// Creates an entry for a delivery.
    pub fn for_delivery(
        delivery: &Delivery,
        action: LogAction,
        message: impl Into<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LogId::new(),
            destination_id: delivery.destination_id,
            delivery_id: Some(delivery.id),
            action,
            message: message.into(),
            metadata,
            created_at: now,
        }
    }
}

fn non_negative(value: i64, column: &str) -> Result<u64, sqlx::Error> {
    u64::try_from(value).map_err(|_| sqlx::Error::Decode(format!("{column} cannot be negative").into()))
}
