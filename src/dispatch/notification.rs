//! Store notification envelope — parsing and key classification
//!
//! A queue message body carries the store's creation event as a JSON string:
//!
//! ```text
//! {"Records":[{"eventName":"ObjectCreated:Put",
//!              "s3":{"bucket":{"name":"B"},"object":{"key":"input/a.wav","size":1024}}}]}
//! ```
//!
//! Records are parsed one by one so a single malformed record does not hide
//! its siblings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::ObjectLocation;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};

/// A single object-creation notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    /// Bucket the object was written to
    pub bucket: String,
    /// Decoded object key
    pub key: String,
    /// Object size, when the store reports it
    pub size_bytes: Option<u64>,
    /// Event time, when present and well-formed
    pub event_time: Option<DateTime<Utc>>,
    /// Store event name (e.g. `ObjectCreated:Put`)
    pub event_name: Option<String>,
}

impl JobNotification {
    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.key)
    }
}

/// Class of a key within the job namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyClass {
    /// New audio object to submit for inference
    Input,
    /// Successful inference result
    Output,
    /// Inference failure report
    Failure,
    /// Outside the job namespace; ignored
    Unclassified,
}

impl KeyClass {
    /// Classify a decoded key against the configured prefixes
    pub fn classify(key: &str, config: &DispatchConfig) -> Self {
        if key.starts_with(&config.input_prefix) {
            Self::Input
        } else if key.starts_with(&config.output_prefix) {
            Self::Output
        } else if key.starts_with(&config.failure_prefix) {
            Self::Failure
        } else {
            Self::Unclassified
        }
    }
}

impl std::fmt::Display for KeyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Failure => write!(f, "failure"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Parsed queue message body
#[derive(Debug)]
pub enum Envelope {
    /// Store test event sent when notifications are first configured
    TestEvent,
    /// One parse result per record, in delivery order
    Records(Vec<Result<JobNotification>>),
}

/// Wire format of the store's event document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    #[serde(rename = "Records", default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<StoreEventRecord>,
    #[serde(rename = "Event", default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEventRecord {
    #[serde(rename = "eventName", default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(rename = "eventTime", default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    pub s3: StoreEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntity {
    /// URL-form-encoded key
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl StoreEvent {
    /// Build the event the store emits for a single object PUT
    pub fn object_created(bucket: &str, key: &str, size: Option<u64>) -> Self {
        Self {
            records: vec![StoreEventRecord {
                event_name: Some("ObjectCreated:Put".to_string()),
                event_time: Some(Utc::now().to_rfc3339()),
                s3: StoreEntity {
                    bucket: BucketEntity {
                        name: bucket.to_string(),
                    },
                    object: ObjectEntity {
                        key: encode_key(key),
                        size,
                    },
                },
            }],
            event: None,
        }
    }

    /// Serialize as a queue message body
    pub fn to_body(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl StoreEventRecord {
    fn into_notification(self) -> Result<JobNotification> {
        let key = decode_key(&self.s3.object.key)?;
        if self.s3.bucket.name.is_empty() {
            return Err(DispatchError::Notification(
                "record has an empty bucket name".to_string(),
            ));
        }
        let event_time = self
            .event_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(JobNotification {
            bucket: self.s3.bucket.name,
            key,
            size_bytes: self.s3.object.size,
            event_time,
            event_name: self.event_name,
        })
    }
}

/// Parse a queue message body into its notification records.
///
/// Fails only when the body as a whole is not a notification document;
/// individual malformed records are reported inside [`Envelope::Records`].
pub fn parse_envelope(body: &str) -> Result<Envelope> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| DispatchError::Notification(format!("body is not JSON: {}", e)))?;

    let object = value.as_object().ok_or_else(|| {
        DispatchError::Notification("body is not a JSON object".to_string())
    })?;

    let records = match object.get("Records") {
        Some(serde_json::Value::Array(records)) => records,
        Some(_) => {
            return Err(DispatchError::Notification(
                "'Records' is not an array".to_string(),
            ))
        }
        None => {
            if object.get("Event").and_then(|e| e.as_str()) == Some("s3:TestEvent") {
                return Ok(Envelope::TestEvent);
            }
            return Err(DispatchError::Notification(
                "body has no 'Records'".to_string(),
            ));
        }
    };

    let parsed = records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            serde_json::from_value::<StoreEventRecord>(record.clone())
                .map_err(|e| DispatchError::Notification(format!("record {}: {}", i, e)))
                .and_then(StoreEventRecord::into_notification)
        })
        .collect();

    Ok(Envelope::Records(parsed))
}

/// Decode a URL-form-encoded object key (`+` is a space)
pub fn decode_key(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(DispatchError::Notification(
            "record has an empty object key".to_string(),
        ));
    }
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|k| k.into_owned())
        .map_err(|e| DispatchError::Notification(format!("invalid key encoding '{}': {}", raw, e)))
}

/// Inverse of [`decode_key`]; keeps `/` readable
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).replace("%20", "+"))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(bucket: &str, key: &str) -> String {
        format!(
            r#"{{"Records":[{{"eventName":"ObjectCreated:Put","eventTime":"2024-05-01T12:00:00.000Z","s3":{{"bucket":{{"name":"{}"}},"object":{{"key":"{}","size":42}}}}}}]}}"#,
            bucket, key
        )
    }

    fn records(envelope: Envelope) -> Vec<Result<JobNotification>> {
        match envelope {
            Envelope::Records(r) => r,
            Envelope::TestEvent => panic!("unexpected test event"),
        }
    }

    #[test]
    fn test_parse_single_record() {
        let parsed = records(parse_envelope(&body("B", "input/a.wav")).unwrap());
        assert_eq!(parsed.len(), 1);
        let n = parsed[0].as_ref().unwrap();
        assert_eq!(n.bucket, "B");
        assert_eq!(n.key, "input/a.wav");
        assert_eq!(n.size_bytes, Some(42));
        assert_eq!(n.event_name.as_deref(), Some("ObjectCreated:Put"));
        assert!(n.event_time.is_some());
    }

    #[test]
    fn test_parse_decodes_key() {
        let parsed = records(parse_envelope(&body("B", "input/my+talk%28v2%29.wav")).unwrap());
        assert_eq!(parsed[0].as_ref().unwrap().key, "input/my talk(v2).wav");
    }

    #[test]
    fn test_parse_malformed_json() {
        let err = parse_envelope("{not json").unwrap_err();
        assert!(matches!(err, DispatchError::Notification(_)));
    }

    #[test]
    fn test_parse_missing_records() {
        assert!(parse_envelope(r#"{"foo":1}"#).is_err());
        assert!(parse_envelope(r#"{"Records":{}}"#).is_err());
        assert!(parse_envelope("[]").is_err());
    }

    #[test]
    fn test_parse_test_event() {
        let body = r#"{"Service":"Amazon S3","Event":"s3:TestEvent","Time":"2024-05-01T12:00:00.000Z","Bucket":"B"}"#;
        assert!(matches!(parse_envelope(body).unwrap(), Envelope::TestEvent));
    }

    #[test]
    fn test_parse_partial_failure() {
        let body = r#"{"Records":[
            {"s3":{"bucket":{"name":"B"}}},
            {"s3":{"bucket":{"name":"B"},"object":{"key":"input/ok.wav"}}}
        ]}"#;
        let parsed = records(parse_envelope(body).unwrap());
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].is_err());
        assert_eq!(parsed[1].as_ref().unwrap().key, "input/ok.wav");
    }

    #[test]
    fn test_parse_tolerates_bad_event_time() {
        let body = r#"{"Records":[{"eventTime":"yesterday","s3":{"bucket":{"name":"B"},"object":{"key":"output/x.out"}}}]}"#;
        let parsed = records(parse_envelope(body).unwrap());
        let n = parsed[0].as_ref().unwrap();
        assert!(n.event_time.is_none());
        assert!(n.size_bytes.is_none());
    }

    #[test]
    fn test_empty_key_rejected() {
        let body = r#"{"Records":[{"s3":{"bucket":{"name":"B"},"object":{"key":""}}}]}"#;
        let parsed = records(parse_envelope(body).unwrap());
        assert!(parsed[0].is_err());
    }

    #[test]
    fn test_classify() {
        let config = DispatchConfig::default();
        assert_eq!(KeyClass::classify("input/a.wav", &config), KeyClass::Input);
        assert_eq!(KeyClass::classify("output/a.wav.out", &config), KeyClass::Output);
        assert_eq!(KeyClass::classify("failure/a.wav.out", &config), KeyClass::Failure);
        assert_eq!(KeyClass::classify("model.tar.gz", &config), KeyClass::Unclassified);
        assert_eq!(KeyClass::classify("inputs/a.wav", &config), KeyClass::Unclassified);
        assert_eq!(KeyClass::classify("Input/a.wav", &config), KeyClass::Unclassified);
    }

    #[test]
    fn test_key_class_display() {
        assert_eq!(KeyClass::Input.to_string(), "input");
        assert_eq!(KeyClass::Unclassified.to_string(), "unclassified");
    }

    #[test]
    fn test_object_created_event_parses_back() {
        let event = StoreEvent::object_created("B", "input/two words.wav", Some(7));
        let parsed = records(parse_envelope(&event.to_body()).unwrap());
        let n = parsed[0].as_ref().unwrap();
        assert_eq!(n.key, "input/two words.wav");
        assert_eq!(n.size_bytes, Some(7));
    }

    #[test]
    fn test_encode_key_keeps_slashes() {
        assert_eq!(encode_key("input/a b.wav"), "input/a+b.wav");
        assert_eq!(encode_key("output/a.wav.out.json"), "output/a.wav.out.json");
    }
}
