// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CloudEvents v1.0 envelope attached to telemetry (and, optionally, RPC) messages as MQTT
//! user properties (`§5`).
//!
//! One [`CloudEvent`] type serves both directions: [`CloudEventBuilder`] produces the headers a
//! sender attaches to a publish, and [`CloudEvent::from_user_properties`] recovers a `CloudEvent`
//! from the user properties of a received publish. An absent or unsupported `specversion` is not
//! a hard error here — it surfaces as `Err`, and callers that only want a CloudEvent when one is
//! actually present treat that `Err` as "no CloudEvent", not as a reason to reject the message.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use fluent_uri::Uri;
use uuid::Uuid;

use crate::common::is_invalid_utf8;
use crate::error::RpcError;

const SUPPORTED_SPEC_VERSION: &str = "1.0";

/// Returns `true` if `s` parses as a URI with a scheme, i.e. an absolute URI rather than a
/// relative reference.
fn is_absolute_uri(s: &str) -> bool {
    Uri::parse(s).is_ok_and(|u| u.scheme().is_some())
}

/// Returns `true` if `s` looks like a MIME type: a `type/subtype` pair with no forbidden
/// characters, per [RFC 2045](https://www.rfc-editor.org/rfc/rfc2045).
fn is_mime_shaped(s: &str) -> bool {
    let Some((kind, subtype)) = s.split_once('/') else {
        return false;
    };
    let is_token = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_graphic() && !matches!(c, '/' | ';'));
    is_token(kind) && subtype.split(';').next().is_some_and(is_token)
}

/// The well-known CloudEvents attribute names, as they appear as user property keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloudEventFields {
    Id,
    Source,
    SpecVersion,
    EventType,
    Subject,
    Time,
    DataContentType,
    DataSchema,
}

impl Display for CloudEventFields {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudEventFields::Id => "id",
            CloudEventFields::Source => "source",
            CloudEventFields::SpecVersion => "specversion",
            CloudEventFields::EventType => "type",
            CloudEventFields::Subject => "subject",
            CloudEventFields::Time => "time",
            CloudEventFields::DataContentType => "datacontenttype",
            CloudEventFields::DataSchema => "dataschema",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CloudEventFields {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(CloudEventFields::Id),
            "source" => Ok(CloudEventFields::Source),
            "specversion" => Ok(CloudEventFields::SpecVersion),
            "type" => Ok(CloudEventFields::EventType),
            "subject" => Ok(CloudEventFields::Subject),
            "time" => Ok(CloudEventFields::Time),
            "datacontenttype" => Ok(CloudEventFields::DataContentType),
            "dataschema" => Ok(CloudEventFields::DataSchema),
            _ => Err(()),
        }
    }
}

/// What to use for the CloudEvents `subject` attribute when sending.
#[derive(Clone, Debug)]
pub enum CloudEventSubject {
    /// Use the topic the message is published to.
    PublishTopic,
    /// Use a caller-supplied value.
    Custom(String),
    /// Omit the `subject` attribute.
    None,
}

/// A CloudEvents v1.0 envelope.
///
/// Every field is private: the only way to build one is through [`CloudEventBuilder`], so
/// `§4.5`'s "violating any of these raises `ConfigurationInvalid` before publish" contract can't
/// be bypassed by assembling a struct literal directly.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct CloudEvent {
    /// Identifies the context in which the event happened (e.g. a URI naming the source system).
    source: String,
    /// The CloudEvents specification version in use. Only `"1.0"` is accepted.
    #[builder(default = "SUPPORTED_SPEC_VERSION.to_string()")]
    spec_version: String,
    /// The type of event, used for routing and observability.
    event_type: String,
    /// URI identifying the schema the event's data adheres to.
    #[builder(default = "None")]
    data_schema: Option<String>,
    /// Content type of the event's data, independent of the MQTT payload's own content type.
    #[builder(default = "None")]
    data_content_type: Option<String>,
    /// Unique identifier of this event. Defaults to a fresh random UUID.
    #[builder(default = "Uuid::new_v4().to_string()")]
    id: String,
    /// When the event occurred. Defaults to the current time.
    #[builder(default = "Some(DateTime::<Utc>::from(SystemTime::now()))")]
    time: Option<DateTime<Utc>>,
    /// The event's subject within the context of `source`.
    #[builder(default = "CloudEventSubject::PublishTopic")]
    subject: CloudEventSubject,
}

impl CloudEventBuilder {
    fn validate(&self) -> Result<(), String> {
        // `spec_version` is intentionally not restricted to `"1.0"` here: `§4.5` only requires
        // `source`/`dataschema`/`datacontenttype` validation before publish. A sender is free to
        // set an unrecognized `specversion` (it still publishes); only the receiving side treats
        // anything other than `"1.0"` as "no CloudEvent" rather than a parse error.
        if let Some(source) = &self.source {
            if source.is_empty() {
                return Err("source cannot be empty".to_string());
            }
        }
        if let Some(event_type) = &self.event_type {
            if event_type.is_empty() {
                return Err("event_type cannot be empty".to_string());
            }
        }
        if let Some(id) = &self.id {
            if id.is_empty() {
                return Err("id cannot be empty".to_string());
            }
        }
        if let Some(Some(data_schema)) = &self.data_schema {
            if !is_absolute_uri(data_schema) {
                return Err(format!("data_schema '{data_schema}' is not an absolute URI"));
            }
        }
        if let Some(Some(data_content_type)) = &self.data_content_type {
            if is_invalid_utf8(data_content_type) || !is_mime_shaped(data_content_type) {
                return Err(format!("data_content_type '{data_content_type}' is not a valid MIME type"));
            }
        }
        Ok(())
    }
}

impl CloudEvent {
    /// Renders this envelope as the user properties to attach to an outgoing publish.
    ///
    /// `publish_topic` supplies the `subject` attribute when [`CloudEventSubject::PublishTopic`]
    /// was used.
    #[must_use]
    pub fn into_headers(self, publish_topic: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            (CloudEventFields::Id.to_string(), self.id),
            (CloudEventFields::Source.to_string(), self.source),
            (CloudEventFields::SpecVersion.to_string(), self.spec_version),
            (CloudEventFields::EventType.to_string(), self.event_type),
        ];
        match self.subject {
            CloudEventSubject::Custom(subject) => {
                headers.push((CloudEventFields::Subject.to_string(), subject));
            }
            CloudEventSubject::PublishTopic => {
                headers.push((CloudEventFields::Subject.to_string(), publish_topic.to_string()));
            }
            CloudEventSubject::None => {}
        }
        if let Some(time) = self.time {
            headers.push((CloudEventFields::Time.to_string(), time.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(data_schema) = self.data_schema {
            headers.push((CloudEventFields::DataSchema.to_string(), data_schema));
        }
        if let Some(data_content_type) = self.data_content_type {
            headers.push((CloudEventFields::DataContentType.to_string(), data_content_type));
        }
        headers
    }

    /// Recovers a [`CloudEvent`] from the user properties of a received publish.
    ///
    /// Only `specversion`, `source`, `type`, and `id` are required; every other attribute is
    /// optional. A publish that carries none of these attributes, or an unsupported
    /// `specversion`, is reported as an error so the caller can treat "no CloudEvent" as
    /// distinct from "malformed CloudEvent" if it chooses to.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorKind::HeaderInvalid`] if `specversion` is present but not
    /// `"1.0"`, or if a required attribute is missing or empty.
    pub fn from_user_properties(properties: &[(String, String)]) -> Result<Self, RpcError> {
        let mut id = None;
        let mut source = None;
        let mut spec_version = None;
        let mut event_type = None;
        let mut subject = None;
        let mut time = None;
        let mut data_content_type = None;
        let mut data_schema = None;

        for (key, value) in properties {
            match CloudEventFields::from_str(key) {
                Ok(CloudEventFields::Id) => id = Some(value.clone()),
                Ok(CloudEventFields::Source) => source = Some(value.clone()),
                Ok(CloudEventFields::SpecVersion) => spec_version = Some(value.clone()),
                Ok(CloudEventFields::EventType) => event_type = Some(value.clone()),
                Ok(CloudEventFields::Subject) => subject = Some(value.clone()),
                Ok(CloudEventFields::Time) => time = Some(value.clone()),
                Ok(CloudEventFields::DataContentType) => data_content_type = Some(value.clone()),
                Ok(CloudEventFields::DataSchema) => data_schema = Some(value.clone()),
                Err(()) => {}
            }
        }

        let spec_version = spec_version
            .ok_or_else(|| RpcError::header_missing("specversion", Some("no CloudEvent present".to_string())))?;
        if spec_version != SUPPORTED_SPEC_VERSION {
            return Err(RpcError::header_invalid(
                "specversion",
                &spec_version,
                Some(format!("unsupported CloudEvents spec_version '{spec_version}'")),
            ));
        }

        let id = id.ok_or_else(|| RpcError::header_missing("id", None))?;
        let source = source.ok_or_else(|| RpcError::header_missing("source", None))?;
        let event_type = event_type.ok_or_else(|| RpcError::header_missing("type", None))?;
        if id.is_empty() || source.is_empty() || event_type.is_empty() {
            return Err(RpcError::header_invalid(
                "id/source/type",
                "",
                Some("CloudEvents required attributes must not be empty".to_string()),
            ));
        }

        let time = match time {
            Some(t) => Some(
                DateTime::parse_from_rfc3339(&t)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| RpcError::header_invalid("time", &t, Some(e.to_string())))?,
            ),
            None => None,
        };

        Ok(CloudEvent {
            source,
            spec_version,
            event_type,
            data_schema,
            data_content_type,
            id,
            time,
            subject: match subject {
                Some(s) => CloudEventSubject::Custom(s),
                None => CloudEventSubject::None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(CloudEventFields::SpecVersion; "specversion")]
    #[test_case(CloudEventFields::EventType; "type")]
    #[test_case(CloudEventFields::Source; "source")]
    #[test_case(CloudEventFields::Id; "id")]
    #[test_case(CloudEventFields::Subject; "subject")]
    #[test_case(CloudEventFields::Time; "time")]
    #[test_case(CloudEventFields::DataContentType; "datacontenttype")]
    #[test_case(CloudEventFields::DataSchema; "dataschema")]
    fn field_display_round_trips_through_from_str(field: CloudEventFields) {
        assert_eq!(field, CloudEventFields::from_str(&field.to_string()).unwrap());
    }

    #[test]
    fn builder_fills_defaults() {
        let event = CloudEventBuilder::default()
            .source("aio://edge/device-1")
            .event_type("ex.telemetry")
            .build()
            .unwrap();
        assert_eq!(event.spec_version, SUPPORTED_SPEC_VERSION);
        assert!(!event.id.is_empty());
        assert!(event.time.is_some());
    }

    #[test]
    fn builder_accepts_unrecognized_spec_version() {
        let event = CloudEventBuilder::default()
            .source("aio://edge/device-1")
            .event_type("ex.telemetry")
            .spec_version("0.707")
            .build()
            .unwrap();
        assert_eq!(event.spec_version, "0.707");
    }

    #[test]
    fn unrecognized_spec_version_on_the_wire_is_reported_as_header_invalid() {
        let headers = vec![
            ("specversion".to_string(), "0.707".to_string()),
            ("id".to_string(), "abc".to_string()),
            ("source".to_string(), "aio://edge/device-1".to_string()),
            ("type".to_string(), "ex.telemetry".to_string()),
        ];
        let err = CloudEvent::from_user_properties(&headers).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::HeaderInvalid);
    }

    #[test]
    fn headers_round_trip_through_from_user_properties() {
        let event = CloudEventBuilder::default()
            .source("aio://edge/device-1")
            .event_type("ex.telemetry")
            .subject(CloudEventSubject::Custom("widget-1".to_string()))
            .build()
            .unwrap();
        let id = event.id.clone();
        let headers = event.into_headers("fallback/topic");
        let parsed = CloudEvent::from_user_properties(&headers).unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.source, "aio://edge/device-1");
        assert!(matches!(parsed.subject, CloudEventSubject::Custom(s) if s == "widget-1"));
    }

    #[test]
    fn missing_specversion_is_reported_as_header_missing() {
        let headers = vec![("id".to_string(), "abc".to_string())];
        let err = CloudEvent::from_user_properties(&headers).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::HeaderMissing);
    }

    #[test]
    fn builder_accepts_absolute_data_schema() {
        let event = CloudEventBuilder::default()
            .source("aio://edge/device-1")
            .event_type("ex.telemetry")
            .data_schema("aio://edge/schemas/widget-v1")
            .build();
        assert!(event.is_ok());
    }

    #[test_case("not-a-uri"; "no scheme")]
    #[test_case("/relative/path"; "relative path")]
    fn builder_rejects_relative_data_schema(data_schema: &str) {
        let result = CloudEventBuilder::default()
            .source("aio://edge/device-1")
            .event_type("ex.telemetry")
            .data_schema(data_schema)
            .build();
        assert!(result.is_err());
    }

    #[test_case("application/json"; "simple type")]
    #[test_case("application/json; charset=utf-8"; "with parameter")]
    fn builder_accepts_mime_shaped_content_type(data_content_type: &str) {
        let event = CloudEventBuilder::default()
            .source("aio://edge/device-1")
            .event_type("ex.telemetry")
            .data_content_type(data_content_type)
            .build();
        assert!(event.is_ok());
    }

    #[test_case("not-a-mime-type"; "no slash")]
    #[test_case("/json"; "empty type")]
    fn builder_rejects_non_mime_content_type(data_content_type: &str) {
        let result = CloudEventBuilder::default()
            .source("aio://edge/device-1")
            .event_type("ex.telemetry")
            .data_content_type(data_content_type)
            .build();
        assert!(result.is_err());
    }
}
