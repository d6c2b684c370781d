//! Identity of whoever issues a collection operation.

use std::collections::BTreeMap;

use chrono::FixedOffset;

use crate::clock::{utc, Clock, TimeContext};
use crate::value::{Record, Value};

/// Per-request identity threaded through every collection operation.
///
/// Carries the user attributes permission scopes and context variables read,
/// the timezone relative date operators are evaluated in, and the clock that
/// defines "now" for this request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub team: String,
    pub role: String,
    pub rendering_id: i64,
    pub tags: BTreeMap<String, String>,
    pub timezone: FixedOffset,
    /// Request-scoped variables (`ip`, headers, ...) exposed to scopes.
    pub request: Record,
    pub clock: Clock,
}

impl Caller {
    #[must_use]
    pub fn new(id: i64, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            team: String::new(),
            role: String::new(),
            rendering_id: 0,
            tags: BTreeMap::new(),
            timezone: utc(),
            request: Record::new(),
            clock: Clock::default(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = first_name.into();
        self.last_name = last_name.into();
        self
    }

    #[must_use]
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = team.into();
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = timezone;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_request_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request.insert(key.into(), value.into());
        self
    }

    /// Time context in the caller's own timezone.
    #[must_use]
    pub fn time_context(&self) -> TimeContext {
        TimeContext::new(self.timezone, self.clock.now())
    }

    /// Time context for a filter that may carry its own timezone.
    #[must_use]
    pub fn time_context_in(&self, timezone: Option<FixedOffset>) -> TimeContext {
        TimeContext::new(timezone.unwrap_or(self.timezone), self.clock.now())
    }

    /// User attributes, keyed the way context variables address them.
    #[must_use]
    pub fn user_record(&self) -> Record {
        let mut user = Record::new();
        user.insert("id".into(), Value::Int(self.id));
        user.insert("email".into(), Value::from(self.email.as_str()));
        user.insert("firstName".into(), Value::from(self.first_name.as_str()));
        user.insert("lastName".into(), Value::from(self.last_name.as_str()));
        user.insert(
            "fullName".into(),
            Value::from(format!("{} {}", self.first_name, self.last_name)),
        );
        user.insert("roleName".into(), Value::from(self.role.as_str()));
        user.insert("renderingId".into(), Value::Int(self.rendering_id));
        user.insert(
            "tags".into(),
            Value::Record(
                self.tags
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
                    .collect(),
            ),
        );
        user
    }
}

impl Default for Caller {
    fn default() -> Self {
        Self::new(1, "user@example.com")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_record_exposes_tags_and_full_name() {
        let caller = Caller::new(7, "ada@example.com")
            .with_name("Ada", "Lovelace")
            .with_tag("region", "eu");
        let user = caller.user_record();
        assert_eq!(user["fullName"], Value::from("Ada Lovelace"));
        assert_eq!(
            crate::value::field_value(&user, "tags:region"),
            &Value::from("eu")
        );
    }

    #[test]
    fn filter_timezone_overrides_caller_timezone() {
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let caller = Caller::default();
        assert_eq!(caller.time_context_in(Some(tokyo)).timezone, tokyo);
        assert_eq!(caller.time_context_in(None).timezone, utc());
    }
}
