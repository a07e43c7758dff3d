use serde::Serialize;

/// Standard API response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "calendarWarning", skip_serializing_if = "Option::is_none")]
    pub calendar_warning: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
            calendar_warning: None,
        }
    }
}

impl<T> From<Outcome<T>> for ApiResponse<T> {
    fn from(outcome: Outcome<T>) -> Self {
        Self {
            success: true,
            data: outcome.data,
            message: Some(outcome.message),
            calendar_warning: outcome.calendar_warning,
        }
    }
}

/// Result of a mutating operation: the record, a confirmation message fit
/// for direct display, and a soft warning when the calendar mirror failed.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub data: T,
    pub message: String,
    pub calendar_warning: Option<String>,
}

impl<T> Outcome<T> {
    pub fn new(data: T, message: impl Into<String>) -> Self {
        Self {
            data,
            message: message.into(),
            calendar_warning: None,
        }
    }

    pub fn with_calendar_warning(mut self, warning: Option<String>) -> Self {
        self.calendar_warning = warning;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_only_serialized_when_present() {
        let plain = serde_json::to_value(ApiResponse::success(1)).unwrap();
        assert!(plain.get("calendarWarning").is_none());
        assert!(plain.get("message").is_none());

        let outcome = Outcome::new(1, "ok").with_calendar_warning(Some("unavailable".to_string()));
        let value = serde_json::to_value(ApiResponse::from(outcome)).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["calendarWarning"], "unavailable");
        assert_eq!(value["message"], "ok");
    }
}
