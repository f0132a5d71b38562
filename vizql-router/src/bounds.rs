//! Resource bounds. `ResourceBounds` is profile-agnostic;
//! `vizql-types::config::VizqlConfig` supplies the concrete preview/widget
//! numbers through one shared code path parameterized by
//! [`vizql_types::RequestProfile`].

use std::time::Duration;

use vizql_types::config::{PreviewConfig, WidgetConfig};
use vizql_types::RequestProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBounds {
    pub max_execution_time: Duration,
    pub max_memory_bytes: u64,
    pub max_rows_to_read: u64,
    pub row_limit: u64,
}

impl ResourceBounds {
    pub fn for_profile(
        profile: RequestProfile,
        preview: &PreviewConfig,
        widget: &WidgetConfig,
    ) -> Self {
        match profile {
            RequestProfile::Preview => Self {
                max_execution_time: Duration::from_secs(preview.max_execution_time_s),
                max_memory_bytes: preview.max_memory_bytes,
                max_rows_to_read: preview.max_rows_to_read,
                row_limit: preview.row_limit,
            },
            RequestProfile::Widget => Self {
                max_execution_time: Duration::from_secs(widget.max_execution_time_s),
                max_memory_bytes: widget.max_memory_bytes,
                max_rows_to_read: widget.max_rows_to_read,
                // Widgets carry no distinct row_limit; the caller's own
                // pagination limit governs instead.
                row_limit: u64::MAX,
            },
        }
    }

    pub fn olap_settings(&self) -> vizql_sql::ast::OlapSettings {
        vizql_sql::ast::OlapSettings {
            max_execution_time_s: self.max_execution_time.as_secs(),
            max_memory_bytes: self.max_memory_bytes,
            max_rows_to_read: self.max_rows_to_read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_profile_matches_default_config() {
        let bounds =
            ResourceBounds::for_profile(RequestProfile::Preview, &PreviewConfig::default(), &WidgetConfig::default());
        assert_eq!(bounds.max_execution_time, Duration::from_secs(3));
        assert_eq!(bounds.max_memory_bytes, 100 * 1024 * 1024);
        assert_eq!(bounds.max_rows_to_read, 10_000_000);
        assert_eq!(bounds.row_limit, 100);
    }

    #[test]
    fn widget_profile_matches_default_config() {
        let bounds =
            ResourceBounds::for_profile(RequestProfile::Widget, &PreviewConfig::default(), &WidgetConfig::default());
        assert_eq!(bounds.max_execution_time, Duration::from_secs(30));
        assert_eq!(bounds.max_memory_bytes, 500 * 1024 * 1024);
        assert_eq!(bounds.max_rows_to_read, 50_000_000);
    }
}
