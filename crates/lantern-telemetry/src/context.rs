//! Request correlation context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing::span::EnteredSpan;
use uuid::Uuid;

/// Correlation data for one unit of work (a routed query, a CLI command).
///
/// Every span created from the context carries the same `correlation_id`,
/// so all plugin invocations for one query can be found in the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation id shared by all work for this request.
    pub correlation_id: Uuid,
    /// Parent request, when this context was derived with [`child`](Self::child).
    pub parent_id: Option<Uuid>,
    /// Component that owns the work.
    pub component: String,
    /// Operation within the component.
    pub operation: Option<String>,
    /// When the context was created.
    pub started_at: DateTime<Utc>,
}

impl RequestContext {
    /// Create a fresh context for `component`.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            parent_id: None,
            component: component.into(),
            operation: None,
            started_at: Utc::now(),
        }
    }

    /// Name the operation.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Reuse an existing correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    /// Derive a context for sub-work in another component.
    ///
    /// The child keeps the correlation id and records this context as parent.
    #[must_use]
    pub fn child(&self, component: impl Into<String>) -> Self {
        Self {
            correlation_id: self.correlation_id,
            parent_id: Some(self.correlation_id),
            component: component.into(),
            operation: None,
            started_at: Utc::now(),
        }
    }

    /// Milliseconds since the context was created.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// An `info`-level span tagged with this context.
    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "request",
            correlation_id = %self.correlation_id,
            component = %self.component,
            operation = self.operation.as_deref().unwrap_or(""),
        )
    }

    /// Enter [`span`](Self::span) until the guard is dropped.
    #[must_use]
    pub fn enter(&self) -> RequestGuard {
        RequestGuard {
            _entered: self.span().entered(),
        }
    }
}

/// Keeps a [`RequestContext`] span entered. Not `Send`; do not hold across `.await`.
#[derive(Debug)]
pub struct RequestGuard {
    _entered: EnteredSpan,
}
