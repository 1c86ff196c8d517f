//! Error tracker that reports exceptions as structured log events.

use crate::kernel::BaseErrorTracker;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorTracker;

impl BaseErrorTracker for TracingErrorTracker {
    fn track_exception(
        &self,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        context: serde_json::Value,
    ) {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        tracing::error!(
            error = %error,
            causes = ?chain,
            context = %context,
            "Tracked exception"
        );
    }
}
