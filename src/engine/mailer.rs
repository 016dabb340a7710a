//! Simulated delivery.

use std::time::Duration;

use tracing::debug;

use crate::model::Email;
use crate::store::SENT_DETAIL;

/// Stands in for a real mail transport: waits a fixed delay and reports
/// success. Never fails.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedMailer {
    delay: Duration,
}

impl SimulatedMailer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// "Send" the email. Returns the detail to store with the status update.
    pub async fn send(&self, email: &Email) -> String {
        debug!(email_id = email.id, to = %email.email, "sending email");
        tokio::time::sleep(self.delay).await;
        debug!(email_id = email.id, to = %email.email, "email sent");
        SENT_DETAIL.to_string()
    }
}

impl Default for SimulatedMailer {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
