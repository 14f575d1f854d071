use std::time::Duration;

use common::{Clock, ExecutionClient, Result};

/// Latest market-clock snapshot, refreshed by the safety sweep.
#[derive(Debug, Default)]
pub struct SessionClock {
    snapshot: Option<Clock>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a fresh clock. On error the previous snapshot is kept.
    pub async fn refresh(&mut self, client: &dyn ExecutionClient) -> Result<&Clock> {
        let clock = client.get_clock().await?;
        Ok(self.snapshot.insert(clock))
    }

    pub fn snapshot(&self) -> Option<&Clock> {
        self.snapshot.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.snapshot.as_ref().is_some_and(|c| c.is_open)
    }

    /// Time left until the session closes, zero once past it.
    pub fn time_to_close(&self) -> Option<Duration> {
        let clock = self.snapshot.as_ref().filter(|c| c.is_open)?;
        Some((clock.next_close - clock.timestamp).to_std().unwrap_or_default())
    }

    pub fn within_close_margin(&self, margin: Duration) -> bool {
        self.time_to_close().is_some_and(|left| left <= margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::clock_at;
    use paper::PaperBroker;

    #[tokio::test]
    async fn margin_detection_follows_refreshed_clock() {
        let broker = PaperBroker::new(clock_at(30));
        let mut clock = SessionClock::new();
        assert!(!clock.is_open());

        clock.refresh(&broker).await.unwrap();
        assert!(clock.is_open());
        assert_eq!(clock.time_to_close(), Some(Duration::from_secs(360 * 60)));
        assert!(!clock.within_close_margin(Duration::from_secs(300)));

        broker.set_clock(clock_at(386)).await;
        clock.refresh(&broker).await.unwrap();
        assert!(clock.within_close_margin(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let broker = PaperBroker::new(clock_at(30));
        let mut clock = SessionClock::new();
        clock.refresh(&broker).await.unwrap();

        broker.set_failing(true).await;
        assert!(clock.refresh(&broker).await.is_err());
        assert!(clock.is_open());
    }
}
