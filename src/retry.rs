use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the track at the front and try again after the retry delay.
    Retry { attempt: u32 },
    AlreadyRetried,
    Exhausted,
}

/// Retry bookkeeping for one guild.
///
/// Holds at most one track identity: a retried track goes back to the front
/// of the queue, so the next attempt is always for that same track, and the
/// record is cleared as soon as it either plays or is dropped.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    max_retries: u32,
    count: u32,
    retried: Option<String>,
}

impl RetryLedger {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            count: 0,
            retried: None,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_clear(&self) -> bool {
        self.count == 0 && self.retried.is_none()
    }

    pub fn has_retried(&self, url: &str) -> bool {
        self.retried.as_deref() == Some(url)
    }

    /// Records a failed attempt for `url` and decides what happens to the track.
    pub fn register_failure(&mut self, url: &str) -> RetryDecision {
        if self.has_retried(url) {
            self.forget(url);
            return RetryDecision::AlreadyRetried;
        }

        if self.count >= self.max_retries {
            self.forget(url);
            return RetryDecision::Exhausted;
        }

        self.count += 1;
        self.retried = Some(url.to_string());
        info!("Retrying {url} (attempt {}/{})", self.count, self.max_retries);

        RetryDecision::Retry { attempt: self.count }
    }

    pub fn register_success(&mut self, url: &str) {
        self.forget(url);
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.retried = None;
    }

    fn forget(&mut self, url: &str) {
        self.count = 0;
        if self.has_retried(url) {
            self.retried = None;
        }
    }
}
