use crate::ports::{Clock, ContentTypeSniffer};
use crate::sniff::MagicSniffer;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Long-lived state shared by every storage in the process.
/// Build once at startup and hand out clones of the `Arc`.
pub struct StorageContext {
    clock: Arc<dyn Clock>,
    sniffer: Arc<dyn ContentTypeSniffer>,
    start_time: DateTime<Utc>,
}

impl StorageContext {
    pub fn new(clock: Arc<dyn Clock>, sniffer: Arc<dyn ContentTypeSniffer>) -> Self {
        let start_time = clock.now();
        Self {
            clock,
            sniffer,
            start_time,
        }
    }

    /// Wall clock and magic-byte sniffing
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(MagicSniffer))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, Arc::new(MagicSniffer))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// When this context was built; the anchor for results that never expire
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn content_type(&self, bytes: &[u8]) -> &'static str {
        self.sniffer
            .sniff(bytes)
            .unwrap_or("application/octet-stream")
    }
}

impl Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("start_time", &self.start_time)
            .finish()
    }
}
