//! Caller-facing engine operations.
//!
//! Every operation goes through the [`EngineState`](crate::state::EngineState)
//! caches; a miss runs the pipeline under the configured fetch timeout.

pub mod analytics;
pub mod members;

pub use analytics::get_analytics_snapshot;
pub use members::{compute_stats, get_stats, list_members, outreach_today, refresh};

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use parking_lot::Mutex;

    use crate::source::{FetchWindow, RawBatch, RawRecord, SourceAdapter, SourceError, TabularRow};
    use crate::state::{Clock, EngineState};
    use crate::types::{Config, SheetSourceConfig, SourceConfig};

    /// In-memory source that counts fetches and can be told to fail or stall.
    pub struct FakeSource {
        pub batch: RawBatch,
        pub fetches: AtomicUsize,
        pub fail_with: Mutex<Option<u16>>,
        pub delay: Duration,
    }

    impl FakeSource {
        pub fn new(batch: RawBatch) -> Arc<Self> {
            Arc::new(Self {
                batch,
                fetches: AtomicUsize::new(0),
                fail_with: Mutex::new(None),
                delay: Duration::ZERO,
            })
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeSource {
        fn identity(&self) -> String {
            "fake".to_string()
        }

        async fn fetch(&self, _window: FetchWindow) -> Result<RawBatch, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failure = *self.fail_with.lock();
            match failure {
                Some(status) => Err(SourceError::Api {
                    status,
                    message: "upstream unavailable".to_string(),
                }),
                None => Ok(self.batch.clone()),
            }
        }
    }

    pub fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    pub fn config() -> Config {
        Config::with_source(SourceConfig::Sheet(SheetSourceConfig {
            members: "leden.csv".to_string(),
            visits: "checkins.csv".to_string(),
            payments: None,
        }))
    }

    pub fn state(source: Arc<FakeSource>) -> EngineState {
        EngineState::new(config(), source)
            .unwrap()
            .with_clock(Clock::Fixed(now()))
    }

    fn row(pairs: &[(&str, &str)]) -> RawRecord {
        RawRecord::Tabular(TabularRow::from_pairs(pairs))
    }

    fn membership(r: &str, first: &str, last: &str, product: &str, status: &str) -> RawRecord {
        row(&[
            ("Klant ref.", r),
            ("Klant voornaam", first),
            ("Klant achternaam", last),
            ("Klant telefoonnummer", "0612345678"),
            ("Naam van product", product),
            ("Tarief", "49,95"),
            ("Status", status),
            ("Actief sinds", "01-01-2023"),
        ])
    }

    fn checkin(first: &str, last: &str, when: &str) -> RawRecord {
        row(&[("first_name", first), ("last_name", last), ("start_datetime", when)])
    }

    fn payment(r: &str, amount: &str, date: &str) -> RawRecord {
        row(&[("Klant ref.", r), ("Bedrag", amount), ("Datum", date), ("Status", "Betaald")])
    }

    /// Four active members: Anna (regular, low), Bram (never visited,
    /// critical), Cor (20 days away, medium), Eva (59 days away, high).
    pub fn gym_batch() -> RawBatch {
        RawBatch {
            members: vec![
                membership("K1", "Anna", "Jansen", "Onbeperkt", "Actief"),
                membership("K2", "Bram", "Bakker", "Onbeperkt", "Actief"),
                membership("K3", "Cor", "Smit", "Onbeperkt", "Actief"),
                membership("K4", "Dirk", "Visser", "Onbeperkt", "Verlopen"),
                membership("K5", "Eva", "de Boer", "Onbeperkt", "Actief"),
                membership("K5", "Eva", "de Boer", "Proefles", "Verlopen"),
            ],
            visits: vec![
                checkin("Anna", "Jansen", "09-03-2025 18:00"),
                checkin("Anna", "Jansen", "07-03-2025 18:00"),
                checkin("Anna", "Jansen", "05-03-2025 07:00"),
                checkin("Anna", "Jansen", "03-03-2025 18:00"),
                checkin("Cor", "Smit", "18-02-2025 18:00"),
                checkin("Eva", "de Boer", "10-01-2025 18:00"),
            ],
            payments: vec![
                payment("K1", "100,00", "01-05-2024"),
                payment("K5", "50", "01-06-2024"),
            ],
            skipped: 0,
        }
    }
}
