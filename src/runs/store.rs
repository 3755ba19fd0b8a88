use crate::domain::events::EventRecord;
use crate::persistence::PersistenceLayer;
use crate::runs::retry::{RetryPolicy, retry};
use futures::Stream;
use std::sync::Arc;

/// Durable, append-ordered record of run events.
#[derive(Debug, Clone)]
pub struct EventStore {
    db: Arc<dyn PersistenceLayer>,
    retry: RetryPolicy,
    page_size: usize,
}

impl EventStore {
    pub fn new(db: Arc<dyn PersistenceLayer>, retry: RetryPolicy, page_size: usize) -> Self {
        Self {
            db,
            retry,
            page_size: page_size.max(1),
        }
    }

    /// Append an event, retrying transient failures. A final failure is
    /// logged and reported as `false`; it never aborts the caller.
    pub async fn store_event(&self, record: &EventRecord) -> bool {
        match retry(self.retry, || self.db.append_event(record)).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    run_id = %record.run_id,
                    event_id = %record.event_id,
                    error = %err,
                    "failed to persist run event; replay will be missing it"
                );
                false
            }
        }
    }

    /// Stored events of `run_id` with `seq > after`, in order, fetched page
    /// by page as the stream is polled.
    pub fn replay(
        &self,
        run_id: &str,
        after: u64,
    ) -> impl Stream<Item = anyhow::Result<EventRecord>> + Send + 'static {
        let db = Arc::clone(&self.db);
        let page_size = self.page_size;
        let run_id = run_id.to_string();

        async_stream::try_stream! {
            let mut cursor = after;
            loop {
                let page = db.list_events(&run_id, cursor, page_size).await?;
                let exhausted = page.len() < page_size;
                for record in page {
                    cursor = record.seq;
                    yield record;
                }
                if exhausted {
                    break;
                }
            }
        }
    }
}
