//! Write-behind spend flusher.
//!
//! Spend records are queued by [`super::BudgetManager::record_spend`] and
//! batch-written here. The task exits once the sender half is dropped and the
//! remaining buffer is flushed, which is how shutdown gets its synchronous
//! final flush.

use std::time::Duration;

use rusqlite::params;
use tokio::sync::mpsc;

use crate::budget::SpendRecord;
use crate::db::Database;

/// Flush at this many buffered records regardless of the timer.
const BATCH_SIZE: usize = 100;

/// Timer-driven flush interval.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the background flusher. With no durable store the task just drains
/// the channel so senders never block on a dead queue.
pub fn spawn_spend_flusher(
    db: Option<Database>,
    mut rx: mpsc::UnboundedReceiver<SpendRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<SpendRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = rx.recv() => {
                    match record {
                        Some(r) => {
                            buffer.push(r);
                            if buffer.len() >= BATCH_SIZE {
                                flush_batch(db.as_ref(), &mut buffer);
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush_batch(db.as_ref(), &mut buffer);
                            }
                            tracing::info!("Spend flusher shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush_batch(db.as_ref(), &mut buffer);
                    }
                }
            }
        }
    })
}

fn flush_batch(db: Option<&Database>, buffer: &mut Vec<SpendRecord>) {
    let Some(db) = db else {
        buffer.clear();
        return;
    };

    let records = std::mem::take(buffer);
    let count = records.len();

    if let Err(e) = write_records(db, &records) {
        tracing::error!(count, error = %e, "Failed to flush spend batch");
        // Put records back so the next tick retries.
        buffer.extend(records);
    } else {
        tracing::debug!(count, "Flushed spend batch");
    }
}

fn write_records(db: &Database, records: &[SpendRecord]) -> Result<(), rusqlite::Error> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO spend_log (amount_usd, model, daily_window, hourly_window, timestamp_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.amount_usd,
                    record.model,
                    record.daily_window,
                    record.hourly_window,
                    record.timestamp_ms as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
