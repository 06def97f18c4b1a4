// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Bounded in-memory fault log shared by every component
//!
//! Reporting never fails from the caller's point of view. A log poisoned by a
//! panicking reporter is recovered and the recovery counted.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct FaultEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub context: Option<String>,
}

#[derive(Debug)]
struct FaultLog {
    entries: Mutex<VecDeque<FaultEntry>>,
    capacity: usize,
    next_seq: AtomicU64,
    evicted: AtomicU64,
    // times the log was found poisoned
    recovered: AtomicU64,
}

/// Cheap to clone; clones share the same log.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    log: Arc<FaultLog>,
}

impl Default for FaultReporter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FaultReporter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            log: Arc::new(FaultLog {
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                next_seq: AtomicU64::new(1),
                evicted: AtomicU64::new(0),
                recovered: AtomicU64::new(0),
            }),
        }
    }

    /// Record a fault and return its sequence id.
    pub fn report(&self, fault: &anyhow::Error, context: Option<&str>) -> Option<u64> {
        self.record(format!("{:#}", fault), context)
    }

    pub fn report_error<E>(&self, fault: &E, context: Option<&str>) -> Option<u64>
    where
        E: std::error::Error + ?Sized,
    {
        self.record(fault.to_string(), context)
    }

    pub fn report_message(&self, message: &str, context: Option<&str>) -> Option<u64> {
        self.record(message.to_string(), context)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<FaultEntry>> {
        match self.log.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                self.log.recovered.fetch_add(1, Ordering::SeqCst);
                self.log.entries.clear_poison();
                poisoned.into_inner()
            }
        }
    }

    fn record(&self, message: String, context: Option<&str>) -> Option<u64> {
        let seq = {
            let mut entries = self.lock();
            // assigned under the lock so retained entries stay in order
            let seq = self.log.next_seq.fetch_add(1, Ordering::SeqCst);
            while entries.len() >= self.log.capacity {
                entries.pop_front();
                self.log.evicted.fetch_add(1, Ordering::SeqCst);
            }
            entries.push_back(FaultEntry {
                seq,
                timestamp: Utc::now(),
                message: message.clone(),
                context: context.map(str::to_string),
            });
            seq
        };

        match context {
            Some(ctx) => error!(seq, context = ctx, "{}", message),
            None => error!(seq, "{}", message),
        }
        Some(seq)
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<FaultEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.log.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.log.evicted.load(Ordering::SeqCst)
    }

    pub fn recovered(&self) -> u64 {
        self.log.recovered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sequence_ids_increase() {
        let faults = FaultReporter::new(8);
        let a = faults.report(&anyhow::anyhow!("first"), None).unwrap();
        let b = faults
            .report(&anyhow::anyhow!("second"), Some("dispatch"))
            .unwrap();
        assert!(b > a);
        let entries = faults.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].context.as_deref(), Some("dispatch"));
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let faults = FaultReporter::new(3);
        for i in 0..5 {
            faults.report_message(&format!("fault {}", i), None);
        }
        let messages: Vec<String> = faults.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["fault 2", "fault 3", "fault 4"]);
        assert_eq!(faults.evicted(), 2);
    }

    #[test]
    fn test_clear() {
        let faults = FaultReporter::default();
        faults.report_message("x", None);
        faults.clear();
        assert_eq!(faults.count(), 0);
    }

    #[test]
    fn test_context_chain_is_kept() {
        let faults = FaultReporter::default();
        let err = anyhow::anyhow!("write failed").context("key down A");
        faults.report(&err, None);
        assert_eq!(faults.entries()[0].message, "key down A: write failed");
    }

    #[test]
    fn test_concurrent_reports() {
        let faults = FaultReporter::new(1000);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let faults = faults.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        faults.report_message(&format!("{}-{}", t, i), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut seqs: Vec<u64> = faults.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs.len(), 200);
        seqs.sort();
        seqs.dedup();
        assert_eq!(seqs.len(), 200);
        assert_eq!(faults.lost(), 0);
    }

    #[test]
    fn test_reporting_recovers_from_poisoned_log() {
        let faults = FaultReporter::new(8);
        faults.report_message("before", None);

        let holder = faults.clone();
        let _ = thread::spawn(move || {
            let _entries = holder.log.entries.lock().unwrap();
            panic!("subscriber panicked mid-report");
        })
        .join();
        assert!(faults.log.entries.is_poisoned());

        assert!(faults.report_message("after", None).is_some());
        assert_eq!(faults.count(), 2);
        assert_eq!(faults.recovered(), 1);
        assert!(!faults.log.entries.is_poisoned());
    }
}
