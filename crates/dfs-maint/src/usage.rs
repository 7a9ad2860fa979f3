//! Per-directory usage above a size floor.

use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::fs::{FileSystem, SizeEntry};
use crate::report::{AuditEvent, Reporter};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Inputs of one usage report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageQuery {
    pub root: String,
    /// Children must be strictly larger than this to be reported.
    pub min_size_bytes: u64,
    pub human_readable: bool,
    pub total: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UsageStatus {
    Found,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub root: String,
    pub status: UsageStatus,
    pub entries: Vec<SizeEntry>,
    pub total: u64,
    /// Children whose size could not be read.
    pub errors: usize,
}

pub struct UsageAggregator {
    fs: Arc<dyn FileSystem>,
    reporter: Arc<dyn Reporter>,
}

impl UsageAggregator {
    pub fn new(fs: Arc<dyn FileSystem>, reporter: Arc<dyn Reporter>) -> Self {
        Self { fs, reporter }
    }

    /// Sizes every immediate child of `root` and keeps those above the floor.
    pub async fn aggregate(&self, root: &str, min_size_bytes: u64) -> Result<UsageReport> {
        let mut report = UsageReport {
            root: root.to_string(),
            status: UsageStatus::NotFound,
            entries: Vec::new(),
            total: 0,
            errors: 0,
        };
        if !self.fs.exists(root).await? {
            self.reporter.report(AuditEvent::RootNotFound {
                path: root.to_string(),
            });
            return Ok(report);
        }
        report.status = UsageStatus::Found;

        let children = self.fs.list(&[root.to_string()], false).await?;
        for child in children {
            let sizes = match self.fs.size(&[child.path.clone()], true, false).await {
                Ok(sizes) => sizes,
                Err(e) => {
                    self.reporter.report(AuditEvent::SizeFailed {
                        path: child.path.clone(),
                        reason: e.to_string(),
                    });
                    report.errors += 1;
                    continue;
                }
            };
            for size in sizes {
                if size.length > min_size_bytes {
                    report.total += size.length;
                    report.entries.push(size);
                }
            }
        }
        Ok(report)
    }
}

/// Bytes as binary gigabytes with two decimals, e.g. `12.50 G`.
pub fn format_gib(bytes: u64) -> String {
    format!("{:.2} G", bytes as f64 / GIB as f64)
}

/// Output lines for a report, shaped by the query's display flags.
pub fn render(report: &UsageReport, query: &UsageQuery) -> Vec<String> {
    if report.status == UsageStatus::NotFound {
        return vec![format!("{} is not found", report.root)];
    }

    let mut lines: Vec<String> = report
        .entries
        .iter()
        .map(|entry| {
            if query.human_readable {
                format!("{} {}", entry.path, format_gib(entry.length))
            } else {
                format!("{} {}", entry.path, entry.length)
            }
        })
        .collect();

    if query.total {
        if query.human_readable {
            lines.push(format!("total: {}", format_gib(report.total)));
        } else {
            lines.push(format!("total: {} bytes", report.total));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemoryFs, RecordingReporter};
    use chrono::Utc;

    fn aggregator(fs: MemoryFs) -> UsageAggregator {
        UsageAggregator::new(Arc::new(fs), Arc::new(RecordingReporter::new()))
    }

    fn query(root: &str, human: bool, total: bool) -> UsageQuery {
        UsageQuery {
            root: root.to_string(),
            min_size_bytes: 0,
            human_readable: human,
            total,
        }
    }

    #[tokio::test]
    async fn floor_filters_report_and_total() {
        let fs = MemoryFs::new()
            .with_file("/data/a", Utc::now(), 5 * GIB)
            .with_file("/data/b", Utc::now(), 15 * GIB)
            .with_file("/data/c", Utc::now(), GIB / 2);

        let report = aggregator(fs).aggregate("/data", 10 * GIB).await.unwrap();
        assert_eq!(report.status, UsageStatus::Found);
        assert_eq!(
            report.entries,
            vec![SizeEntry { path: "/data/b".into(), length: 15 * GIB }]
        );
        assert_eq!(report.total, 15 * GIB);
    }

    #[tokio::test]
    async fn child_directories_are_sized_recursively() {
        let fs = MemoryFs::new()
            .with_dir("/data/logs", Utc::now())
            .with_file("/data/logs/2024/a", Utc::now(), 300)
            .with_file("/data/logs/2024/b", Utc::now(), 200)
            .with_file("/data/small", Utc::now(), 10);

        let report = aggregator(fs).aggregate("/data", 100).await.unwrap();
        assert_eq!(
            report.entries,
            vec![SizeEntry { path: "/data/logs".into(), length: 500 }]
        );
        assert_eq!(report.total, 500);
    }

    #[tokio::test]
    async fn size_at_floor_is_excluded() {
        let fs = MemoryFs::new().with_file("/data/a", Utc::now(), 100);
        let report = aggregator(fs).aggregate("/data", 100).await.unwrap();
        assert!(report.entries.is_empty());
        assert_eq!(report.total, 0);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let report = aggregator(MemoryFs::new()).aggregate("/nope", 0).await.unwrap();
        assert_eq!(report.status, UsageStatus::NotFound);
        assert_eq!(render(&report, &query("/nope", false, true)), vec!["/nope is not found"]);
    }

    #[tokio::test]
    async fn empty_root_is_found_with_zero_total() {
        let fs = MemoryFs::new().with_dir("/empty", Utc::now());
        let report = aggregator(fs).aggregate("/empty", 0).await.unwrap();
        assert_eq!(report.status, UsageStatus::Found);
        assert_eq!(render(&report, &query("/empty", false, true)), vec!["total: 0 bytes"]);
    }

    #[tokio::test]
    async fn unsizable_child_is_counted_and_skipped() {
        let fs = MemoryFs::new()
            .with_file("/data/a", Utc::now(), 10)
            .with_file("/data/b", Utc::now(), 20)
            .unsizable("/data/a");
        let report = aggregator(fs).aggregate("/data", 0).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.total, 20);
    }

    #[test]
    fn human_total_uses_running_sum() {
        let report = UsageReport {
            root: "/data".into(),
            status: UsageStatus::Found,
            entries: vec![
                SizeEntry { path: "/data/a".into(), length: 20 * GIB },
                SizeEntry { path: "/data/b".into(), length: 12 * GIB + GIB / 2 },
            ],
            total: 32 * GIB + GIB / 2,
            errors: 0,
        };
        assert_eq!(
            render(&report, &query("/data", true, true)),
            vec!["/data/a 20.00 G", "/data/b 12.50 G", "total: 32.50 G"]
        );
        assert_eq!(
            render(&report, &query("/data", false, false)),
            vec![
                format!("/data/a {}", 20 * GIB),
                format!("/data/b {}", 12 * GIB + GIB / 2)
            ]
        );
    }
}
