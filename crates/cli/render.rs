//! Plain-text tables for command output.

use chrono::{DateTime, Utc};

use queuectl_core::{Job, QueueStatus};

const ERROR_PREVIEW_CHARS: usize = 80;

/// Column-aligned text table.
pub struct Table {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&'static str]) -> Self {
        Self {
            headers: headers.to_vec(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let header: Vec<String> = self.headers.iter().map(|h| h.to_string()).collect();
        let mut out = format_row(&header, &widths);
        out.push('\n');
        out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1)));
        for row in &self.rows {
            out.push('\n');
            out.push_str(&format_row(row, &widths));
        }
        out
    }
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    let last = widths.len().saturating_sub(1);
    let mut line = String::new();
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if i == last {
            line.push_str(cell);
        } else {
            line.push_str(&format!("{:<width$}  ", cell, width = width));
        }
    }
    line.trim_end().to_string()
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn preview(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    match first_line.char_indices().nth(ERROR_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &first_line[..idx]),
        None => first_line.to_string(),
    }
}

pub fn jobs_table(jobs: &[Job]) -> String {
    let mut table = Table::new(&[
        "ID", "STATE", "ATTEMPTS", "MAX", "PRIORITY", "NEXT RUN", "UPDATED", "COMMAND",
    ]);
    for job in jobs {
        table.push(vec![
            job.id.clone(),
            job.state.to_string(),
            job.attempts.to_string(),
            job.max_retries.to_string(),
            job.priority.to_string(),
            timestamp(job.next_run_at),
            timestamp(job.updated_at),
            job.command.clone(),
        ]);
    }
    table.render()
}

pub fn dead_jobs_table(jobs: &[Job]) -> String {
    let mut table = Table::new(&["ID", "ATTEMPTS", "MAX", "UPDATED", "LAST ERROR"]);
    for job in jobs {
        table.push(vec![
            job.id.clone(),
            job.attempts.to_string(),
            job.max_retries.to_string(),
            timestamp(job.updated_at),
            preview(job.last_error.as_deref().unwrap_or("")),
        ]);
    }
    table.render()
}

pub fn status_tables(status: &QueueStatus) -> String {
    let mut counts = Table::new(&["STATE", "COUNT"]);
    for (state, count) in status.counts.iter() {
        counts.push(vec![state.to_string(), count.to_string()]);
    }
    counts.push(vec!["total".to_string(), status.counts.total().to_string()]);

    let mut workers = Table::new(&["WORKER", "PID", "HOST", "STARTED"]);
    for worker in &status.workers {
        workers.push(vec![
            worker.id.clone(),
            worker.pid.to_string(),
            worker.host.clone(),
            timestamp(worker.started_at),
        ]);
    }

    format!(
        "Jobs\n{}\n\nActive workers ({})\n{}",
        counts.render(),
        status.workers.len(),
        workers.render()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use queuectl_core::{JobState, NewJob, StateCounts, WorkerRecord};

    #[test]
    fn test_table_aligns_columns() {
        let mut table = Table::new(&["ID", "STATE"]);
        table.push(vec!["job-long-id".to_string(), "pending".to_string()]);
        table.push(vec!["j2".to_string(), "dead".to_string()]);

        let rendered = table.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], format!("{:<11}  STATE", "ID"));
        assert_eq!(lines[1], "-".repeat(20));
        assert_eq!(lines[2], "job-long-id  pending");
        assert_eq!(lines[3], format!("{:<11}  dead", "j2"));
    }

    #[test]
    fn test_preview_truncates_first_line() {
        assert_eq!(preview("boom\ntrace"), "boom");
        let long = "x".repeat(100);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(80)));
    }

    #[test]
    fn test_jobs_table_lists_fields() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let job = NewJob::new("job1", "echo hi")
            .priority(7)
            .into_job(3, now)
            .unwrap();

        let rendered = jobs_table(&[job]);
        let row = rendered.lines().nth(2).unwrap();
        assert!(row.starts_with("job1"));
        assert!(row.contains("pending"));
        assert!(row.contains("2024-01-02 03:04:05"));
        assert!(row.ends_with("echo hi"));
    }

    #[test]
    fn test_status_tables() {
        let mut counts = StateCounts::default();
        counts.add(JobState::Pending, 2);
        counts.add(JobState::Dead, 1);
        let status = QueueStatus {
            counts,
            workers: vec![WorkerRecord {
                id: "w-1".to_string(),
                pid: 42,
                host: "box".to_string(),
                started_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            }],
        };

        let rendered = status_tables(&status);
        assert!(rendered.contains(&format!("{:<10}  2", "pending")));
        assert!(rendered.contains(&format!("{:<10}  3", "total")));
        assert!(rendered.contains("Active workers (1)"));
        assert!(rendered.contains("w-1     42   box"));
    }
}
