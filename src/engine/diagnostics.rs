use std::fmt::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub name: String,
    pub start: Instant,
    pub duration: Duration,
    pub failed: bool,
}

/// Execution metrics of one run.
///
/// Every spawned task records when it started running (after any throttle
/// permit was granted) and how long it took, including time spent blocked on
/// references and nested branches.
#[derive(Debug, Default)]
pub struct Diagnostics {
    executions: Mutex<Vec<TaskExecution>>,
}

impl Diagnostics {
    pub(crate) fn record(&self, execution: TaskExecution) {
        self.executions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(execution);
    }

    /// Recorded executions ordered by start time.
    pub fn executions(&self) -> Vec<TaskExecution> {
        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        executions.sort_by_key(|t| t.start);
        executions
    }

    /// Renders a plain-text waterfall chart, one row per task.
    pub fn render_waterfall(&self) -> String {
        const WIDTH: f64 = 40.0;

        let executions = self.executions();
        let Some(first) = executions.first() else {
            return "no tasks ran\n".to_string();
        };

        let global_start = first.start;
        let global_end = executions
            .iter()
            .map(|t| t.start + t.duration)
            .max()
            .unwrap_or(global_start);
        // Never divide by zero
        let total = global_end.duration_since(global_start).as_micros().max(1) as f64;

        let label = executions
            .iter()
            .map(|t| display_name(&t.name).len())
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        for t in &executions {
            let offset = t.start.duration_since(global_start).as_micros() as f64;
            let lead = (offset / total * WIDTH).round() as usize;
            let span = ((t.duration.as_micros() as f64 / total * WIDTH).round() as usize).max(1);
            let mark = if t.failed { 'x' } else { '#' };

            let _ = writeln!(
                out,
                "{:<label$} |{}{}{}| {}",
                display_name(&t.name),
                " ".repeat(lead.min(WIDTH as usize)),
                mark.to_string().repeat(span),
                " ".repeat((WIDTH as usize).saturating_sub(lead + span)),
                format_duration(t.duration),
            );
        }

        out
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() { "$" } else { name }
}

fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros() as f64;
    if micros < 1000.0 {
        format!("{:.0}µs", micros)
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(Diagnostics::default().render_waterfall(), "no tasks ran\n");
    }

    #[test]
    fn test_rows_sorted_by_start() {
        let diagnostics = Diagnostics::default();
        let start = Instant::now();

        diagnostics.record(TaskExecution {
            name: "b".into(),
            start: start + Duration::from_millis(5),
            duration: Duration::from_millis(5),
            failed: true,
        });
        diagnostics.record(TaskExecution {
            name: "a".into(),
            start,
            duration: Duration::from_millis(10),
            failed: false,
        });

        let names: Vec<_> = diagnostics.executions().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        let chart = diagnostics.render_waterfall();
        let lines: Vec<_> = chart.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("a |#"));
        assert!(lines[1].contains('x'));
    }
}
