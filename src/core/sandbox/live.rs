use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};

/// Per-task cap on retained stdout lines.
pub const LIVE_OUTPUT_CAP: usize = 50;

/// Process-wide map task-id → bounded ring of recent stdout lines.
///
/// Single writer per task (the executor's reader thread), many readers
/// (the status-update loop). Entries are created when execution starts and
/// removed when the execute stage ends, so the map never outlives a task.
fn live_map() -> &'static Mutex<HashMap<String, VecDeque<String>>> {
    static LIVE: OnceLock<Mutex<HashMap<String, VecDeque<String>>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn push_line(task_id: &str, line: &str) {
    let mut map = live_map().lock().unwrap();
    let ring = map.entry(task_id.to_string()).or_default();
    ring.push_back(line.to_string());
    while ring.len() > LIVE_OUTPUT_CAP {
        ring.pop_front();
    }
}

/// Last `n` lines of recent output for a task, oldest first.
pub fn tail(task_id: &str, n: usize) -> Vec<String> {
    let map = live_map().lock().unwrap();
    match map.get(task_id) {
        Some(ring) => {
            let skip = ring.len().saturating_sub(n);
            ring.iter().skip(skip).cloned().collect()
        }
        None => Vec::new(),
    }
}

/// Drop the buffer for a finished task.
pub fn clear(task_id: &str) {
    live_map().lock().unwrap().remove(task_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_lines_in_order() {
        let id = "live-test-order";
        for i in 0..5 {
            push_line(id, &format!("line {i}"));
        }
        assert_eq!(tail(id, 3), vec!["line 2", "line 3", "line 4"]);
        clear(id);
    }

    #[test]
    fn ring_is_bounded_at_the_cap() {
        let id = "live-test-cap";
        let total = LIVE_OUTPUT_CAP * 3;
        for i in 0..total {
            push_line(id, &format!("line {i}"));
        }
        let all = tail(id, usize::MAX);
        assert_eq!(all.len(), LIVE_OUTPUT_CAP);
        // The retained lines are exactly the last `cap` pushed.
        assert_eq!(all[0], format!("line {}", total - LIVE_OUTPUT_CAP));
        assert_eq!(all[all.len() - 1], format!("line {}", total - 1));
        clear(id);
    }

    #[test]
    fn cleared_task_has_no_tail() {
        let id = "live-test-clear";
        push_line(id, "something");
        clear(id);
        assert!(tail(id, 10).is_empty());
    }

    #[test]
    fn unknown_task_yields_empty_tail() {
        assert!(tail("never-seen", 3).is_empty());
    }
}
