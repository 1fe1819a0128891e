use std::collections::VecDeque;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tauri::{AppHandle, Emitter, Runtime};

use crate::core::events::EVENT_LOGS_UPDATED;

const LOG_CAPACITY: usize = 512;

static LOG_BUFFER: Lazy<RwLock<VecDeque<String>>> =
    Lazy::new(|| RwLock::new(VecDeque::with_capacity(LOG_CAPACITY)));

pub fn push_log(line: impl Into<String>) {
    let mut buffer = LOG_BUFFER.write();
    if buffer.len() >= LOG_CAPACITY {
        buffer.pop_front();
    }
    buffer.push_back(line.into());
}

pub fn snapshot() -> Vec<String> {
    LOG_BUFFER.read().iter().cloned().collect()
}

pub fn broadcast_logs<R: Runtime>(app: &AppHandle<R>) {
    let _ = app.emit(EVENT_LOGS_UPDATED, snapshot());
}

pub fn initialize<R: Runtime>(app: &AppHandle<R>) {
    push_log("Log viewer initialized");
    let handle = app.clone();
    tauri::async_runtime::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            broadcast_logs(&handle);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_past_capacity() {
        for index in 0..(LOG_CAPACITY + 8) {
            push_log(format!("line {index}"));
        }
        let lines = snapshot();
        assert_eq!(lines.len(), LOG_CAPACITY);
        assert!(lines.last().unwrap().contains(&format!("{}", LOG_CAPACITY + 7)));
    }
}
