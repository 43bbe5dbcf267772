use std::thread;
use std::time::{Duration, Instant};

use crate::types::CancelToken;

const SLICE: Duration = Duration::from_millis(20);

/// Sleep for exact milliseconds.
pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// Sleep for `dur`, waking early if `cancel` fires. Returns false when cancelled.
pub fn sleep_cancellable(dur: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + dur;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_when_not_cancelled() {
        assert!(sleep_cancellable(Duration::from_millis(30), &CancelToken::new()));
    }

    #[test]
    fn returns_early_on_cancel() {
        let token = CancelToken::new();
        let t = token.clone();
        let h = thread::spawn(move || {
            sleep_ms(30);
            t.cancel();
        });
        let start = Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(10), &token));
        assert!(start.elapsed() < Duration::from_secs(5));
        h.join().unwrap();
    }
}
