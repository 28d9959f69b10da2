//! The channel endpoint: the three operations (`write`, `read`/`readline`,
//! `close`) a host controller actually drives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, QueueError};
use crate::queue::BoundedQueue;

/// `write(bytes)`. `on_emergency_stop` is invoked (and the payload
/// discarded without enqueuing) when `M112` appears and emergency-stop
/// support is enabled.
pub fn write(
    rx: &BoundedQueue<String>,
    drop_connection: &AtomicBool,
    write_timeout: f64,
    support_m112: bool,
    data: &str,
    on_emergency_stop: impl FnOnce(),
) -> Result<(), Error> {
    if drop_connection.load(Ordering::SeqCst) {
        return Err(Error::Timeout);
    }

    if rx.is_closed() {
        return Ok(());
    }

    if support_m112 && data.contains("M112") {
        log::info!("M112 received, triggering emergency stop");
        on_emergency_stop();
        return Ok(());
    }

    match rx.put(data.to_string(), true, Some(write_timeout)) {
        Ok(()) => Ok(()),
        Err(QueueError::Closed) => Ok(()),
        Err(QueueError::Full) => Err(Error::Timeout),
        Err(e) => Err(Error::Queue(e)),
    }
}

/// `read(size)` / `readline()`: both dequeue one response line, append the
/// newline terminator, and sleep `throttle` seconds to simulate baud-rate
/// pacing.
pub fn read(
    tx: &BoundedQueue<String>,
    drop_connection: &AtomicBool,
    read_timeout: f64,
    throttle: f64,
) -> Result<String, Error> {
    if drop_connection.load(Ordering::SeqCst) {
        return Err(Error::Timeout);
    }

    match tx.get(Duration::from_secs_f64(read_timeout)) {
        Ok(mut line) => {
            line.push('\n');
            std::thread::sleep(Duration::from_secs_f64(throttle));
            Ok(line)
        }
        Err(QueueError::Empty) => Ok(String::new()),
        Err(QueueError::Closed) => Ok(String::new()),
        Err(e) => Err(Error::Queue(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_enqueues_into_rx() {
        let rx = BoundedQueue::new(64, str::len);
        let drop = AtomicBool::new(false);
        write(&rx, &drop, 1.0, true, "G1 X1\n", || panic!("no kill expected")).unwrap();
        assert_eq!(rx.occupied(), 6);
    }

    #[test]
    fn m112_triggers_kill_without_enqueuing() {
        let rx = BoundedQueue::new(64, str::len);
        let drop = AtomicBool::new(false);
        let mut killed = false;
        write(&rx, &drop, 1.0, true, "M112\n", || killed = true).unwrap();
        assert!(killed);
        assert_eq!(rx.occupied(), 0);
    }

    #[test]
    fn drop_connection_fails_write_and_read() {
        let rx = BoundedQueue::new(64, str::len);
        let tx = BoundedQueue::unbounded();
        let drop = AtomicBool::new(true);
        assert!(matches!(
            write(&rx, &drop, 1.0, true, "G1\n", || {}),
            Err(Error::Timeout)
        ));
        assert!(matches!(
            read(&tx, &drop, 0.01, 0.0),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn read_appends_newline_and_throttles() {
        let tx: BoundedQueue<String> = BoundedQueue::unbounded();
        tx.put("ok".to_string(), true, None).unwrap();
        let drop = AtomicBool::new(false);
        let line = read(&tx, &drop, 1.0, 0.0).unwrap();
        assert_eq!(line, "ok\n");
    }

    #[test]
    fn read_times_out_to_empty_string() {
        let tx: BoundedQueue<String> = BoundedQueue::unbounded();
        let drop = AtomicBool::new(false);
        let line = read(&tx, &drop, 0.01, 0.0).unwrap();
        assert_eq!(line, "");
    }
}
