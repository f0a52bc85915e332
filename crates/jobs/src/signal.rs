use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Manual-reset event: stays set until cleared, wakes every waiter on `set`.
#[derive(Debug, Default)]
pub struct Signal {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub fn new(initially_set: bool) -> Self {
        Self {
            flag: Mutex::new(initially_set),
            condvar: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.condvar.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Blocks until set or `timeout` elapses. Returns the flag value.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.condvar.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        *flag
    }
}
