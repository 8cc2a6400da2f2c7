//! Start gate for load-test clients.
//!
//! A [`StartLatch`] counts down once per participant and opens when the
//! count reaches zero. A client that fails before it gets to the gate
//! drops its [`StartTicket`], which counts it down anyway, so the others
//! are never left waiting on it.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct StartLatch {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    remaining: Mutex<usize>,
    released: watch::Sender<bool>,
}

impl StartLatch {
    pub fn new(participants: usize) -> Self {
        let (released, _) = watch::channel(participants == 0);
        Self {
            inner: Arc::new(Inner {
                remaining: Mutex::new(participants),
                released,
            }),
        }
    }

    /// Hands out one participant's ticket. Issue exactly as many tickets as
    /// the latch was created for.
    pub fn ticket(&self) -> StartTicket {
        StartTicket {
            latch: self.clone(),
            arrived: false,
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self
            .inner
            .remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.inner.released.send_replace(true);
        }
    }

    pub fn remaining(&self) -> usize {
        *self
            .inner
            .remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_released(&self) -> bool {
        *self.inner.released.borrow()
    }

    async fn wait(&self) {
        let mut released = self.inner.released.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = released.wait_for(|open| *open).await;
    }
}

/// One participant's place at the gate.
#[derive(Debug)]
pub struct StartTicket {
    latch: StartLatch,
    arrived: bool,
}

impl StartTicket {
    /// Counts this participant in and waits until everybody has.
    pub async fn arrive_and_wait(mut self) {
        self.arrived = true;
        self.latch.count_down();
        self.latch.wait().await;
    }
}

impl Drop for StartTicket {
    fn drop(&mut self) {
        if !self.arrived {
            self.latch.count_down();
        }
    }
}
