// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Outcome of one actor loop iteration.
pub enum Flow {
    Continue,
    Exit,
}

/// Counter of fire-and-forget bus operations still in flight.
///
/// The process may only finish its exit-teardown once this reaches zero.
/// Every RPC issue site takes a guard and holds it across all legs of the
/// operation; completion (or abandonment) drops it.
#[derive(Clone, Default)]
pub struct AsyncOps(Arc<AtomicI64>);

impl AsyncOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> AsyncOpGuard {
        let pending = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > 2 {
            log::warn!("suspicious number of pending async operations ({pending})");
        }

        AsyncOpGuard(self.0.clone())
    }

    pub fn idle(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 0
    }
}

pub struct AsyncOpGuard(Arc<AtomicI64>);

impl Drop for AsyncOpGuard {
    fn drop(&mut self) {
        if self.0.fetch_sub(1, Ordering::SeqCst) - 1 < 0 {
            log::error!("BUG: async operation counter went negative");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guards_balance_the_counter() {
        let ops = AsyncOps::new();
        assert!(ops.idle());

        let first = ops.begin();
        let second = ops.begin();
        assert!(!ops.idle());

        drop(first);
        assert!(!ops.idle());

        drop(second);
        assert!(ops.idle());
    }
}
