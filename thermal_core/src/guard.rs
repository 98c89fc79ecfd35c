//! Scoped exclusion of the sampling cadence.
//!
//! Creating a guard disables the cadence and takes the manager lock; dropping
//! it restores the previous enable state. Guards must not be nested on the
//! same thread.

use std::ops::{Deref, DerefMut};
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cadence::Cadence;
use crate::manager::TempMgr;

pub struct CadenceGuard<'a> {
    mgr: MutexGuard<'a, TempMgr>,
    enabled: &'a AtomicBool,
    prev: bool,
}

impl<'a> CadenceGuard<'a> {
    pub(crate) fn new(cadence: &'a Cadence) -> Self {
        let enabled = cadence.enabled_flag();
        let prev = enabled.swap(false, Ordering::AcqRel);
        let mgr = cadence.lock();
        Self { mgr, enabled, prev }
    }
}

impl Deref for CadenceGuard<'_> {
    type Target = TempMgr;

    fn deref(&self) -> &TempMgr {
        &self.mgr
    }
}

impl DerefMut for CadenceGuard<'_> {
    fn deref_mut(&mut self) -> &mut TempMgr {
        &mut self.mgr
    }
}

impl Drop for CadenceGuard<'_> {
    fn drop(&mut self) {
        self.enabled.store(self.prev, Ordering::Release);
    }
}
