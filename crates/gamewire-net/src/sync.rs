//! Atomic state cells and lock helpers shared by the connection machinery.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A small state enum that can live in an [`AtomicU8`].
pub trait AtomicState: Copy + Eq {
    /// Encode the state.
    fn to_u8(self) -> u8;
    /// Decode a value previously produced by [`AtomicState::to_u8`].
    fn from_u8(value: u8) -> Self;
}

/// Lock-free state cell with compare-and-swap transitions.
///
/// Every transition reports the previous state so callers can log why a
/// competing transition was skipped.
pub struct SyncState<S: AtomicState> {
    value: AtomicU8,
    _state: PhantomData<S>,
}

impl<S: AtomicState> SyncState<S> {
    /// Create a cell holding `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            value: AtomicU8::new(initial.to_u8()),
            _state: PhantomData,
        }
    }

    /// Current state.
    pub fn get(&self) -> S {
        S::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Whether the current state equals `state`.
    pub fn is(&self, state: S) -> bool {
        self.get() == state
    }

    /// Unconditionally store `state`, returning the previous one.
    pub fn set(&self, state: S) -> S {
        S::from_u8(self.value.swap(state.to_u8(), Ordering::AcqRel))
    }

    /// Move from exactly `from` to `to`.
    pub fn transition(&self, from: S, to: S) -> Result<S, S> {
        self.value
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(S::from_u8)
            .map_err(S::from_u8)
    }

    /// Move to `to` when the current state is one of `from`.
    ///
    /// `Err` carries the state that blocked the transition.
    pub fn transition_from_any(&self, from: &[S], to: S) -> Result<S, S> {
        let to_raw = to.to_u8();
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                from.contains(&S::from_u8(raw)).then_some(to_raw)
            })
            .map(S::from_u8)
            .map_err(S::from_u8)
    }
}

impl<S: AtomicState + std::fmt::Debug> std::fmt::Debug for SyncState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.get())
    }
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read-lock, recovering from poisoning.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write-lock, recovering from poisoning.
pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Off,
        Dimmed,
        On,
    }

    impl AtomicState for Light {
        fn to_u8(self) -> u8 {
            self as u8
        }
        fn from_u8(value: u8) -> Self {
            match value {
                0 => Light::Off,
                1 => Light::Dimmed,
                _ => Light::On,
            }
        }
    }

    #[test]
    fn test_transition_requires_exact_source() {
        let cell = SyncState::new(Light::Off);
        assert_eq!(cell.transition(Light::On, Light::Dimmed), Err(Light::Off));
        assert_eq!(cell.transition(Light::Off, Light::Dimmed), Ok(Light::Off));
    }

    #[test]
    fn test_transition_from_any_accepts_listed_sources() {
        let cell = SyncState::new(Light::Dimmed);
        assert_eq!(
            cell.transition_from_any(&[Light::Off, Light::Dimmed], Light::On),
            Ok(Light::Dimmed)
        );
        assert_eq!(
            cell.transition_from_any(&[Light::Off, Light::Dimmed], Light::Off),
            Err(Light::On)
        );
    }

    #[test]
    fn test_racing_transitions_succeed_once() {
        let cell = std::sync::Arc::new(SyncState::new(Light::On));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = std::sync::Arc::clone(&cell);
                std::thread::spawn(move || {
                    cell.transition_from_any(&[Light::Dimmed, Light::On], Light::Off)
                        .is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1, "Exactly one racer should win the transition");
    }
}
