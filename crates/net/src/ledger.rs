//! Transactional wallet sync.
//!
//! Mutations are queued as [`WalletChange`]s. A flush folds the queue into a
//! single delta (a later `Set` overrides an earlier one, `Unset` never
//! overrides) and ships it together with a full snapshot of the current
//! values. The queue is always cleared on flush.

use crate::bitstream::{BitReader, BitWriter, DecodeError};
use hullsync_core::EntityId;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Reward distribution is a percentage.
pub const MAX_REWARD_DISTRIBUTION: i32 = 100;

/// A field that either changed to a value or did not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Delta<T> {
    /// No change.
    #[default]
    Unset,
    /// Changed to this value.
    Set(T),
}

impl<T: Copy> Delta<T> {
    /// Fold a later delta into this one.
    pub fn merge(self, later: Delta<T>) -> Delta<T> {
        match later {
            Delta::Set(value) => Delta::Set(value),
            Delta::Unset => self,
        }
    }

    /// Value if set.
    pub fn value(self) -> Option<T> {
        match self {
            Delta::Set(value) => Some(value),
            Delta::Unset => None,
        }
    }

    /// Whether the field changed.
    pub fn is_set(self) -> bool {
        matches!(self, Delta::Set(_))
    }
}

/// One queued wallet mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalletChange {
    /// New balance.
    pub balance: Delta<i32>,
    /// New reward distribution percentage.
    pub reward_distribution: Delta<i32>,
}

impl WalletChange {
    /// Change touching only the balance.
    pub fn balance(value: i32) -> Self {
        Self {
            balance: Delta::Set(value),
            ..Self::default()
        }
    }

    /// Fold a later change into this one.
    pub fn merge(self, later: WalletChange) -> WalletChange {
        WalletChange {
            balance: self.balance.merge(later.balance),
            reward_distribution: self.reward_distribution.merge(later.reward_distribution),
        }
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        !self.balance.is_set() && !self.reward_distribution.is_set()
    }
}

/// Fold a sequence of changes, oldest first.
pub fn fold_changes<I: IntoIterator<Item = WalletChange>>(changes: I) -> WalletChange {
    changes
        .into_iter()
        .fold(WalletChange::default(), WalletChange::merge)
}

/// Current wallet values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalletSnapshot {
    /// Balance.
    pub balance: i32,
    /// Reward distribution percentage.
    pub reward_distribution: i32,
}

/// Outbound ledger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletSyncMessage {
    /// Owning character, `None` for the shared bank.
    pub owner: Option<EntityId>,
    /// Merged delta.
    pub delta: WalletChange,
    /// Values after the delta.
    pub snapshot: WalletSnapshot,
}

impl WalletSyncMessage {
    /// Encode the message.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BitWriter::new();
        writer.write_bool(self.owner.is_some());
        if let Some(owner) = self.owner {
            writer.write_u16(owner.0);
        }
        writer.write_bool(self.delta.balance.is_set());
        if let Delta::Set(balance) = self.delta.balance {
            writer.write_i32(balance);
        }
        writer.write_bool(self.delta.reward_distribution.is_set());
        if let Delta::Set(reward) = self.delta.reward_distribution {
            writer.write_ranged_integer(reward, 0, MAX_REWARD_DISTRIBUTION);
        }
        writer.write_i32(self.snapshot.balance);
        writer.write_ranged_integer(self.snapshot.reward_distribution, 0, MAX_REWARD_DISTRIBUTION);
        writer.write_pad_bits();
        writer.into_bytes()
    }

    /// Decode a message.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BitReader::new(bytes);
        let owner = if reader.read_bool()? {
            Some(EntityId(reader.read_u16()?))
        } else {
            None
        };
        let balance = if reader.read_bool()? {
            Delta::Set(reader.read_i32()?)
        } else {
            Delta::Unset
        };
        let reward_distribution = if reader.read_bool()? {
            Delta::Set(reader.read_ranged_integer(0, MAX_REWARD_DISTRIBUTION)?)
        } else {
            Delta::Unset
        };
        let snapshot = WalletSnapshot {
            balance: reader.read_i32()?,
            reward_distribution: reader.read_ranged_integer(0, MAX_REWARD_DISTRIBUTION)?,
        };
        reader.read_pad_bits();
        Ok(Self {
            owner,
            delta: WalletChange {
                balance,
                reward_distribution,
            },
            snapshot,
        })
    }
}

#[derive(Debug, Default)]
struct WalletInner {
    values: WalletSnapshot,
    pending: VecDeque<WalletChange>,
}

/// A wallet and its pending change queue.
///
/// Enqueue and flush take the same lock, so a flush never interleaves with
/// a mutation.
#[derive(Debug, Default)]
pub struct Wallet {
    owner: Option<EntityId>,
    inner: Mutex<WalletInner>,
}

impl Wallet {
    /// Empty wallet for `owner` (`None` for the shared bank).
    pub fn new(owner: Option<EntityId>) -> Self {
        Self {
            owner,
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WalletInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Owning character.
    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    /// Current values.
    pub fn snapshot(&self) -> WalletSnapshot {
        self.lock().values
    }

    /// Set the balance and queue the change.
    pub fn set_balance(&self, balance: i32) {
        self.enqueue(WalletChange::balance(balance));
    }

    /// Add to the balance (saturating) and queue the resulting value.
    pub fn add_balance(&self, amount: i32) -> i32 {
        let mut inner = self.lock();
        let balance = inner.values.balance.saturating_add(amount);
        inner.values.balance = balance;
        inner.pending.push_back(WalletChange::balance(balance));
        balance
    }

    /// Set the reward distribution (clamped to a percentage) and queue it.
    pub fn set_reward_distribution(&self, percent: i32) {
        self.enqueue(WalletChange {
            reward_distribution: Delta::Set(percent.clamp(0, MAX_REWARD_DISTRIBUTION)),
            ..WalletChange::default()
        });
    }

    /// Apply a change to the current values and queue it.
    pub fn enqueue(&self, change: WalletChange) {
        let mut inner = self.lock();
        if let Delta::Set(balance) = change.balance {
            inner.values.balance = balance;
        }
        if let Delta::Set(reward) = change.reward_distribution {
            inner.values.reward_distribution = reward;
        }
        inner.pending.push_back(change);
    }

    /// Queue a zero-valued change so the next flush always syncs.
    ///
    /// The zero `Set`s override anything queued earlier in the same flush, so
    /// the delta of that flush may read zero. Receivers must take the values
    /// from [`WalletSyncMessage::snapshot`], never from the delta.
    pub fn force_update(&self) {
        self.lock().pending.push_back(WalletChange {
            balance: Delta::Set(0),
            reward_distribution: Delta::Set(0),
        });
    }

    /// Number of queued changes.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Drain the queue into one message. `None` when nothing was queued.
    pub fn flush(&self) -> Option<WalletSyncMessage> {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            return None;
        }
        let delta = fold_changes(inner.pending.drain(..));
        Some(WalletSyncMessage {
            owner: self.owner,
            delta,
            snapshot: inner.values,
        })
    }
}
