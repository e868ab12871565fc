//! Voice relay.
//!
//! Each speaking connection owns a [`VoiceQueue`]: a ring of recent encoded
//! frames. On its own cadence, independent of the simulation tick, the relay
//! forwards every queue with new frames to all voice-eligible connections
//! except the owner. Voice rides unreliable delivery; instead of retrying,
//! each packet repeats the retained frames so receivers can fill gaps.
//!
//! Payload (after the `Voice` header byte and queue id):
//! `[latest sequence u16][frame count u8][per frame: length u16, bytes]`.

use crate::bitstream::{BitReader, BitWriter, DecodeError};
use crate::codec::ServerMessage;
use crate::protocol::{MAX_VOICE_FRAMES_PER_PACKET, MAX_VOICE_FRAME_LEN};
use hullsync_core::ConnectionId;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Frames plus the sequence number of the newest one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePayload {
    /// Sequence number of the last frame.
    pub latest_sequence: u16,
    /// Frames, oldest first.
    pub frames: Vec<Vec<u8>>,
}

impl VoicePayload {
    /// Encode the payload.
    pub fn encode(&self) -> Vec<u8> {
        let count = self.frames.len().min(MAX_VOICE_FRAMES_PER_PACKET);
        let frames = &self.frames[self.frames.len() - count..];
        let mut writer = BitWriter::new();
        writer.write_u16(self.latest_sequence);
        writer.write_u8(count as u8);
        for frame in frames {
            let len = frame.len().min(MAX_VOICE_FRAME_LEN);
            writer.write_u16(len as u16);
            writer.write_bytes(&frame[..len]);
        }
        writer.into_bytes()
    }

    /// Decode and validate a payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BitReader::new(bytes);
        let latest_sequence = reader.read_u16()?;
        let count = usize::from(reader.read_u8()?);
        if count > MAX_VOICE_FRAMES_PER_PACKET {
            return Err(DecodeError::LimitExceeded {
                field: "voice frame count",
                len: count,
                max: MAX_VOICE_FRAMES_PER_PACKET,
            });
        }
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = usize::from(reader.read_u16()?);
            if len > MAX_VOICE_FRAME_LEN {
                return Err(DecodeError::LimitExceeded {
                    field: "voice frame",
                    len,
                    max: MAX_VOICE_FRAME_LEN,
                });
            }
            frames.push(reader.read_bytes(len)?);
        }
        Ok(Self {
            latest_sequence,
            frames,
        })
    }
}

/// Ring buffer of one speaker's recent frames.
#[derive(Debug)]
pub struct VoiceQueue {
    id: u8,
    owner: ConnectionId,
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
    latest_sequence: Option<u16>,
    sent_sequence: Option<u16>,
    last_send: Option<Instant>,
    interval: Duration,
    muted: bool,
}

impl VoiceQueue {
    /// Empty queue retaining up to `capacity` frames.
    pub fn new(id: u8, owner: ConnectionId, capacity: usize, interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            owner,
            frames: VecDeque::with_capacity(capacity),
            capacity,
            latest_sequence: None,
            sent_sequence: None,
            last_send: None,
            interval,
            muted: false,
        }
    }

    /// Queue id used on the wire.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Owning connection.
    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    /// Frames currently retained.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are retained.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sequence number of the newest retained frame.
    pub fn latest_sequence(&self) -> Option<u16> {
        self.latest_sequence
    }

    /// Append one frame with the next sequence number.
    pub fn push_frame(&mut self, frame: Vec<u8>) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        self.latest_sequence = Some(self.latest_sequence.map_or(0, |seq| seq.wrapping_add(1)));
    }

    /// Append the frames of an upload that are newer than what we hold.
    pub fn ingest(&mut self, payload: VoicePayload) -> usize {
        let fresh = match self.latest_sequence {
            None => payload.frames.len(),
            Some(latest) => {
                let ahead = payload.latest_sequence.wrapping_sub(latest);
                // Sequences more than half the space behind are stale.
                if ahead == 0 || ahead > u16::MAX / 2 {
                    return 0;
                }
                usize::from(ahead).min(payload.frames.len())
            }
        };
        let skip = payload.frames.len() - fresh;
        for frame in payload.frames.into_iter().skip(skip) {
            if self.frames.len() == self.capacity {
                self.frames.pop_front();
            }
            self.frames.push_back(frame);
        }
        if fresh > 0 {
            self.latest_sequence = Some(payload.latest_sequence);
        }
        fresh
    }

    /// Whether this queue should flush at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.muted || self.latest_sequence.is_none() || self.latest_sequence == self.sent_sequence {
            return false;
        }
        self.last_send
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Retained frames as a payload.
    pub fn payload(&self) -> Option<VoicePayload> {
        let latest_sequence = self.latest_sequence?;
        let skip = self.frames.len().saturating_sub(MAX_VOICE_FRAMES_PER_PACKET);
        Some(VoicePayload {
            latest_sequence,
            frames: self.frames.iter().skip(skip).cloned().collect(),
        })
    }

    fn mark_sent(&mut self, now: Instant) {
        self.last_send = Some(now);
        self.sent_sequence = self.latest_sequence;
    }
}

/// One relayed voice message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSend {
    /// Recipient.
    pub to: ConnectionId,
    /// Message to send unreliably.
    pub message: ServerMessage,
}

fn lock_queue(queue: &Mutex<VoiceQueue>) -> MutexGuard<'_, VoiceQueue> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Callers hold the registry lock, so lookup and insert are one step.
fn owned_by(queues: &BTreeMap<u8, Arc<Mutex<VoiceQueue>>>, owner: ConnectionId) -> Option<u8> {
    queues.values().find_map(|queue| {
        let queue = lock_queue(queue);
        (queue.owner == owner).then_some(queue.id)
    })
}

/// Registry of voice queues, keyed by queue id.
///
/// Queues may be registered and removed while a flush is running; the flush
/// works on a snapshot of the registry.
#[derive(Debug)]
pub struct VoiceRelay {
    queues: RwLock<BTreeMap<u8, Arc<Mutex<VoiceQueue>>>>,
    capacity: usize,
    interval: Duration,
}

impl VoiceRelay {
    /// Relay whose queues retain `capacity` frames and flush at most once
    /// per `interval`.
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            queues: RwLock::new(BTreeMap::new()),
            capacity,
            interval,
        }
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<VoiceQueue>>> {
        let queues = self.queues.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        queues.values().cloned().collect()
    }

    /// Register a queue for `owner`, returning its id.
    ///
    /// Returns the existing id if `owner` already has one and `None` when
    /// every id is taken.
    pub fn register(&self, owner: ConnectionId) -> Option<u8> {
        let mut queues = self.queues.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = owned_by(&queues, owner) {
            return Some(id);
        }
        let id = (0..=u8::MAX).find(|id| !queues.contains_key(id))?;
        queues.insert(
            id,
            Arc::new(Mutex::new(VoiceQueue::new(id, owner, self.capacity, self.interval))),
        );
        debug!(%owner, queue = id, "voice queue registered");
        Some(id)
    }

    /// Remove `owner`'s queue.
    pub fn unregister(&self, owner: ConnectionId) -> bool {
        let mut queues = self.queues.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(id) = owned_by(&queues, owner) else {
            return false;
        };
        queues.remove(&id);
        debug!(%owner, queue = id, "voice queue removed");
        true
    }

    /// Queue id owned by `owner`.
    pub fn queue_id(&self, owner: ConnectionId) -> Option<u8> {
        self.snapshot().into_iter().find_map(|queue| {
            let queue = lock_queue(&queue);
            (queue.owner == owner).then_some(queue.id)
        })
    }

    /// Queue with `id`.
    pub fn queue(&self, id: u8) -> Option<Arc<Mutex<VoiceQueue>>> {
        let queues = self.queues.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        queues.get(&id).cloned()
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.queues.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Whether no queue is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mute or unmute `owner`. Muted queues keep filling but never flush.
    pub fn set_muted(&self, owner: ConnectionId, muted: bool) -> bool {
        let Some(id) = self.queue_id(owner) else {
            return false;
        };
        match self.queue(id) {
            Some(queue) => {
                lock_queue(&queue).muted = muted;
                true
            }
            None => false,
        }
    }

    /// Accept an upload from `sender` for queue `queue_id`.
    ///
    /// A queue id other than the sender's own is malformed.
    pub fn ingest(&self, sender: ConnectionId, queue_id: u8, payload: &[u8]) -> Result<usize, DecodeError> {
        let queue = self
            .queue(queue_id)
            .ok_or(DecodeError::Invalid("voice upload for unregistered queue"))?;
        let mut queue = lock_queue(&queue);
        if queue.owner != sender {
            return Err(DecodeError::Invalid("voice upload for another speaker's queue"));
        }
        let payload = VoicePayload::decode(payload)?;
        Ok(queue.ingest(payload))
    }

    /// Flush due queues to `recipients`, never echoing to the owner.
    pub fn flush(&self, now: Instant, recipients: &[ConnectionId]) -> Vec<VoiceSend> {
        let mut sends = Vec::new();
        for queue in self.snapshot() {
            let mut queue = lock_queue(&queue);
            if !queue.is_due(now) {
                continue;
            }
            let Some(payload) = queue.payload() else {
                continue;
            };
            queue.mark_sent(now);

            let message = ServerMessage::Voice {
                queue: queue.id,
                payload: payload.encode(),
            };
            let before = sends.len();
            sends.extend(
                recipients
                    .iter()
                    .filter(|&&to| to != queue.owner)
                    .map(|&to| VoiceSend {
                        to,
                        message: message.clone(),
                    }),
            );
            trace!(queue = queue.id, recipients = sends.len() - before, "voice flushed");
        }
        sends
    }
}
