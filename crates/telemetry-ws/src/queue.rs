//! Outbound command queue and frame encoding.

use std::collections::VecDeque;

use serde::Serialize;

use crate::{
    command::{CommandId, Envelope},
    error::TelemetryResult,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthCmd<'a> {
    cmd_id: CommandId,
    token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthFrame<'a> {
    auth_cmd: AuthCmd<'a>,
}

#[derive(Serialize)]
struct CmdsFrame<'a> {
    cmds: Vec<&'a Envelope>,
}

/// Encode the authentication frame that opens every connection.
pub(crate) fn auth_frame(token: &str) -> TelemetryResult<String> {
    let frame = AuthFrame {
        auth_cmd: AuthCmd {
            cmd_id: CommandId::AUTH,
            token,
        },
    };
    Ok(serde_json::to_string(&frame)?)
}

#[derive(Debug)]
struct QueuedEnvelope {
    envelope: Envelope,
    /// Belongs to a registered subscriber and is meaningless after a disconnect.
    epoch_bound: bool,
}

/// A batch of normalized envelopes ready to be written as one frame.
#[derive(Debug)]
pub(crate) struct CommandBatch {
    entries: Vec<QueuedEnvelope>,
}

impl CommandBatch {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter().map(|queued| &queued.envelope)
    }

    /// Encode as `{"cmds": [...]}`.
    pub(crate) fn to_frame(&self) -> TelemetryResult<String> {
        let frame = CmdsFrame {
            cmds: self.envelopes().collect(),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

/// FIFO buffer of envelopes awaiting an open connection.
#[derive(Debug)]
pub(crate) struct CommandQueue {
    pending: VecDeque<QueuedEnvelope>,
    batch_size: usize,
}

impl CommandQueue {
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Append a subscribe/unsubscribe envelope tied to the current epoch.
    pub(crate) fn push(&mut self, envelope: Envelope) {
        self.pending.push_back(QueuedEnvelope {
            envelope,
            epoch_bound: true,
        });
    }

    /// Append a fire-and-forget envelope that survives reconnects.
    pub(crate) fn push_one_way(&mut self, envelope: Envelope) {
        self.pending.push_back(QueuedEnvelope {
            envelope,
            epoch_bound: false,
        });
    }

    /// Remove up to `batch_size` envelopes from the front, normalized.
    pub(crate) fn next_batch(&mut self) -> Option<CommandBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let take = self.batch_size.min(self.pending.len());
        let entries = self
            .pending
            .drain(..take)
            .map(|queued| QueuedEnvelope {
                envelope: queued.envelope.normalized(),
                epoch_bound: queued.epoch_bound,
            })
            .collect();
        Some(CommandBatch { entries })
    }

    /// Put a batch that could not be written back at the front, preserving order.
    pub(crate) fn requeue_front(&mut self, batch: CommandBatch) {
        for queued in batch.entries.into_iter().rev() {
            self.pending.push_front(queued);
        }
    }

    /// Drop everything tied to the epoch that just ended.
    pub(crate) fn discard_epoch_bound(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|queued| !queued.epoch_bound);
        before - self.pending.len()
    }

    /// Drop queued envelopes carrying any of `ids`.
    pub(crate) fn discard_ids(&mut self, ids: &[CommandId]) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|queued| !ids.contains(&queued.envelope.cmd_id()));
        before - self.pending.len()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
