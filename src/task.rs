//! iSCSI request/response correlation
//!
//! Every SCSI Command PDU opens a task keyed by (conversation, Initiator Task
//! Tag). Data-In, Data-Out and Response PDUs seen on a frame's first visit are
//! attached to the open task for their key; the first such PDU promotes the
//! task into the matched index. After the first pass every frame that carried
//! a leg of the task finds it again through the matched index, whatever order
//! frames are revisited in.
//!
//! A new command with the same tag supersedes the open task. The superseded
//! record stays reachable from its own frames and is never freed.

use crate::annotation::Annotation;
use crate::conversation::ConversationId;
use crate::frame::FrameInfo;
use crate::scsi::ScsiTaskInfo;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

/// Which leg of a task a PDU carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    DataIn,
    DataOut,
    Response,
}

/// Correlation record of one iSCSI task
#[derive(Debug, Clone)]
pub struct IscsiTask {
    pub conversation: ConversationId,
    pub itt: u32,
    /// Frame numbers of each leg, 0 until seen
    pub request_frame: u32,
    pub data_in_frame: u32,
    pub data_out_frame: u32,
    pub response_frame: u32,
    pub command_time: Duration,
    pub scsi: ScsiTaskInfo,
}

impl IscsiTask {
    fn has_followup(&self) -> bool {
        self.data_in_frame != 0 || self.data_out_frame != 0 || self.response_frame != 0
    }

    fn record(&mut self, role: TaskRole, frame: u32) {
        let slot = match role {
            TaskRole::DataIn => &mut self.data_in_frame,
            TaskRole::DataOut => &mut self.data_out_frame,
            TaskRole::Response => &mut self.response_frame,
        };
        if *slot == 0 {
            *slot = frame;
        }
    }

    /// Cross references to the other legs, as seen from `frame`
    pub fn annotations(&self, frame: u32, now: Duration) -> Vec<Annotation> {
        let mut out = Vec::new();
        if self.request_frame != 0 && self.request_frame != frame {
            out.push(Annotation::RequestIn(self.request_frame));
        }
        if self.data_in_frame != 0 && self.data_in_frame != frame {
            out.push(Annotation::DataInIn(self.data_in_frame));
        }
        if self.data_out_frame != 0 && self.data_out_frame != frame {
            out.push(Annotation::DataOutIn(self.data_out_frame));
        }
        if self.response_frame != 0 && self.response_frame != frame {
            out.push(Annotation::ResponseIn(self.response_frame));
        }
        if self.request_frame != 0 && self.request_frame != frame {
            out.push(Annotation::TimeFromRequest(now.saturating_sub(self.command_time)));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MatchedKey {
    conversation: ConversationId,
    itt: u32,
    frame: u32,
}

#[derive(Debug, Default)]
pub struct TaskCorrelator {
    arena: Vec<IscsiTask>,
    unmatched: HashMap<(ConversationId, u32), TaskId>,
    matched: HashMap<MatchedKey, TaskId>,
}

impl TaskCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A SCSI Command PDU with tag `itt` in `frame`
    pub fn on_command(
        &mut self,
        conversation: ConversationId,
        itt: u32,
        frame: &FrameInfo,
    ) -> Option<TaskId> {
        if !frame.first_visit {
            return self.replay(conversation, itt, frame.number).or_else(|| {
                // Commands never answered are only in the unmatched index
                self.unmatched
                    .get(&(conversation, itt))
                    .copied()
                    .filter(|id| self.arena[id.0].request_frame == frame.number)
            });
        }

        if let Some(old) = self.unmatched.remove(&(conversation, itt)) {
            log::trace!(
                "ITT 0x{:08x} on {} reused in frame {}, superseding task from frame {}",
                itt,
                conversation,
                frame.number,
                self.arena[old.0].request_frame
            );
        }

        let id = TaskId(self.arena.len());
        self.arena.push(IscsiTask {
            conversation,
            itt,
            request_frame: frame.number,
            data_in_frame: 0,
            data_out_frame: 0,
            response_frame: 0,
            command_time: frame.timestamp,
            scsi: ScsiTaskInfo::default(),
        });
        self.unmatched.insert((conversation, itt), id);
        Some(id)
    }

    /// A Data-In, Data-Out or Response PDU with tag `itt` in `frame`
    ///
    /// `status_collapsed` marks a Data-In PDU that also carries the final
    /// status, which then counts as the response leg too.
    pub fn on_followup(
        &mut self,
        conversation: ConversationId,
        itt: u32,
        role: TaskRole,
        status_collapsed: bool,
        frame: &FrameInfo,
    ) -> Option<TaskId> {
        if !frame.first_visit {
            return self.replay(conversation, itt, frame.number);
        }

        let id = *self.unmatched.get(&(conversation, itt))?;
        let task = &mut self.arena[id.0];
        if !task.has_followup() {
            self.matched.insert(
                MatchedKey {
                    conversation,
                    itt,
                    frame: task.request_frame,
                },
                id,
            );
        }
        task.record(role, frame.number);
        if role == TaskRole::DataIn && status_collapsed {
            task.record(TaskRole::Response, frame.number);
        }
        self.matched.insert(
            MatchedKey {
                conversation,
                itt,
                frame: frame.number,
            },
            id,
        );
        Some(id)
    }

    fn replay(&self, conversation: ConversationId, itt: u32, frame: u32) -> Option<TaskId> {
        self.matched
            .get(&MatchedKey {
                conversation,
                itt,
                frame,
            })
            .copied()
    }

    pub fn get(&self, id: TaskId) -> &IscsiTask {
        &self.arena[id.0]
    }

    pub fn get_mut(&mut self, id: TaskId) -> &mut IscsiTask {
        &mut self.arena[id.0]
    }

    /// Open task for a tag, if any
    pub fn open_task(&self, conversation: ConversationId, itt: u32) -> Option<TaskId> {
        self.unmatched.get(&(conversation, itt)).copied()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
