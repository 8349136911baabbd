//! Bounded priority command queue
//!
//! External callers never touch the serial port; they enqueue here and the
//! monitor drains between program-line sends. Priority ordering:
//! emergency stop > control (pause/resume/cancel cleanup) > user commands.
//! Program lines are not queued; the send cursor owns them.

use std::collections::VecDeque;

/// Priority lane for an injected command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandPriority {
    /// `M112` and friends; drained even after a fault latches
    Emergency,
    /// Engine-injected cleanup (cancel's `M84`/heater-off, resume's `G92`)
    Control,
    /// `command()` and temperature setters
    User,
}

/// A command waiting for the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    /// The line to transmit, unnumbered
    pub body: String,
    /// Lane it was queued on
    pub priority: CommandPriority,
}

/// Three-lane bounded queue
#[derive(Debug)]
pub struct CommandQueue {
    emergency: VecDeque<String>,
    control: VecDeque<String>,
    user: VecDeque<String>,
    capacity: usize,
}

impl CommandQueue {
    /// Create a queue bounding the user lane to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            emergency: VecDeque::new(),
            control: VecDeque::new(),
            user: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue a command; returns `false` when the user lane is full
    ///
    /// Emergency and control commands are never refused.
    pub fn push(&mut self, body: impl Into<String>, priority: CommandPriority) -> bool {
        let body = body.into();
        match priority {
            CommandPriority::Emergency => self.emergency.push_back(body),
            CommandPriority::Control => self.control.push_back(body),
            CommandPriority::User => {
                if self.user.len() >= self.capacity {
                    return false;
                }
                self.user.push_back(body);
            }
        }
        true
    }

    /// Take the highest-priority pending command
    pub fn pop(&mut self) -> Option<QueuedCommand> {
        if let Some(body) = self.emergency.pop_front() {
            return Some(QueuedCommand {
                body,
                priority: CommandPriority::Emergency,
            });
        }
        if let Some(body) = self.control.pop_front() {
            return Some(QueuedCommand {
                body,
                priority: CommandPriority::Control,
            });
        }
        self.user.pop_front().map(|body| QueuedCommand {
            body,
            priority: CommandPriority::User,
        })
    }

    /// Take the next pending emergency command only
    pub fn pop_emergency(&mut self) -> Option<QueuedCommand> {
        self.emergency.pop_front().map(|body| QueuedCommand {
            body,
            priority: CommandPriority::Emergency,
        })
    }

    /// Drop everything the user queued (kept on cancel cleanup)
    pub fn clear_user(&mut self) {
        self.user.clear();
    }

    /// Total queued commands across all lanes
    pub fn len(&self) -> usize {
        self.emergency.len() + self.control.len() + self.user.len()
    }

    /// Whether all lanes are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_drain_in_priority_order() {
        let mut queue = CommandQueue::new(8);
        queue.push("M104 S200", CommandPriority::User);
        queue.push("M84", CommandPriority::Control);
        queue.push("M112", CommandPriority::Emergency);

        assert_eq!(queue.pop().unwrap().body, "M112");
        assert_eq!(queue.pop().unwrap().body, "M84");
        assert_eq!(queue.pop().unwrap().body, "M104 S200");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn user_lane_is_bounded() {
        let mut queue = CommandQueue::new(2);
        assert!(queue.push("G28", CommandPriority::User));
        assert!(queue.push("M114", CommandPriority::User));
        assert!(!queue.push("M105", CommandPriority::User));
        // Control ignores the bound
        assert!(queue.push("M84", CommandPriority::Control));
    }

    #[test]
    fn fifo_within_a_lane() {
        let mut queue = CommandQueue::new(8);
        queue.push("first", CommandPriority::User);
        queue.push("second", CommandPriority::User);
        assert_eq!(queue.pop().unwrap().body, "first");
        assert_eq!(queue.pop().unwrap().body, "second");
    }
}
