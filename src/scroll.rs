/// Whether the message view sticks to the newest message.
///
/// The view is either following the tail or detached from it with a count
/// of unseen arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollFollow {
    Following,
    Detached { unseen: usize },
}

impl Default for ScrollFollow {
    fn default() -> Self {
        ScrollFollow::Following
    }
}

impl ScrollFollow {
    /// The user scrolled; `at_bottom` is whether the viewport reaches the tail.
    pub fn on_user_scroll(&mut self, at_bottom: bool) {
        *self = match (*self, at_bottom) {
            (_, true) => ScrollFollow::Following,
            (ScrollFollow::Following, false) => ScrollFollow::Detached { unseen: 0 },
            (detached, false) => detached,
        };
    }

    /// A message was appended. Returns true when the view should jump to it.
    /// Own messages always pull the view back to the tail.
    pub fn on_message(&mut self, from_self: bool) -> bool {
        match self {
            ScrollFollow::Following => true,
            ScrollFollow::Detached { .. } if from_self => {
                *self = ScrollFollow::Following;
                true
            }
            ScrollFollow::Detached { unseen } => {
                *unseen += 1;
                false
            }
        }
    }

    pub fn unseen(&self) -> usize {
        match self {
            ScrollFollow::Following => 0,
            ScrollFollow::Detached { unseen } => *unseen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_view_counts_incoming_and_reattaches() {
        let mut mode = ScrollFollow::default();
        assert!(mode.on_message(false));

        mode.on_user_scroll(false);
        assert!(!mode.on_message(false));
        assert!(!mode.on_message(false));
        assert_eq!(mode.unseen(), 2);

        mode.on_user_scroll(false);
        assert_eq!(mode.unseen(), 2);

        mode.on_user_scroll(true);
        assert_eq!(mode, ScrollFollow::Following);
    }

    #[test]
    fn own_message_snaps_back() {
        let mut mode = ScrollFollow::Detached { unseen: 3 };
        assert!(mode.on_message(true));
        assert_eq!(mode.unseen(), 0);
    }
}
