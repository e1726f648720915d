#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Older than expected, most likely a duplicate of a resend.
    Stale,
    Accept,
    /// At least one frame in between never arrived.
    Lost { expected: u32, received: u32 },
}

/// Expected value of a strictly incrementing per-direction frame counter.
#[derive(Debug, Clone, Default)]
pub struct FrameCounter {
    expected: u32,
}

impl FrameCounter {
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Only an accepted frame advances the expectation.
    pub fn check(&mut self, received: u32) -> FrameVerdict {
        if received < self.expected {
            FrameVerdict::Stale
        } else if received == self.expected {
            self.expected += 1;
            FrameVerdict::Accept
        } else {
            FrameVerdict::Lost {
                expected: self.expected,
                received,
            }
        }
    }

    pub fn reset(&mut self) {
        self.expected = 0;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendCounter {
    next: u32,
}

impl SendCounter {
    pub fn next_frame(&mut self) -> u32 {
        let frame = self.next;
        self.next += 1;
        frame
    }

    pub fn peek(&self) -> u32 {
        self.next
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_frames_accepted() {
        let mut counter = FrameCounter::default();
        for frame in 0..5 {
            assert_eq!(counter.check(frame), FrameVerdict::Accept);
        }
        assert_eq!(counter.expected(), 5);
    }

    #[test]
    fn test_duplicate_is_stale_and_harmless() {
        let mut counter = FrameCounter::default();
        counter.check(0);
        counter.check(1);

        assert_eq!(counter.check(0), FrameVerdict::Stale);
        assert_eq!(counter.check(1), FrameVerdict::Stale);
        assert_eq!(counter.expected(), 2);
        assert_eq!(counter.check(2), FrameVerdict::Accept);
    }

    #[test]
    fn test_gap_reports_loss() {
        let mut counter = FrameCounter::default();
        counter.check(0);

        assert_eq!(
            counter.check(3),
            FrameVerdict::Lost {
                expected: 1,
                received: 3
            }
        );
        assert_eq!(counter.expected(), 1);
    }

    #[test]
    fn test_send_counter_matches_receiver() {
        let mut send = SendCounter::default();
        let mut recv = FrameCounter::default();
        for _ in 0..10 {
            assert_eq!(recv.check(send.next_frame()), FrameVerdict::Accept);
        }
        assert_eq!(send.peek(), recv.expected());
    }
}
