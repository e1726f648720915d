/// Makes a connection misbehave on purpose so failure paths can be exercised.
#[derive(Debug, Clone, Default)]
pub struct FaultInjection {
    pub fail_sends: bool,
    /// Frames allowed through before sends start failing.
    pub fail_after_frames: u64,
}

impl FaultInjection {
    pub fn failing_sends() -> Self {
        Self {
            fail_sends: true,
            fail_after_frames: 0,
        }
    }

    pub fn should_fail_send(&self, frames_sent: u64) -> bool {
        self.fail_sends && frames_sent >= self.fail_after_frames
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
}
