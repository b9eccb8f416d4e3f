//! Fixed-delay rejoin timing.
//!
//! The supervisor holds at most one pending retry. It is cancelled exactly
//! once, when the session is left, and refuses to schedule afterwards.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled { deadline: Instant },
    Cancelled,
}

#[derive(Debug)]
pub struct ReconnectionSupervisor {
    delay: Duration,
    phase: Phase,
    attempts: u32,
}

impl ReconnectionSupervisor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            phase: Phase::Idle,
            attempts: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm a retry `delay` from now. Re-arming replaces the deadline.
    /// Returns false once cancelled.
    pub fn schedule(&mut self) -> bool {
        if self.phase == Phase::Cancelled {
            return false;
        }
        self.phase = Phase::Scheduled {
            deadline: Instant::now() + self.delay,
        };
        true
    }

    /// Wait for the armed retry and return its attempt number (1-based).
    /// Pends forever when nothing is armed. Cancel-safe.
    pub async fn wait(&mut self) -> u32 {
        let deadline = match self.phase {
            Phase::Scheduled { deadline } => deadline,
            Phase::Idle | Phase::Cancelled => std::future::pending().await,
        };
        tokio::time::sleep_until(deadline).await;
        self.phase = Phase::Idle;
        self.attempts += 1;
        self.attempts
    }

    /// Stop for good. Returns true the first time only.
    pub fn cancel(&mut self) -> bool {
        if self.phase == Phase::Cancelled {
            return false;
        }
        self.phase = Phase::Cancelled;
        true
    }

    /// Forget the attempt count after a successful join.
    pub fn reset(&mut self) {
        self.attempts = 0;
        if self.phase != Phase::Cancelled {
            self.phase = Phase::Idle;
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.phase, Phase::Scheduled { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase == Phase::Cancelled
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Scheduled { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Retries fired since the last successful join.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
