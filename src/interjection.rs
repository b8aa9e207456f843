//! Speaking-slot arbitration between the AI agent and human participants

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// A human participant, by participant id.
    Human(String),
    Ai,
}

/// Response payload from the AI service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub audio: Option<Bytes>,
}

impl Utterance {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: None,
        }
    }
}

/// Inbound notifications from the AI service.
#[derive(Debug, Clone, PartialEq)]
pub enum AiEvent {
    /// The agent wants to say something.
    Response(Utterance),
    /// The agent finished its current utterance.
    Finished,
    /// The agent did not answer in time.
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Granted,
    /// 1-based position in the waiting queue.
    Queued { position: usize },
    AlreadyHolding,
}

/// The speaking slot while held.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub speaker: Speaker,
    pub utterance: Option<Utterance>,
    pub granted_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expired {
    pub speaker: Speaker,
    /// Turn granted to the next queued request, if any.
    pub next: Option<Turn>,
}

#[derive(Debug)]
struct Request {
    speaker: Speaker,
    utterance: Option<Utterance>,
}

/// Single speaking slot with a FIFO of waiting requests.
#[derive(Debug)]
pub struct InterjectionCoordinator {
    max_duration: Duration,
    holder: Option<Turn>,
    queue: VecDeque<Request>,
}

impl InterjectionCoordinator {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            max_duration,
            holder: None,
            queue: VecDeque::new(),
        }
    }

    pub fn holder(&self) -> Option<&Turn> {
        self.holder.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Deadline of the current turn.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.holder.as_ref().map(|t| t.deadline)
    }

    /// Asks for the slot. A request without an utterance (detected speech)
    /// is not queued twice for the same speaker.
    pub fn request(
        &mut self,
        speaker: Speaker,
        utterance: Option<Utterance>,
        now: Instant,
    ) -> Grant {
        if utterance.is_none() {
            if self.holder.as_ref().is_some_and(|t| t.speaker == speaker) {
                return Grant::AlreadyHolding;
            }
            if let Some(i) = self
                .queue
                .iter()
                .position(|r| r.speaker == speaker && r.utterance.is_none())
            {
                return Grant::Queued { position: i + 1 };
            }
        }

        if self.holder.is_none() && self.queue.is_empty() {
            self.grant(Request { speaker, utterance }, now);
            return Grant::Granted;
        }

        debug!(?speaker, queued = self.queue.len() + 1, "Speaking slot busy, request queued");
        self.queue.push_back(Request { speaker, utterance });
        Grant::Queued {
            position: self.queue.len(),
        }
    }

    fn grant(&mut self, request: Request, now: Instant) -> Turn {
        info!(speaker = ?request.speaker, "Speaking slot granted");
        let turn = Turn {
            speaker: request.speaker,
            utterance: request.utterance,
            granted_at: now,
            deadline: now + self.max_duration,
        };
        self.holder = Some(turn.clone());
        turn
    }

    fn promote(&mut self, now: Instant) -> Option<Turn> {
        let next = self.queue.pop_front()?;
        Some(self.grant(next, now))
    }

    /// Frees the slot if `speaker` holds it and hands it to the next
    /// request in line. Releasing a slot one does not hold does nothing.
    pub fn release(&mut self, speaker: &Speaker, now: Instant) -> Option<Turn> {
        match &self.holder {
            Some(turn) if &turn.speaker == speaker => {}
            _ => {
                debug!(?speaker, "Release of unheld slot ignored");
                return None;
            }
        }
        self.holder = None;
        info!(?speaker, "Speaking slot released");
        self.promote(now)
    }

    /// Drops waiting requests from `speaker`. Returns how many were removed.
    pub fn cancel_queued(&mut self, speaker: &Speaker) -> usize {
        let before = self.queue.len();
        self.queue.retain(|r| &r.speaker != speaker);
        before - self.queue.len()
    }

    /// Revokes a turn that ran past the maximum duration.
    pub fn on_timer(&mut self, now: Instant) -> Option<Expired> {
        let deadline = self.next_deadline()?;
        if deadline > now {
            return None;
        }
        let turn = self.holder.take()?;
        info!(speaker = ?turn.speaker, "Speaking slot expired");
        Some(Expired {
            speaker: turn.speaker,
            next: self.promote(now),
        })
    }

    pub fn clear(&mut self) {
        self.holder = None;
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn human() -> Speaker {
        Speaker::Human("patient".into())
    }

    fn coordinator() -> InterjectionCoordinator {
        InterjectionCoordinator::new(Duration::from_secs(15))
    }

    #[test]
    fn test_first_request_wins_rest_queue() {
        let now = Instant::now();
        let mut c = coordinator();
        assert_eq!(c.request(human(), None, now), Grant::Granted);
        assert_eq!(
            c.request(Speaker::Ai, Some(Utterance::text("hello")), now),
            Grant::Queued { position: 1 }
        );
        assert_eq!(c.holder().unwrap().speaker, human());

        let next = c.release(&human(), now).unwrap();
        assert_eq!(next.speaker, Speaker::Ai);
        assert_eq!(next.utterance.unwrap().text, "hello");
        assert_eq!(c.queue_len(), 0);
    }

    #[test]
    fn test_release_unheld_is_noop() {
        let now = Instant::now();
        let mut c = coordinator();
        assert!(c.release(&Speaker::Ai, now).is_none());

        c.request(human(), None, now);
        assert!(c.release(&Speaker::Ai, now).is_none());
        assert_eq!(c.holder().unwrap().speaker, human());
    }

    #[test]
    fn test_detected_speech_not_queued_twice() {
        let now = Instant::now();
        let mut c = coordinator();
        c.request(Speaker::Ai, Some(Utterance::text("a")), now);
        assert_eq!(c.request(human(), None, now), Grant::Queued { position: 1 });
        assert_eq!(c.request(human(), None, now), Grant::Queued { position: 1 });
        assert_eq!(c.queue_len(), 1);
        assert_eq!(c.request(Speaker::Ai, None, now), Grant::AlreadyHolding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_expires_after_max_duration() {
        let mut c = coordinator();
        c.request(Speaker::Ai, Some(Utterance::text("long")), Instant::now());
        c.request(human(), None, Instant::now());

        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(c.on_timer(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let expired = c.on_timer(Instant::now()).unwrap();
        assert_eq!(expired.speaker, Speaker::Ai);
        assert_eq!(expired.next.unwrap().speaker, human());
        assert_eq!(
            c.next_deadline(),
            Some(Instant::now() + Duration::from_secs(15))
        );
    }

    #[test]
    fn test_cancel_queued() {
        let now = Instant::now();
        let mut c = coordinator();
        c.request(human(), None, now);
        c.request(Speaker::Ai, Some(Utterance::text("a")), now);
        c.request(Speaker::Ai, Some(Utterance::text("b")), now);
        assert_eq!(c.cancel_queued(&Speaker::Ai), 2);
        assert!(c.release(&human(), now).is_none());
        assert!(c.holder().is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Request(u8),
        Release(u8),
        Tick(u8),
    }

    fn speaker(n: u8) -> Speaker {
        if n == 0 {
            Speaker::Ai
        } else {
            Speaker::Human(format!("h{}", n))
        }
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Request),
            (0u8..4).prop_map(Op::Release),
            (0u8..20).prop_map(Op::Tick),
        ]
    }

    proptest! {
        #[test]
        fn prop_slot_is_granted_in_arrival_order(ops in proptest::collection::vec(op(), 1..60)) {
            let start = Instant::now();
            let mut elapsed = Duration::ZERO;
            let mut c = coordinator();
            let mut model: Vec<Speaker> = Vec::new();
            let mut holder: Option<Speaker> = None;

            for op in ops {
                let now = start + elapsed;
                match op {
                    Op::Request(n) => match c.request(speaker(n), Some(Utterance::text("x")), now) {
                        Grant::Granted => {
                            prop_assert!(holder.is_none());
                            holder = Some(speaker(n));
                        }
                        Grant::Queued { position } => {
                            model.push(speaker(n));
                            prop_assert_eq!(position, model.len());
                        }
                        Grant::AlreadyHolding => prop_assert!(false),
                    },
                    Op::Release(n) => {
                        let next = c.release(&speaker(n), now);
                        if holder.as_ref() == Some(&speaker(n)) {
                            holder = if model.is_empty() { None } else { Some(model.remove(0)) };
                            prop_assert_eq!(next.map(|t| t.speaker), holder.clone());
                        } else {
                            prop_assert!(next.is_none());
                        }
                    }
                    Op::Tick(secs) => {
                        elapsed += Duration::from_secs(u64::from(secs));
                        if let Some(expired) = c.on_timer(start + elapsed) {
                            prop_assert_eq!(Some(expired.speaker), holder.take());
                            holder = if model.is_empty() { None } else { Some(model.remove(0)) };
                            prop_assert_eq!(expired.next.map(|t| t.speaker), holder.clone());
                        }
                    }
                }
                prop_assert_eq!(c.holder().map(|t| t.speaker.clone()), holder.clone());
                prop_assert_eq!(c.queue_len(), model.len());
            }
        }
    }
}
