//! End-to-end session scenarios driven through the public orchestrator API
//! with scripted collaborators and a manual clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use interview_session::clock::{Clock, ManualClock};
use interview_session::exchange::{
    parse_server_frame, AnswerOutcome, ChannelEvent, ClientMessage, ExchangeChannel,
    QuestionDelivery,
};
use interview_session::media::MediaHandles;
use interview_session::model::{ExitReason, Question, TranscriptSegment};
use interview_session::orchestrator::Collaborators;
use interview_session::persistence::{KeyValueStore, MemoryStore, PersistedSnapshot};
use interview_session::policy::ContentVerdict;
use interview_session::session::{CompletionReason, Session};
use interview_session::speech::{CaptureState, SpeechStream};
use interview_session::{
    ActiveStage, Phase, Result, SessionConfig, SessionInput, SessionNotice, SessionOrchestrator,
};

const SESSION_ID: &str = "iv-42";

type CallLog = Arc<Mutex<Vec<String>>>;

// ── Scripted collaborators ───────────────────────────────────────

struct ScriptedChannel {
    log: CallLog,
    sent: Mutex<Vec<ClientMessage>>,
    end_calls: AtomicU32,
}

impl ScriptedChannel {
    fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(ClientMessage::kind).collect()
    }
}

#[async_trait]
impl ExchangeChannel for ScriptedChannel {
    fn is_connected(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.log.lock().push(format!("send:{}", message.kind()));
        self.sent.lock().push(message);
        Ok(())
    }

    async fn end_interview(&self, _interview_id: &str) -> Result<()> {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("end".into());
        Ok(())
    }
}

struct ScriptedSpeech {
    log: CallLog,
}

#[async_trait]
impl SpeechStream for ScriptedSpeech {
    async fn request_permission(&self) -> Result<()> {
        self.log.lock().push("speech:permission".into());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.log.lock().push("speech:start".into());
        Ok(())
    }

    fn stop(&self) {
        self.log.lock().push("speech:stop".into());
    }

    fn reset(&self) {
        self.log.lock().push("speech:reset".into());
    }

    async fn retry(&self) -> Result<()> {
        self.log.lock().push("speech:retry".into());
        Ok(())
    }
}

#[derive(Default)]
struct CountingMedia {
    releases: AtomicU32,
}

impl MediaHandles for CountingMedia {
    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Harness ──────────────────────────────────────────────────────

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap()
}

struct Harness {
    orchestrator: SessionOrchestrator,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    channel: Arc<ScriptedChannel>,
    media: Arc<CountingMedia>,
    log: CallLog,
}

impl Harness {
    fn new(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Self {
        Self::with_config(store, clock, SessionConfig::default())
    }

    fn with_config(store: Arc<MemoryStore>, clock: Arc<ManualClock>, config: SessionConfig) -> Self {
        let log: CallLog = Arc::default();
        let channel = Arc::new(ScriptedChannel {
            log: log.clone(),
            sent: Mutex::new(Vec::new()),
            end_calls: AtomicU32::new(0),
        });
        let media = Arc::new(CountingMedia::default());
        let (orchestrator, _handle, notices) = SessionOrchestrator::new(
            SESSION_ID,
            config,
            Collaborators {
                channel: channel.clone(),
                speech: Arc::new(ScriptedSpeech { log: log.clone() }),
                store,
                media: media.clone(),
                hints: None,
                clock,
            },
        );
        Self {
            orchestrator,
            notices,
            channel,
            media,
            log,
        }
    }

    fn acknowledged_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .set("interview-session:risk-notice-acknowledged", "true")
            .unwrap();
        store
    }

    fn drain(&mut self) -> Vec<SessionNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }

    fn session(&self) -> &Session {
        self.orchestrator.session()
    }

    async fn deliver(&mut self, id: &str, number: u32) {
        self.orchestrator
            .handle(SessionInput::Channel(ChannelEvent::QuestionReceived(
                QuestionDelivery {
                    question: Question::new(id, format!("Question {number}")),
                    number,
                    audio: None,
                },
            )))
            .await;
    }

    /// Fresh load, begin, first question delivered.
    async fn answering(&mut self) {
        self.orchestrator.load().await;
        self.orchestrator.handle(SessionInput::Begin).await;
        self.deliver("q1", 1).await;
        assert_eq!(
            self.orchestrator.phase(),
            Phase::Active(ActiveStage::Answering)
        );
    }

    async fn answer(&mut self, question_id: &str, text: &str) {
        self.orchestrator
            .handle(SessionInput::EditDraft(text.into()))
            .await;
        self.orchestrator
            .handle(SessionInput::SubmitAnswer {
                question_id: question_id.into(),
            })
            .await;
    }

    async fn hide_and_show(&mut self) {
        self.orchestrator
            .handle(SessionInput::VisibilityChanged { hidden: true })
            .await;
        self.orchestrator
            .handle(SessionInput::VisibilityChanged { hidden: false })
            .await;
    }

    fn exits(notices: &[SessionNotice]) -> Vec<ExitReason> {
        notices
            .iter()
            .filter_map(|n| match n {
                SessionNotice::Exit(reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }
}

fn started_snapshot(remaining: i64, written_at: DateTime<Utc>) -> PersistedSnapshot {
    serde_json::from_value(serde_json::json!({
        "interviewId": SESSION_ID,
        "interviewType": "technical",
        "isStarted": true,
        "startTime": written_at - chrono::Duration::seconds(60),
        "durationSecs": 1800,
        "remainingSeconds": remaining,
        "currentQuestion": { "id": "q3", "prompt": "Explain lifetimes" },
        "questionNumber": 3,
        "answerDraft": { "questionId": "q3", "text": "They bound", "source": "manual" },
        "warningStatus": { "warningCount": 0, "isTerminated": false, "canContinue": true },
        "tabSwitchCount": 0,
        "writtenAt": written_at,
    }))
    .unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn tab_warning_shows_once_per_count() {
    let mut h = Harness::new(
        Harness::acknowledged_store(),
        Arc::new(ManualClock::new(t0())),
    );
    h.answering().await;
    h.drain();

    h.hide_and_show().await;
    // A repeated hidden event without a return does not count.
    h.orchestrator
        .handle(SessionInput::VisibilityChanged { hidden: false })
        .await;
    h.hide_and_show().await;

    let warnings: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|n| match n {
            SessionNotice::TabWarning { count } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![1, 2]);
    assert_eq!(h.orchestrator.counters().tab_switches, 2);
    assert!(!h.session().is_terminated());
}

#[tokio::test]
async fn expired_snapshot_completes_without_starting_anything() {
    let store = Harness::acknowledged_store();
    let written = t0() - chrono::Duration::seconds(60);
    store
        .set(
            "interview-session:iv-42:snapshot",
            &serde_json::to_string(&started_snapshot(0, written)).unwrap(),
        )
        .unwrap();

    let mut h = Harness::new(store.clone(), Arc::new(ManualClock::new(t0())));
    h.orchestrator.load().await;

    assert_eq!(
        h.orchestrator.phase(),
        Phase::Completed(CompletionReason::SnapshotExpired)
    );
    let notices = h.drain();
    assert!(notices.contains(&SessionNotice::SessionExpired));
    assert_eq!(Harness::exits(&notices), vec![ExitReason::Expired]);

    // No question request, no speech, no proctoring.
    assert!(h.channel.sent_kinds().is_empty());
    assert!(h.log.lock().iter().all(|c| !c.starts_with("speech:start")));
    h.orchestrator.handle(SessionInput::Clipboard).await;
    assert_eq!(h.orchestrator.counters().copy_paste, 0);
    assert_eq!(h.media.releases.load(Ordering::SeqCst), 1);
    assert!(store
        .get("interview-session:iv-42:snapshot")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn terminating_verdict_ignores_bundled_question() {
    let mut h = Harness::new(
        Harness::acknowledged_store(),
        Arc::new(ManualClock::new(t0())),
    );
    h.answering().await;
    h.answer("q1", "I would rather not say").await;
    h.drain();

    h.orchestrator
        .handle(SessionInput::Channel(ChannelEvent::AnswerSubmitted(
            AnswerOutcome {
                question_id: "q1".into(),
                verdict: ContentVerdict {
                    warning_issued: true,
                    interview_terminated: true,
                    warning_count: Some(3),
                    message: Some("inappropriate content".into()),
                },
                next: Some(QuestionDelivery {
                    question: Question::new("q2", "Never shown"),
                    number: 2,
                    audio: None,
                }),
            },
        )))
        .await;

    assert_eq!(h.orchestrator.phase(), Phase::Terminated);
    assert_eq!(h.session().current_question_id(), Some("q1"));
    assert!(h.session().warning.is_terminated);

    let notices = h.drain();
    assert!(!notices
        .iter()
        .any(|n| matches!(n, SessionNotice::QuestionReady { .. })));
    assert_eq!(Harness::exits(&notices), vec![ExitReason::Terminated]);

    h.orchestrator.teardown();
    assert_eq!(h.media.releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.channel.end_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreadable_frame_does_not_lose_a_terminating_verdict() {
    let mut h = Harness::new(
        Harness::acknowledged_store(),
        Arc::new(ManualClock::new(t0())),
    );
    h.answering().await;
    h.answer("q1", "Something rude").await;

    h.orchestrator
        .handle(SessionInput::Channel(parse_server_frame("garbage")))
        .await;
    assert_eq!(
        h.orchestrator.phase(),
        Phase::Active(ActiveStage::Submitting)
    );

    h.orchestrator
        .handle(SessionInput::Channel(ChannelEvent::AnswerSubmitted(
            AnswerOutcome {
                question_id: "q1".into(),
                verdict: ContentVerdict {
                    warning_issued: true,
                    interview_terminated: true,
                    warning_count: None,
                    message: None,
                },
                next: Some(QuestionDelivery {
                    question: Question::new("q2", "Never shown"),
                    number: 2,
                    audio: None,
                }),
            },
        )))
        .await;

    assert_eq!(h.orchestrator.phase(), Phase::Terminated);
    assert!(h.session().warning.is_terminated);
    assert_eq!(h.session().current_question_id(), Some("q1"));
    let submits = h
        .channel
        .sent_kinds()
        .into_iter()
        .filter(|k| *k == "submit_answer")
        .count();
    assert_eq!(submits, 1);
}

#[tokio::test]
async fn terminated_session_stays_terminated_after_reload() {
    let store = Harness::acknowledged_store();
    let clock = Arc::new(ManualClock::new(t0()));
    let mut first = Harness::new(store.clone(), clock.clone());
    first.answering().await;
    first.answer("q1", "nope").await;
    first
        .orchestrator
        .handle(SessionInput::Channel(ChannelEvent::WarningIssued(
            ContentVerdict {
                interview_terminated: true,
                ..ContentVerdict::default()
            },
        )))
        .await;
    assert_eq!(first.orchestrator.phase(), Phase::Terminated);

    let mut second = Harness::new(store, clock);
    second.orchestrator.load().await;
    assert_eq!(second.orchestrator.phase(), Phase::Terminated);
    assert!(second.channel.sent_kinds().is_empty());
    assert_eq!(
        Harness::exits(&second.drain()),
        vec![ExitReason::Terminated]
    );
}

#[tokio::test]
async fn reload_resumes_with_elapsed_time_deducted() {
    let store = Harness::acknowledged_store();
    let clock = Arc::new(ManualClock::new(t0()));
    let mut first = Harness::new(store.clone(), clock.clone());
    first.answering().await;
    first
        .orchestrator
        .handle(SessionInput::EditDraft("Ownership moves".into()))
        .await;

    clock.advance(Duration::from_secs(100));
    let remaining_at_hide = first.session().remaining_secs(clock.now());
    first.orchestrator.handle(SessionInput::PageHide).await;
    drop(first);

    clock.advance(Duration::from_secs(45));
    let mut second = Harness::new(store, clock.clone());
    second.orchestrator.load().await;

    assert_eq!(
        second.orchestrator.phase(),
        Phase::Active(ActiveStage::Answering)
    );
    assert_eq!(
        second.session().remaining_secs(clock.now()),
        remaining_at_hide - 45
    );
    assert_eq!(second.session().current_question_id(), Some("q1"));
    assert_eq!(second.session().draft.text, "Ownership moves");
    // The restored question is not requested again.
    assert!(second.channel.sent_kinds().is_empty());
    assert_eq!(second.orchestrator.speech_state(), CaptureState::Idle);
}

#[tokio::test]
async fn reload_after_the_deadline_expires() {
    let store = Harness::acknowledged_store();
    let clock = Arc::new(ManualClock::new(t0()));
    let mut first = Harness::new(store.clone(), clock.clone());
    first.answering().await;
    first.orchestrator.handle(SessionInput::PageHide).await;
    let remaining = first.session().remaining_secs(clock.now());
    drop(first);

    clock.set_wall(t0() + chrono::Duration::seconds(remaining));
    let mut second = Harness::new(store, clock);
    second.orchestrator.load().await;

    assert_eq!(
        second.orchestrator.phase(),
        Phase::Completed(CompletionReason::SnapshotExpired)
    );
    assert_eq!(Harness::exits(&second.drain()), vec![ExitReason::Expired]);
}

#[tokio::test]
async fn speech_stops_before_the_answer_is_sent() {
    let mut h = Harness::new(
        Harness::acknowledged_store(),
        Arc::new(ManualClock::new(t0())),
    );
    h.answering().await;

    h.orchestrator.handle(SessionInput::StartSpeech).await;
    h.orchestrator
        .handle(SessionInput::SpeechPermission(Ok(())))
        .await;
    assert_eq!(h.orchestrator.speech_state(), CaptureState::Listening);

    h.orchestrator
        .handle(SessionInput::Transcript(TranscriptSegment::final_text(
            "Borrowing is temporary access",
        )))
        .await;
    assert_eq!(h.session().draft.text, "Borrowing is temporary access");

    h.log.lock().clear();
    h.orchestrator
        .handle(SessionInput::SubmitAnswer {
            question_id: "q1".into(),
        })
        .await;

    let log = h.log.lock().clone();
    let stop = log.iter().position(|c| c == "speech:stop");
    let send = log.iter().position(|c| c == "send:submit_answer");
    assert!(stop.is_some() && send.is_some());
    assert!(stop < send);

    // Late recognizer output never reaches the next draft.
    h.orchestrator
        .handle(SessionInput::Transcript(TranscriptSegment::final_text(
            "stray words",
        )))
        .await;
    assert_eq!(h.session().draft.text, "");
}

#[tokio::test]
async fn only_one_exchange_is_in_flight() {
    let mut h = Harness::new(
        Harness::acknowledged_store(),
        Arc::new(ManualClock::new(t0())),
    );
    h.answering().await;
    h.orchestrator
        .handle(SessionInput::EditDraft("First try".into()))
        .await;

    assert!(h.orchestrator.submit_answer("q1").await.unwrap());
    assert!(!h.orchestrator.submit_answer("q1").await.unwrap());

    let submits = h
        .channel
        .sent_kinds()
        .into_iter()
        .filter(|k| *k == "submit_answer")
        .count();
    assert_eq!(submits, 1);
    assert_eq!(
        h.orchestrator.phase(),
        Phase::Active(ActiveStage::Submitting)
    );
}

#[tokio::test]
async fn warning_count_never_decreases() {
    let mut h = Harness::new(
        Harness::acknowledged_store(),
        Arc::new(ManualClock::new(t0())),
    );
    h.answering().await;

    h.orchestrator
        .handle(SessionInput::Channel(ChannelEvent::WarningIssued(
            ContentVerdict {
                warning_issued: true,
                warning_count: Some(2),
                ..ContentVerdict::default()
            },
        )))
        .await;
    assert_eq!(h.session().warning.warning_count, 2);

    h.orchestrator
        .handle(SessionInput::Channel(ChannelEvent::WarningIssued(
            ContentVerdict {
                warning_issued: true,
                warning_count: Some(1),
                ..ContentVerdict::default()
            },
        )))
        .await;
    assert_eq!(h.session().warning.warning_count, 3);
    assert!(h.session().warning.can_continue);
}

#[tokio::test]
async fn question_limit_completes_the_session() {
    let mut config = SessionConfig::default();
    config.interview.max_questions = 1;
    let mut h = Harness::with_config(
        Harness::acknowledged_store(),
        Arc::new(ManualClock::new(t0())),
        config,
    );
    h.answering().await;
    h.answer("q1", "Final answer").await;

    h.orchestrator
        .handle(SessionInput::Channel(ChannelEvent::AnswerSubmitted(
            AnswerOutcome {
                question_id: "q1".into(),
                verdict: ContentVerdict::default(),
                next: None,
            },
        )))
        .await;

    assert_eq!(
        h.orchestrator.phase(),
        Phase::Completed(CompletionReason::QuestionLimit)
    );
    assert_eq!(h.channel.end_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn countdown_expiry_ends_the_session() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mut h = Harness::new(Harness::acknowledged_store(), clock.clone());
    h.answering().await;

    clock.advance(Duration::from_secs(30 * 60));
    h.orchestrator.tick().await;

    assert_eq!(
        h.orchestrator.phase(),
        Phase::Completed(CompletionReason::TimeExpired)
    );
    assert_eq!(Harness::exits(&h.drain()), vec![ExitReason::Expired]);
    assert_eq!(h.channel.end_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.media.releases.load(Ordering::SeqCst), 1);
}
