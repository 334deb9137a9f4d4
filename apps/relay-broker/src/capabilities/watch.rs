use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::activity::{Activity, Run, Signal};
use crate::capability::{Capability, Topic};
use crate::collaborator::Collaborator;
use crate::heartbeat::DeviceType;
use crate::session::SessionContext;
use crate::store::FrameSource;

pub const WATCHING_STARTED: &str = "WatchingStarted";
pub const WATCHING_DONE: &str = "WatchingDone";
pub const PICTURE_TOPIC: &str = "picture_newfile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchTopic {
    Events,
    ImageAvailable,
    TakePicture,
}

impl Topic for WatchTopic {
    const ALL: &'static [Self] = &[
        WatchTopic::Events,
        WatchTopic::ImageAvailable,
        WatchTopic::TakePicture,
    ];

    fn as_str(self) -> &'static str {
        match self {
            WatchTopic::Events => "events",
            WatchTopic::ImageAvailable => "image_available",
            WatchTopic::TakePicture => "action_take_picture",
        }
    }

    fn is_control(self) -> bool {
        matches!(self, WatchTopic::Events)
    }
}

/// Which camera-driven analysis a watch session runs; also the prefix of
/// the `<Label>Started` / `<Label>Done` events it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchLabel {
    FaceRecognition,
    PeopleDetection,
    EmotionDetection,
}

impl WatchLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchLabel::FaceRecognition => "FaceRecognition",
            WatchLabel::PeopleDetection => "PeopleDetection",
            WatchLabel::EmotionDetection => "EmotionDetection",
        }
    }

    /// Topic a collaborator result lands on when it names none.
    pub fn outcome_topic(self) -> &'static str {
        match self {
            WatchLabel::FaceRecognition => "recognised_face",
            WatchLabel::PeopleDetection => "detected_person",
            WatchLabel::EmotionDetection => "detected_emotion",
        }
    }

    pub fn started_event(self) -> String {
        format!("{}Started", self.as_str())
    }

    pub fn done_event(self) -> String {
        format!("{}Done", self.as_str())
    }
}

impl fmt::Display for WatchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumes camera frames while watching is on, feeding each to the
/// collaborator and publishing what it reports.
pub struct Watch {
    label: WatchLabel,
    frames: Arc<dyn FrameSource>,
    collaborator: Arc<dyn Collaborator>,
    watching: Activity,
    frame_ready: Signal,
    save_next: AtomicBool,
}

impl Watch {
    pub fn new(
        label: WatchLabel,
        frames: Arc<dyn FrameSource>,
        collaborator: Arc<dyn Collaborator>,
    ) -> Self {
        Self {
            label,
            frames,
            collaborator,
            watching: Activity::new(),
            frame_ready: Signal::new(),
            save_next: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> WatchLabel {
        self.label
    }

    pub fn is_watching(&self) -> bool {
        self.watching.is_active()
    }

    pub fn frame_pending(&self) -> bool {
        self.frame_ready.is_raised()
    }

    async fn on_event(&self, ctx: &SessionContext, payload: &[u8]) -> anyhow::Result<()> {
        let event = String::from_utf8_lossy(payload);
        match event.trim() {
            WATCHING_STARTED => {
                let Some(run) = self.watching.try_start() else {
                    info!(identifier = %ctx.identifier(), label = %self.label, "already watching");
                    return Ok(());
                };
                self.watch(ctx, run).await
            }
            WATCHING_DONE => {
                if !self.watching.try_stop() {
                    info!(identifier = %ctx.identifier(), label = %self.label, "not watching; stop ignored");
                }
                Ok(())
            }
            other => {
                debug!(identifier = %ctx.identifier(), event = other, "event ignored");
                Ok(())
            }
        }
    }

    /// Drives `run` to its end. Only this run's flag is cleared on exit; a
    /// start that arrived meanwhile keeps its own.
    async fn watch(&self, ctx: &SessionContext, run: Run) -> anyhow::Result<()> {
        let result = match ctx.produce_event(&self.label.started_event()).await {
            Ok(()) => {
                info!(identifier = %ctx.identifier(), label = %self.label, run = run.epoch(), "watching started");
                self.consume_frames(ctx, &run).await;
                Ok(())
            }
            Err(err) => Err(err.into()),
        };
        self.watching.finish(&run);
        if self.frame_ready.is_raised() {
            // hand the pending frame to the next run's loop
            self.frame_ready.wake();
        }
        if ctx.is_cancelled() {
            return result;
        }
        ctx.produce_event(&self.label.done_event()).await?;
        info!(identifier = %ctx.identifier(), label = %self.label, run = run.epoch(), "watching done");
        result
    }

    async fn consume_frames(&self, ctx: &SessionContext, run: &Run) {
        while !run.is_stopped() && !ctx.is_cancelled() {
            if self.frame_ready.take() {
                if let Err(err) = self.process_frame(ctx).await {
                    warn!(identifier = %ctx.identifier(), label = %self.label, error = %err, "frame processing failed");
                }
                continue;
            }
            tokio::select! {
                _ = self.frame_ready.wait() => {}
                _ = run.stopped() => break,
                _ = ctx.cancelled() => break,
            }
        }
    }

    async fn process_frame(&self, ctx: &SessionContext) -> anyhow::Result<()> {
        let Some(frame) = self.frames.latest_frame(ctx.identifier()).await? else {
            debug!(identifier = %ctx.identifier(), "frame announced but not stored");
            return Ok(());
        };
        if self.save_next.swap(false, Ordering::AcqRel) {
            ctx.publish(PICTURE_TOPIC, frame.clone()).await?;
            info!(identifier = %ctx.identifier(), bytes = frame.len(), "picture published");
        }
        let outcomes = self.collaborator.invoke(ctx.identifier(), frame).await?;
        for outcome in outcomes {
            ctx.publish(&outcome.topic, outcome.payload).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Capability for Watch {
    type Topic = WatchTopic;

    fn device_type(&self) -> DeviceType {
        DeviceType::Cam
    }

    async fn handle(
        self: Arc<Self>,
        ctx: SessionContext,
        topic: WatchTopic,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        match topic {
            WatchTopic::Events => self.on_event(&ctx, &payload).await,
            WatchTopic::ImageAvailable => {
                self.frame_ready.raise();
                Ok(())
            }
            WatchTopic::TakePicture => {
                self.save_next.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    async fn teardown(&self) {
        self.watching.try_stop();
    }
}
