use std::time::Duration;

use anyhow::{ensure, Context};
use clap::ValueEnum;

use crate::broker::BrokerSettings;
use crate::capabilities::{WatchLabel, SENTIMENT_TOPIC};
use crate::cli::ServeArgs;
use crate::liveness::LivenessConfig;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceKind {
    FaceRecognition,
    PeopleDetection,
    EmotionDetection,
    RobotMemory,
    Sentiment,
}

impl ServiceKind {
    pub fn default_registration_channel(self) -> &'static str {
        match self {
            ServiceKind::FaceRecognition => "face_recognition",
            ServiceKind::PeopleDetection => "people_detection",
            ServiceKind::EmotionDetection => "emotion_detection",
            ServiceKind::RobotMemory => "robot_memory",
            ServiceKind::Sentiment => "sentiment_analysis",
        }
    }

    pub fn watch_label(self) -> Option<WatchLabel> {
        match self {
            ServiceKind::FaceRecognition => Some(WatchLabel::FaceRecognition),
            ServiceKind::PeopleDetection => Some(WatchLabel::PeopleDetection),
            ServiceKind::EmotionDetection => Some(WatchLabel::EmotionDetection),
            ServiceKind::RobotMemory | ServiceKind::Sentiment => None,
        }
    }

    /// Topic collaborator results default to, for services that have one.
    pub fn outcome_topic(self) -> Option<&'static str> {
        match self {
            ServiceKind::Sentiment => Some(SENTIMENT_TOPIC),
            ServiceKind::RobotMemory => None,
            watcher => watcher.watch_label().map(WatchLabel::outcome_topic),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis_url: String,
    pub service: ServiceKind,
    pub settings: BrokerSettings,
    pub collaborator: Option<CollaboratorConfig>,
}

impl TryFrom<ServeArgs> for BrokerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        ensure!(args.stale_after_secs > 0, "stale-after must be positive");
        ensure!(args.poll_interval_ms > 0, "poll interval must be positive");
        ensure!(args.max_in_flight > 0, "max-in-flight must be positive");
        ensure!(
            args.collaborator_timeout_secs > 0,
            "collaborator timeout must be positive"
        );

        let registration_channel = args
            .registration_channel
            .unwrap_or_else(|| args.service.default_registration_channel().to_string());
        ensure!(
            !registration_channel.trim().is_empty(),
            "registration channel must not be empty"
        );

        let collaborator = args
            .collaborator
            .filter(|command| !command.trim().is_empty())
            .map(|command| CollaboratorConfig {
                command,
                timeout: Duration::from_secs(args.collaborator_timeout_secs),
            });

        redis::Client::open(args.redis_url.as_str())
            .with_context(|| format!("invalid redis url: {}", args.redis_url))?;

        Ok(BrokerConfig {
            redis_url: args.redis_url,
            service: args.service,
            settings: BrokerSettings {
                registration_channel,
                session: SessionConfig {
                    liveness: LivenessConfig {
                        stale_after: Duration::from_secs(args.stale_after_secs),
                        poll_interval: Duration::from_millis(args.poll_interval_ms),
                    },
                    max_in_flight: args.max_in_flight,
                },
            },
            collaborator,
        })
    }
}
