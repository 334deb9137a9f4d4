mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_broker::capabilities::{Watch, WatchLabel};
use relay_broker::collaborator::{Collaborator, Outcome};
use relay_broker::heartbeat::DeviceType;
use relay_broker::store::InMemoryStore;
use relay_broker::{Broker, BrokerError, BrokerSettings, Identifier, SessionConfig};
use relay_bus::{Bus, ChannelFilter, LocalBus, LocalConnection, Subscription};
use tokio::sync::Semaphore;

use common::{fresh_beat, next_on, wait_until};

/// Names every frame after the user part of the identifier. A gated
/// recognizer holds each frame until the test adds a permit.
#[derive(Default)]
struct Recognizer {
    frames: AtomicUsize,
    gate: Option<Semaphore>,
}

impl Recognizer {
    fn gated() -> Self {
        Self {
            frames: AtomicUsize::new(0),
            gate: Some(Semaphore::new(0)),
        }
    }

    fn release_one(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl Collaborator for Recognizer {
    async fn invoke(&self, identifier: &Identifier, input: Bytes) -> anyhow::Result<Vec<Outcome>> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        Ok(vec![Outcome::new(
            "recognised_face",
            format!("{}:{}", identifier.user(), input.len()),
        )])
    }
}

type WatchFactory = Box<dyn Fn(&Identifier) -> Result<Watch, BrokerError> + Send + Sync>;

struct Scene {
    bus: LocalBus,
    store: Arc<InMemoryStore>,
    recognizer: Arc<Recognizer>,
    broker: Broker<WatchFactory>,
    alice: Identifier,
    _observer: LocalConnection,
    events: Subscription,
}

async fn scene() -> Scene {
    scene_with(Recognizer::default()).await
}

async fn scene_with(recognizer: Recognizer) -> Scene {
    let bus = LocalBus::new();
    let store = Arc::new(InMemoryStore::new());
    let recognizer = Arc::new(recognizer);
    let frames = Arc::clone(&store);
    let collaborator = Arc::clone(&recognizer);
    let factory: WatchFactory = Box::new(move |_: &Identifier| {
        Ok(Watch::new(
            WatchLabel::FaceRecognition,
            frames.clone(),
            collaborator.clone(),
        ))
    });
    let broker = Broker::start(
        factory,
        Arc::new(bus.clone()),
        store.clone(),
        BrokerSettings {
            registration_channel: "face_recognition".into(),
            session: SessionConfig::default(),
        },
    )
    .await
    .expect("broker starts");

    let alice = fresh_beat(&store, "alice-AABBCC", DeviceType::Cam).await;
    let observer = bus.connection();
    let events = observer
        .subscribe(vec![ChannelFilter::parse("alice-AABBCC_*")])
        .await
        .unwrap();
    bus.deliver("face_recognition", "alice-AABBCC");
    wait_until(|| broker.session(&alice).is_some()).await;

    Scene {
        bus,
        store,
        recognizer,
        broker,
        alice,
        _observer: observer,
        events,
    }
}

async fn next_event(scene: &mut Scene) -> String {
    let channel = scene.alice.channel("events");
    next_on(&mut scene.events, &channel).await.text().into_owned()
}

/// Skips the commands the test itself sent on the events channel.
async fn next_produced_event(scene: &mut Scene) -> String {
    loop {
        let event = next_event(scene).await;
        if event != "WatchingStarted" && event != "WatchingDone" {
            return event;
        }
    }
}

#[test_timeout::tokio_timeout_test(10, multi_thread)]
async fn watching_started_and_done() {
    let mut s = scene().await;
    let session = s.broker.session(&s.alice).unwrap();
    let watch = Arc::clone(session.capability());

    s.bus.deliver(&s.alice.channel("events"), "WatchingStarted");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionStarted");
    assert!(watch.is_watching());

    s.store.put_frame(&s.alice, vec![7u8; 12]);
    s.bus.deliver(&s.alice.channel("image_available"), "");
    let recognised = next_on(&mut s.events, &s.alice.channel("recognised_face")).await;
    assert_eq!(recognised.text(), "alice:12");

    s.bus.deliver(&s.alice.channel("events"), "WatchingDone");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionDone");
    wait_until(|| !watch.is_watching()).await;

    s.broker.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10, multi_thread)]
async fn take_picture_publishes_next_frame() {
    let mut s = scene().await;
    s.bus.deliver(&s.alice.channel("events"), "WatchingStarted");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionStarted");

    s.store.put_frame(&s.alice, Bytes::from_static(b"jpeg-bytes"));
    s.bus.deliver(&s.alice.channel("action_take_picture"), "");
    // Give the picture flag a moment to land before the frame is announced.
    tokio::time::sleep(Duration::from_millis(20)).await;
    s.bus.deliver(&s.alice.channel("image_available"), "");

    let picture = next_on(&mut s.events, &s.alice.channel("picture_newfile")).await;
    assert_eq!(&picture.payload[..], b"jpeg-bytes");

    s.broker.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10, multi_thread)]
async fn second_start_is_ignored() {
    let mut s = scene().await;
    let session = s.broker.session(&s.alice).unwrap();
    let watch = Arc::clone(session.capability());

    s.bus.deliver(&s.alice.channel("events"), "WatchingStarted");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionStarted");
    s.bus.deliver(&s.alice.channel("events"), "WatchingStarted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(watch.is_watching());

    s.bus.deliver(&s.alice.channel("events"), "WatchingDone");
    // A restart would have produced a second Started before the Done.
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionDone");

    s.bus.deliver(&s.alice.channel("events"), "WatchingDone");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!watch.is_watching());
    s.broker.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10, multi_thread)]
async fn cleanup_releases_a_waiting_watch_loop() {
    let mut s = scene().await;
    let session = s.broker.session(&s.alice).unwrap();
    let watch = Arc::clone(session.capability());

    s.bus.deliver(&s.alice.channel("events"), "WatchingStarted");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionStarted");

    session.cleanup().await;
    assert!(!watch.is_watching());
    assert!(!s.broker.is_active(&s.alice));
    assert_eq!(s.recognizer.frames.load(Ordering::SeqCst), 0);
    s.broker.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10, multi_thread)]
async fn restart_while_old_loop_is_busy_keeps_one_loop() {
    let mut s = scene_with(Recognizer::gated()).await;
    let session = s.broker.session(&s.alice).unwrap();
    let watch = Arc::clone(session.capability());

    s.bus.deliver(&s.alice.channel("events"), "WatchingStarted");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionStarted");

    // Park the first loop inside the recognizer.
    s.store.put_frame(&s.alice, vec![1u8; 4]);
    s.bus.deliver(&s.alice.channel("image_available"), "");
    let recognizer = Arc::clone(&s.recognizer);
    wait_until(|| recognizer.frames.load(Ordering::SeqCst) == 1).await;

    s.bus.deliver(&s.alice.channel("events"), "WatchingDone");
    wait_until(|| !watch.is_watching()).await;
    s.bus.deliver(&s.alice.channel("events"), "WatchingStarted");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionStarted");
    assert!(watch.is_watching());

    // The first loop finishes its frame, notices its run ended and leaves
    // without touching the new run.
    s.recognizer.release_one();
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionDone");
    assert!(watch.is_watching());

    s.bus.deliver(&s.alice.channel("events"), "WatchingDone");
    assert_eq!(next_produced_event(&mut s).await, "FaceRecognitionDone");
    wait_until(|| !watch.is_watching()).await;

    s.broker.shutdown().await;
}
