// End-to-end flows over one mapped log: offer/poll, fragmentation, rotation,
// drain and reclaim, revoke, cool-down, untethered eviction, position limits.
use std::path::PathBuf;

use rillite::api::{
    ClaimResult, CountersManager, Image, NoopListener, Publication, PublicationParams,
    PublicationState, Publisher, SystemCounters, TetherState, ADMIN_ACTION, MAX_POSITION_EXCEEDED,
    NOT_CONNECTED,
};

const TERM_LENGTH: i32 = 65536;
const MTU_LENGTH: i32 = 4096;
const MAX_PAYLOAD: usize = MTU_LENGTH as usize - 32;

fn params() -> PublicationParams {
    PublicationParams {
        term_length: TERM_LENGTH,
        mtu_length: MTU_LENGTH,
        initial_term_id: 7,
        session_id: 17,
        stream_id: 1001,
        channel: "ipc".to_string(),
        ..PublicationParams::default()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    path: PathBuf,
    counters: CountersManager,
    publication: Publication,
}

fn harness_with(params: PublicationParams) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("1.logbuffer");
    let counters = CountersManager::new(32);
    let system = SystemCounters::new(&counters).expect("system counters");
    let publication = Publication::create(
        &path,
        1,
        &params,
        &counters,
        system,
        Box::new(NoopListener),
        0,
    )
    .expect("create publication");
    Harness {
        _dir: dir,
        path,
        counters,
        publication,
    }
}

fn harness() -> Harness {
    harness_with(params())
}

fn attach(harness: &mut Harness, registration_id: i64) -> (Publisher, Image) {
    let image = harness
        .publication
        .link_subscriber(registration_id, true, 0)
        .expect("link subscriber");
    harness.publication.update_pub_pos_and_lmt();
    let publisher = harness.publication.publisher().expect("publisher");
    (publisher, image)
}

#[test]
fn offer_then_poll_round_trips_one_frame() {
    let mut harness = harness();
    let (publisher, mut image) = attach(&mut harness, 100);

    let position = publisher.offer(&[0xAB; 100]).expect("offer");
    assert_eq!(position, 128);

    harness.publication.update_pub_pos_and_lmt();
    assert_eq!(
        harness.publication.publisher_position_counter().get_acquire(),
        128
    );

    let mut frames = Vec::new();
    let read = image.poll(
        |frame| {
            frames.push((
                frame.position,
                frame.session_id,
                frame.stream_id,
                frame.flags,
                frame.payload.to_vec(),
            ));
        },
        10,
    );
    assert_eq!(read, 1);
    assert_eq!(frames.len(), 1);
    let (frame_position, session_id, stream_id, flags, payload) = &frames[0];
    assert_eq!(*frame_position, 0);
    assert_eq!(*session_id, 17);
    assert_eq!(*stream_id, 1001);
    // A lone frame is both the beginning and the end of its message.
    assert_eq!(*flags, 0xC0);
    assert_eq!(payload.as_slice(), &[0xAB; 100]);
    assert_eq!(image.position(), 128);
}

#[test]
fn max_payload_is_a_single_frame_and_one_byte_more_fragments() {
    let mut harness = harness();
    let (publisher, mut image) = attach(&mut harness, 100);

    publisher.offer(&vec![1u8; MAX_PAYLOAD]).expect("offer");
    let mut flags = Vec::new();
    image.poll(|frame| flags.push(frame.flags), 10);
    assert_eq!(flags, vec![0xC0]);

    let message: Vec<u8> = (0..MAX_PAYLOAD + 1).map(|i| i as u8).collect();
    publisher.offer(&message).expect("offer");

    let mut fragments = Vec::new();
    image.poll(
        |frame| fragments.push((frame.flags, frame.payload.to_vec())),
        10,
    );
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].0, 0x80);
    assert_eq!(fragments[0].1.len(), MAX_PAYLOAD);
    assert_eq!(fragments[1].0, 0x40);
    assert_eq!(fragments[1].1.len(), 1);

    let mut reassembled = fragments[0].1.clone();
    reassembled.extend_from_slice(&fragments[1].1);
    assert_eq!(reassembled, message);
}

#[test]
fn stream_continues_seamlessly_across_rotation() {
    let mut harness = harness();
    let (publisher, mut image) = attach(&mut harness, 100);

    let mut offered = Vec::new();
    let mut received = Vec::new();
    let mut sequence = 0u32;
    // Enough traffic to cross two term boundaries.
    while publisher.position() < 2 * TERM_LENGTH as i64 + 1024 {
        let mut message = vec![0u8; 1000];
        message[..4].copy_from_slice(&sequence.to_le_bytes());
        loop {
            let position = publisher.offer(&message).expect("offer");
            if position >= 0 {
                break;
            }
            assert_eq!(position, ADMIN_ACTION);
        }
        offered.push(message);
        sequence += 1;

        image.poll(|frame| received.push(frame.payload.to_vec()), 16);
        harness.publication.update_pub_pos_and_lmt();
    }
    while image.position() < publisher.position() {
        image.poll(|frame| received.push(frame.payload.to_vec()), 64);
    }

    assert_eq!(received, offered);
    assert_eq!(image.position(), publisher.position());
}

#[test]
fn drained_publication_lingers_then_dies_and_is_reclaimed() {
    let mut harness = harness();
    let (publisher, mut image) = attach(&mut harness, 100);

    publisher.offer(b"last words").expect("offer");
    harness.publication.decr_ref(1_000);
    assert_eq!(harness.publication.state(), PublicationState::Draining);
    assert!(!image.is_end_of_stream());

    // Still draining until the subscriber catches up.
    harness.publication.on_time_event(2_000);
    assert_eq!(harness.publication.state(), PublicationState::Draining);

    let mut count = 0;
    image.poll(|_| count += 1, 10);
    assert_eq!(count, 1);
    assert!(image.is_end_of_stream());

    harness.publication.on_time_event(3_000);
    assert_eq!(harness.publication.state(), PublicationState::Linger);

    let liveness = params().liveness_timeout_ns;
    harness.publication.on_time_event(3_000 + liveness);
    assert_eq!(harness.publication.state(), PublicationState::Done);
    assert!(harness.publication.has_reached_end_of_life());

    harness.publication.free().expect("free");
    assert!(!harness.path.exists());
    // Only the two system counters remain allocated.
    for _ in 0..harness.counters.capacity() - 2 {
        harness.counters.allocate().expect("allocate");
    }
}

#[test]
fn revoked_publication_stops_subscribers_at_the_revoke_point() {
    let mut harness = harness();
    let (publisher, mut image) = attach(&mut harness, 100);

    publisher.offer(&[1u8; 100]).expect("offer");
    harness.publication.revoke(1_000);
    assert_eq!(harness.publication.state(), PublicationState::Draining);

    let mut count = 0;
    image.poll(|_| count += 1, 10);
    assert_eq!(count, 1);
    assert!(image.is_end_of_stream());
    assert_eq!(image.end_of_stream_position(), 128);
}

#[test]
fn rejected_publication_cools_down_then_accepts_again() {
    let mut harness = harness();
    harness.publication.reject(0, "malformed image", 10_000);

    assert!(harness.publication.in_cool_down());
    assert!(!harness.publication.is_accepting_subscriptions());

    let liveness = params().liveness_timeout_ns;
    harness.publication.on_time_event(10_001 + liveness);
    assert!(harness.publication.is_accepting_subscriptions());
    harness
        .publication
        .link_subscriber(200, true, 20_000)
        .expect("link after cool-down");
}

#[test]
fn lagging_untethered_subscriber_frees_the_producer() {
    let mut harness = harness();
    let mut tethered = harness
        .publication
        .link_subscriber(100, true, 0)
        .expect("link tethered");
    let lagging = harness
        .publication
        .link_subscriber(200, false, 0)
        .expect("link untethered");
    harness.publication.update_pub_pos_and_lmt();
    let publisher = harness.publication.publisher().expect("publisher");

    // Fill the window; the untethered subscriber never reads.
    let chunk = vec![0u8; MAX_PAYLOAD];
    loop {
        let position = publisher.offer(&chunk).expect("offer");
        if position < 0 {
            break;
        }
        tethered.set_position(publisher.position()).expect("seek");
        harness.publication.update_pub_pos_and_lmt();
    }
    assert_eq!(lagging.position(), 0);

    let defaults = params();
    let mut now = defaults.untethered_window_limit_timeout_ns;
    harness.publication.on_time_event(now);
    now += defaults.untethered_linger_timeout_ns;
    harness.publication.on_time_event(now);

    // Resting: excluded from the limit, so the producer is free to continue.
    harness.publication.update_pub_pos_and_lmt();
    let position = publisher.offer(&chunk).expect("offer");
    assert!(position > 0, "expected progress, got {position}");

    now += defaults.untethered_resting_timeout_ns;
    harness.publication.on_time_event(now);
    assert_eq!(harness.publication.subscriber_count(), 1);
}

#[test]
fn abandoned_claim_is_padded_over_after_the_unblock_timeout() {
    let mut harness = harness();
    let (publisher, mut image) = attach(&mut harness, 100);

    // A writer claims space and dies without committing.
    let ClaimResult::Claimed(claim) = publisher.try_claim(1000).expect("claim") else {
        panic!("claim refused");
    };
    drop(claim);

    // A second writer appends beyond the hole.
    let position = publisher.offer(b"beyond the hole").expect("offer");
    assert!(position > 0);

    // Readers cannot get past the hole.
    let mut count = 0;
    image.poll(|_| count += 1, 10);
    assert_eq!(count, 0);
    assert_eq!(image.position(), 0);

    let timeout = params().unblock_timeout_ns;
    harness.publication.on_time_event(1_000);
    harness.publication.on_time_event(2_000 + timeout);

    // The hole is now padding; the committed frame is reachable.
    let mut payloads = Vec::new();
    image.poll(|frame| payloads.push(frame.payload.to_vec()), 10);
    assert_eq!(payloads, vec![b"beyond the hole".to_vec()]);
}

#[test]
fn stalled_claim_during_draining_waits_out_the_unblock_timeout() {
    let mut harness = harness();
    let (publisher, mut image) = attach(&mut harness, 100);

    // A writer claims space and dies; then the last producer reference drops.
    let ClaimResult::Claimed(claim) = publisher.try_claim(1000).expect("claim") else {
        panic!("claim refused");
    };
    drop(claim);
    harness.publication.decr_ref(1_000);
    assert_eq!(harness.publication.state(), PublicationState::Draining);

    // The hole blocks draining, but a merely slow writer gets the full
    // unblock timeout before anything is padded.
    let timeout = params().unblock_timeout_ns;
    harness.publication.on_time_event(2_000);
    harness.publication.on_time_event(2_000 + timeout / 2);
    let mut count = 0;
    image.poll(|_| count += 1, 10);
    assert_eq!(count, 0);
    assert_eq!(image.position(), 0);
    assert_eq!(harness.publication.state(), PublicationState::Draining);

    // Once the stall has lasted the full timeout the hole becomes padding
    // and the reader sails through to the producer position.
    harness.publication.on_time_event(3_000 + timeout);
    image.poll(|_| count += 1, 10);
    assert_eq!(count, 0);
    assert_eq!(image.position(), publisher.position());

    harness.publication.on_time_event(4_000 + timeout);
    assert_eq!(harness.publication.state(), PublicationState::Linger);
}

#[test]
fn position_space_exhaustion_is_terminal() {
    let mut custom = params();
    custom.is_exclusive = true;
    custom.has_position = true;
    custom.term_id = custom.initial_term_id.wrapping_add(i32::MAX);
    custom.term_offset = TERM_LENGTH - 64;
    let mut harness = harness_with(custom);
    let (publisher, _image) = attach(&mut harness, 100);

    // The final frame of the final term fits exactly.
    let position = publisher.offer(&[0u8; 32]).expect("offer");
    assert_eq!(position, (TERM_LENGTH as i64) << 31);

    // Nothing fits beyond the end of position space.
    let position = publisher.offer(&[0u8; 32]).expect("offer");
    assert_eq!(position, MAX_POSITION_EXCEEDED);
}

#[test]
fn publication_without_subscribers_goes_not_connected_after_one_cycle() {
    let mut harness = harness();
    let publisher = harness.publication.publisher().expect("publisher");

    // Creation grants one window of credit before the first duty cycle.
    assert_eq!(publisher.offer(b"credit").expect("offer"), 64);

    harness.publication.update_pub_pos_and_lmt();
    assert_eq!(publisher.offer(b"gone").expect("offer"), NOT_CONNECTED);
    assert_eq!(harness.publication.state(), PublicationState::Active);
}

#[test]
fn tether_states_are_reported_through_the_capability_record() {
    use std::sync::{Arc, Mutex};

    struct Recorder {
        states: Arc<Mutex<Vec<TetherState>>>,
        removed: Arc<Mutex<Vec<i64>>>,
    }

    impl rillite::api::LifecycleListener for Recorder {
        fn untethered_state_change(
            &mut self,
            _event: &rillite::api::TetherEvent,
            new_state: TetherState,
        ) {
            self.states.lock().expect("lock").push(new_state);
        }

        fn untethered_subscription_removed(&mut self, event: &rillite::api::TetherEvent) {
            self.removed
                .lock()
                .expect("lock")
                .push(event.registration_id);
        }
    }

    let states = Arc::new(Mutex::new(Vec::new()));
    let removed = Arc::new(Mutex::new(Vec::new()));

    let dir = tempfile::tempdir().expect("tempdir");
    let counters = CountersManager::new(32);
    let system = SystemCounters::new(&counters).expect("system counters");
    let mut publication = Publication::create(
        dir.path().join("1.logbuffer"),
        1,
        &params(),
        &counters,
        system,
        Box::new(Recorder {
            states: Arc::clone(&states),
            removed: Arc::clone(&removed),
        }),
        0,
    )
    .expect("create publication");

    let mut tethered = publication.link_subscriber(1, true, 0).expect("link");
    let _lagging = publication.link_subscriber(2, false, 0).expect("link");
    publication.update_pub_pos_and_lmt();
    let publisher = publication.publisher().expect("publisher");

    let chunk = vec![0u8; MAX_PAYLOAD];
    loop {
        let position = publisher.offer(&chunk).expect("offer");
        if position < 0 {
            break;
        }
        tethered.set_position(publisher.position()).expect("seek");
        publication.update_pub_pos_and_lmt();
    }

    let defaults = params();
    let mut now = defaults.untethered_window_limit_timeout_ns;
    publication.on_time_event(now);
    now += defaults.untethered_linger_timeout_ns;
    publication.on_time_event(now);
    now += defaults.untethered_resting_timeout_ns;
    publication.on_time_event(now);

    assert_eq!(
        states.lock().expect("lock").as_slice(),
        &[TetherState::Linger, TetherState::Resting]
    );
    assert_eq!(removed.lock().expect("lock").as_slice(), &[2]);
}
