//! Purpose: Tie one mapped log to its producers, consumers, and conductor state.
//! Exports: `Publication` (driver side), `Publisher` (append side), `Image`
//! (consume side), offer sentinels, `LifecycleListener`, `SystemCounters`.
//! Role: The heart of the engine; owns flow control, lifecycle, and recovery.
//! Invariants: Only the conductor mutates lifecycle fields and the limit counter;
//! writers read the limit and advance raw tails, nothing else.
//! Invariants: A publication in `Done` has reached end of life and owns no
//! subscriber counters.
use std::path::Path;

use crate::core::appender::{AppendOutcome, BufferClaim, ClaimOutcome, TermAppender};
use crate::core::counters::{CountersManager, Position, ReadablePosition};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};
use crate::core::log_buffer::{self, RawLog};
use crate::core::params::PublicationParams;
use crate::core::position::{
    align, compute_position, compute_term_begin_position, compute_term_count, index_by_position,
    index_by_term_count, max_possible_position, position_bits_to_shift, term_id, term_offset,
};
use crate::core::reader::{read_frames, FrameRef};
use crate::core::subscribable::{Subscribable, TetherState, TetherablePosition};
use crate::core::unblocker::{self, UnblockOutcome};

pub const NOT_CONNECTED: i64 = -1;
pub const BACK_PRESSURED: i64 = -2;
pub const ADMIN_ACTION: i64 = -3;
pub const CLOSED: i64 = -4;
pub const MAX_POSITION_EXCEEDED: i64 = -5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublicationState {
    Active,
    Draining,
    Linger,
    Done,
}

/// Details handed to lifecycle notifications for an untethered subscriber.
#[derive(Debug)]
pub struct TetherEvent {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub position: i64,
    pub now_ns: i64,
}

/// Capability record attached to a publication at construction. Default
/// methods make every notification optional.
pub trait LifecycleListener {
    fn untethered_state_change(&mut self, _event: &TetherEvent, _new_state: TetherState) {}
    fn untethered_subscription_removed(&mut self, _event: &TetherEvent) {}
    fn publisher_unblocked(&mut self, _session_id: i32, _stream_id: i32, _position: i64) {}
    fn publication_revoked(&mut self, _session_id: i32, _stream_id: i32, _position: i64) {}
    fn publication_rejected(
        &mut self,
        _session_id: i32,
        _stream_id: i32,
        _position: i64,
        _reason: &str,
    ) {
    }
    fn reached_end_of_life(&mut self, _session_id: i32, _stream_id: i32, _position: i64) {}
}

#[derive(Default)]
pub struct NoopListener;

impl LifecycleListener for NoopListener {}

/// Driver-wide counters shared by every publication.
#[derive(Clone, Debug)]
pub struct SystemCounters {
    pub unblocked_publications: Position,
    pub publications_revoked: Position,
}

impl SystemCounters {
    pub fn new(counters: &CountersManager) -> Result<Self, Error> {
        Ok(Self {
            unblocked_publications: counters.allocate()?,
            publications_revoked: counters.allocate()?,
        })
    }
}

#[derive(Debug)]
struct ConductorFields {
    state: PublicationState,
    refcnt: i32,
    has_reached_end_of_life: bool,
    trip_limit: i64,
    clean_position: i64,
    consumer_position: i64,
    last_consumer_position: i64,
    time_of_last_consumer_position_change_ns: i64,
    time_of_last_state_change_ns: i64,
    in_cool_down: bool,
    cool_down_expire_time_ns: i64,
    subscribable: Subscribable,
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("raw_log", &self.raw_log)
            .field("counters", &self.counters)
            .field("system", &self.system)
            .field("pub_pos", &self.pub_pos)
            .field("pub_lmt", &self.pub_lmt)
            .field("registration_id", &self.registration_id)
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("initial_term_id", &self.initial_term_id)
            .field("position_bits_to_shift", &self.position_bits_to_shift)
            .field("term_window_length", &self.term_window_length)
            .field("trip_gain", &self.trip_gain)
            .field("liveness_timeout_ns", &self.liveness_timeout_ns)
            .field("unblock_timeout_ns", &self.unblock_timeout_ns)
            .field(
                "untethered_window_limit_timeout_ns",
                &self.untethered_window_limit_timeout_ns,
            )
            .field(
                "untethered_linger_timeout_ns",
                &self.untethered_linger_timeout_ns,
            )
            .field(
                "untethered_resting_timeout_ns",
                &self.untethered_resting_timeout_ns,
            )
            .field("is_exclusive", &self.is_exclusive)
            .field("tag", &self.tag)
            .field("channel", &self.channel)
            .field("conductor", &self.conductor)
            .finish()
    }
}

pub struct Publication {
    raw_log: RawLog,
    counters: CountersManager,
    system: SystemCounters,
    listener: Box<dyn LifecycleListener>,
    pub_pos: Position,
    pub_lmt: Position,
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    term_window_length: i64,
    trip_gain: i64,
    liveness_timeout_ns: i64,
    unblock_timeout_ns: i64,
    untethered_window_limit_timeout_ns: i64,
    untethered_linger_timeout_ns: i64,
    untethered_resting_timeout_ns: i64,
    is_exclusive: bool,
    tag: i64,
    channel: String,
    conductor: ConductorFields,
}

impl Publication {
    /// Validate params, create and map the log, and seed both position
    /// counters. The fresh publication starts `Active` with one reference.
    pub fn create(
        path: impl AsRef<Path>,
        registration_id: i64,
        params: &PublicationParams,
        counters: &CountersManager,
        system: SystemCounters,
        listener: Box<dyn LifecycleListener>,
        now_ns: i64,
    ) -> Result<Self, Error> {
        params.validate()?;
        let raw_log = RawLog::create(&path, params, registration_id)?;

        let pub_pos = match counters.allocate() {
            Ok(position) => position,
            Err(err) => {
                let _ = raw_log.free();
                return Err(err);
            }
        };
        let pub_lmt = match counters.allocate() {
            Ok(position) => position,
            Err(err) => {
                let _ = counters.free(pub_pos.id());
                let _ = raw_log.free();
                return Err(err);
            }
        };

        let bits_to_shift = position_bits_to_shift(params.term_length);
        let starting_position = compute_position(
            params.starting_term_id(),
            params.starting_term_offset(),
            bits_to_shift,
            params.initial_term_id,
        );
        let term_window_length = params.term_window_length() as i64;

        // Producers get one window of credit up front; the first duty cycle
        // takes over from there.
        pub_pos.set_release(starting_position);
        pub_lmt.set_release(starting_position + term_window_length);

        Ok(Self {
            raw_log,
            counters: counters.clone(),
            system,
            listener,
            pub_pos,
            pub_lmt,
            registration_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            initial_term_id: params.initial_term_id,
            position_bits_to_shift: bits_to_shift,
            term_window_length,
            trip_gain: term_window_length / 8,
            liveness_timeout_ns: params.liveness_timeout_ns,
            unblock_timeout_ns: params.unblock_timeout_ns,
            untethered_window_limit_timeout_ns: params.untethered_window_limit_timeout_ns,
            untethered_linger_timeout_ns: params.untethered_linger_timeout_ns,
            untethered_resting_timeout_ns: params.untethered_resting_timeout_ns,
            is_exclusive: params.is_exclusive,
            tag: params.tag,
            channel: params.channel.clone(),
            conductor: ConductorFields {
                state: PublicationState::Active,
                refcnt: 1,
                has_reached_end_of_life: false,
                trip_limit: starting_position,
                clean_position: starting_position,
                consumer_position: starting_position,
                last_consumer_position: starting_position,
                time_of_last_consumer_position_change_ns: now_ns,
                time_of_last_state_change_ns: now_ns,
                in_cool_down: false,
                cool_down_expire_time_ns: 0,
                subscribable: Subscribable::new(),
            },
        })
    }

    /// Map an append handle over this publication's log. Static values come
    /// from the opened log's own metadata, as they would for a publisher in
    /// another process.
    pub fn publisher(&self) -> Result<Publisher, Error> {
        let raw_log = RawLog::open(self.raw_log.path())?;
        let term_length = raw_log.term_length();
        let initial_term_id = raw_log.metadata().initial_term_id();
        let mtu_length = raw_log.metadata().mtu_length() as usize;
        Ok(Publisher {
            raw_log,
            pub_lmt: self.pub_lmt.reader(),
            session_id: self.session_id,
            stream_id: self.stream_id,
            initial_term_id,
            position_bits_to_shift: position_bits_to_shift(term_length as i32),
            term_length,
            max_message_length: term_length / 8,
            max_payload_length: mtu_length - HEADER_LENGTH,
            channel: self.channel.clone(),
            closed: false,
        })
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn tag(&self) -> i64 {
        self.tag
    }

    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    pub fn state(&self) -> PublicationState {
        self.conductor.state
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.conductor.has_reached_end_of_life
    }

    pub fn consumer_position(&self) -> i64 {
        self.conductor.consumer_position
    }

    pub fn clean_position(&self) -> i64 {
        self.conductor.clean_position
    }

    pub fn subscriber_count(&self) -> usize {
        self.conductor.subscribable.len()
    }

    /// Observer handle for the producer position counter.
    pub fn publisher_position_counter(&self) -> ReadablePosition {
        self.pub_pos.reader()
    }

    /// Observer handle for the publication limit counter.
    pub fn publisher_limit_counter(&self) -> ReadablePosition {
        self.pub_lmt.reader()
    }

    /// Position derived from the active partition's raw tail.
    pub fn producer_position(&self) -> i64 {
        let meta = self.raw_log.metadata();
        let term_count = meta.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = meta.raw_tail_volatile(index);
        compute_position(
            term_id(raw_tail),
            term_offset(raw_tail, self.raw_log.term_length() as i64),
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    /// Position a fresh subscriber starts from: the slowest non-resting
    /// consumer, never ahead of the tracked consumer position.
    pub fn join_position(&self) -> i64 {
        self.conductor
            .subscribable
            .min_non_resting_position(self.conductor.consumer_position)
    }

    pub fn is_accepting_subscriptions(&self) -> bool {
        if self.conductor.in_cool_down {
            return false;
        }
        match self.conductor.state {
            PublicationState::Active => true,
            PublicationState::Draining => !self.is_drained(),
            _ => false,
        }
    }

    pub fn is_drained(&self) -> bool {
        let producer_position = self.producer_position();
        self.conductor
            .subscribable
            .all_caught_up_to(producer_position)
    }

    /// A producer may have died between reserving and committing when the
    /// stream stops making progress with the producer ahead of consumers, or
    /// with the consumers' term already rotated away under them.
    pub fn is_possibly_blocked(&self, producer_position: i64, consumer_position: i64) -> bool {
        let producer_term_count = self.raw_log.metadata().active_term_count();
        let expected_term_count = (consumer_position >> self.position_bits_to_shift) as i32;
        if producer_term_count != expected_term_count {
            return true;
        }
        producer_position > consumer_position
    }

    pub fn incr_ref(&mut self) {
        self.conductor.refcnt += 1;
    }

    /// Drop one producer reference; the last one starts draining and stamps
    /// the end-of-stream position for subscribers.
    pub fn decr_ref(&mut self, now_ns: i64) {
        self.conductor.refcnt -= 1;
        if self.conductor.refcnt <= 0 && self.conductor.state == PublicationState::Active {
            let producer_position = self.producer_position();
            self.raw_log
                .metadata()
                .end_of_stream_position_release(producer_position);
            self.conductor.state = PublicationState::Draining;
            self.conductor.time_of_last_state_change_ns = now_ns;
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.conductor.refcnt
    }

    /// Attach a consumer: allocate its position counter at the join position
    /// and raise the connected flag producers read.
    pub fn link_subscriber(
        &mut self,
        registration_id: i64,
        is_tether: bool,
        now_ns: i64,
    ) -> Result<Image, Error> {
        if !self.is_accepting_subscriptions() {
            return Err(Error::new(ErrorKind::Busy)
                .with_message("publication is not accepting subscriptions")
                .with_channel(self.channel.clone()));
        }

        let raw_log = RawLog::open(self.raw_log.path())?;
        let counter = self.counters.allocate()?;
        let join_position = self.join_position();
        counter.set_release(join_position);

        self.conductor.subscribable.add(TetherablePosition {
            counter_id: counter.id(),
            registration_id,
            is_tether,
            state: TetherState::Active,
            time_of_last_change_ns: now_ns,
            position: counter.reader(),
        });
        self.raw_log.metadata().is_connected_release(true);

        Ok(Image {
            raw_log,
            subscriber_position: counter,
            registration_id,
            session_id: self.session_id,
            stream_id: self.stream_id,
            initial_term_id: self.initial_term_id,
            position_bits_to_shift: self.position_bits_to_shift,
        })
    }

    /// Detach a consumer: one final limit update runs first so producers see
    /// an honest window, then the connected flag drops with the last leaver.
    pub fn unlink_subscriber(&mut self, registration_id: i64) -> Result<(), Error> {
        let entry = self
            .conductor
            .subscribable
            .remove(registration_id)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message("no such subscriber")
                    .with_channel(self.channel.clone())
            })?;

        self.update_pub_pos_and_lmt();
        if self.conductor.subscribable.is_empty() {
            self.raw_log.metadata().is_connected_release(false);
        }
        self.counters.free(entry.counter_id)
    }

    /// Per-duty-cycle flow control: push the producer position out, and lift
    /// the limit from the slowest non-resting consumer with trip hysteresis.
    pub fn update_pub_pos_and_lmt(&mut self) -> usize {
        if self.conductor.state != PublicationState::Active {
            return 0;
        }

        let mut work_count = 0;
        let producer_position = self.producer_position();
        if producer_position != self.pub_pos.get_plain() {
            self.pub_pos.set_release(producer_position);
            work_count += 1;
        }

        if self.conductor.subscribable.is_empty() {
            // Without consumers the limit collapses so producers observe
            // NOT_CONNECTED rather than filling the log.
            if self.pub_lmt.get_plain() > 0 {
                self.conductor.trip_limit = 0;
                self.pub_lmt.set_release(0);
                work_count += 1;
            }
        } else {
            let mut min_sub_pos = i64::MAX;
            let mut max_sub_pos = self.conductor.consumer_position;
            for entry in self.conductor.subscribable.iter() {
                if !entry.is_resting() {
                    let position = entry.position.get_acquire();
                    min_sub_pos = min_sub_pos.min(position);
                    max_sub_pos = max_sub_pos.max(position);
                }
            }

            if min_sub_pos != i64::MAX {
                let proposed_limit = min_sub_pos + self.term_window_length;
                if proposed_limit >= self.conductor.trip_limit {
                    self.clean_buffer(min_sub_pos);
                    self.pub_lmt.set_release(proposed_limit);
                    self.conductor.trip_limit = proposed_limit + self.trip_gain;
                    work_count += 1;
                }
                self.conductor.consumer_position = max_sub_pos;
            }
        }

        work_count
    }

    /// Zero one bounded block of consumed bytes behind `position`.
    pub fn clean_buffer(&mut self, position: i64) {
        let clean_position = self.conductor.clean_position;
        if position > clean_position {
            self.conductor.clean_position = log_buffer::clean_range(
                &self.raw_log,
                clean_position,
                position,
                self.position_bits_to_shift,
            );
        }
    }

    /// Lifecycle timer: cool-down expiry, untethered tether transitions,
    /// blocked-publisher rescue, and the Active → Draining → Linger → Done walk.
    pub fn on_time_event(&mut self, now_ns: i64) {
        match self.conductor.state {
            PublicationState::Active => {
                if self.conductor.in_cool_down && now_ns > self.conductor.cool_down_expire_time_ns {
                    self.conductor.in_cool_down = false;
                    self.conductor.cool_down_expire_time_ns = 0;
                }
                self.check_untethered_subscriptions(now_ns);
                if !self.is_exclusive {
                    let producer_position = self.producer_position();
                    self.check_for_blocked_publisher(producer_position, now_ns);
                }
            }
            PublicationState::Draining => {
                if self.is_drained() {
                    self.conductor.state = PublicationState::Linger;
                    self.conductor.time_of_last_state_change_ns = now_ns;
                } else {
                    // The limit update no longer runs, so track the slowest
                    // reader here; the usual stall gate then decides whether
                    // a dead writer is holding up the drain.
                    self.conductor.consumer_position = self
                        .conductor
                        .subscribable
                        .min_non_resting_position(i64::MAX);
                    let producer_position = self.producer_position();
                    self.check_for_blocked_publisher(producer_position, now_ns);
                }
            }
            PublicationState::Linger => {
                if now_ns - self.conductor.time_of_last_state_change_ns >= self.liveness_timeout_ns
                {
                    self.conductor.state = PublicationState::Done;
                    self.conductor.has_reached_end_of_life = true;
                    let position = self.producer_position();
                    self.listener
                        .reached_end_of_life(self.session_id, self.stream_id, position);
                }
            }
            PublicationState::Done => {}
        }
    }

    /// Detect and rescue a publisher that reserved space and never committed.
    pub fn check_for_blocked_publisher(&mut self, producer_position: i64, now_ns: i64) {
        let consumer_position = self.conductor.consumer_position;
        if consumer_position == self.conductor.last_consumer_position
            && self.is_possibly_blocked(producer_position, consumer_position)
        {
            if now_ns - self.conductor.time_of_last_consumer_position_change_ns
                >= self.unblock_timeout_ns
            {
                if self.unblock_at_consumer_position() {
                    self.system.unblocked_publications.increment();
                    self.listener.publisher_unblocked(
                        self.session_id,
                        self.stream_id,
                        consumer_position,
                    );
                }
            }
        } else {
            self.conductor.time_of_last_consumer_position_change_ns = now_ns;
            self.conductor.last_consumer_position = consumer_position;
        }
    }

    /// Administrative stop: stamp end of stream at the producer position and
    /// start draining immediately.
    pub fn revoke(&mut self, now_ns: i64) {
        if self.conductor.has_reached_end_of_life
            || self.conductor.state == PublicationState::Done
        {
            return;
        }
        let producer_position = self.producer_position();
        self.raw_log
            .metadata()
            .end_of_stream_position_release(producer_position);
        if self.conductor.state == PublicationState::Active {
            self.conductor.state = PublicationState::Draining;
            self.conductor.time_of_last_state_change_ns = now_ns;
        }
        self.system.publications_revoked.increment();
        self.listener
            .publication_revoked(self.session_id, self.stream_id, producer_position);
    }

    /// A malformed image was reported: refuse new subscriptions until the
    /// cool-down expires so the publication is not endlessly recreated.
    pub fn reject(&mut self, position: i64, reason: &str, now_ns: i64) {
        self.conductor.in_cool_down = true;
        self.conductor.cool_down_expire_time_ns = now_ns + self.liveness_timeout_ns;
        self.listener
            .publication_rejected(self.session_id, self.stream_id, position, reason);
    }

    pub fn in_cool_down(&self) -> bool {
        self.conductor.in_cool_down
    }

    /// Release every owned counter and delete the log file.
    pub fn free(mut self) -> Result<(), Error> {
        while !self.conductor.subscribable.is_empty() {
            let entry = self.conductor.subscribable.remove_at(0);
            let _ = self.counters.free(entry.counter_id);
        }
        let _ = self.counters.free(self.pub_pos.id());
        let _ = self.counters.free(self.pub_lmt.id());
        self.raw_log.free()
    }

    fn unblock_at_consumer_position(&mut self) -> bool {
        let consumer_position = self.conductor.consumer_position;
        let index = index_by_position(consumer_position, self.position_bits_to_shift);
        let term = self.raw_log.term(index);
        let meta = self.raw_log.metadata();
        unblocker::unblock_at(
            &term,
            &meta,
            consumer_position,
            self.position_bits_to_shift,
            self.initial_term_id,
        ) != UnblockOutcome::NoAction
    }

    fn check_untethered_subscriptions(&mut self, now_ns: i64) {
        let window_limit = (self.conductor.consumer_position - self.term_window_length)
            + (self.term_window_length >> 3);

        let mut index = self.conductor.subscribable.len();
        while index > 0 {
            index -= 1;
            let (state, last_change_ns, position, registration_id, is_tether) = {
                let entry = &self.conductor.subscribable.entries()[index];
                (
                    entry.state,
                    entry.time_of_last_change_ns,
                    entry.position.get_acquire(),
                    entry.registration_id,
                    entry.is_tether,
                )
            };
            if is_tether {
                continue;
            }

            match state {
                TetherState::Active => {
                    if position > window_limit {
                        self.conductor.subscribable.entries_mut()[index].time_of_last_change_ns =
                            now_ns;
                    } else if now_ns - last_change_ns >= self.untethered_window_limit_timeout_ns {
                        self.transition_tether(index, TetherState::Linger, position, now_ns);
                    }
                }
                TetherState::Linger => {
                    if now_ns - last_change_ns >= self.untethered_linger_timeout_ns {
                        self.transition_tether(index, TetherState::Resting, position, now_ns);
                    }
                }
                TetherState::Resting => {
                    if now_ns - last_change_ns >= self.untethered_resting_timeout_ns {
                        let entry = self.conductor.subscribable.remove_at(index);
                        let _ = self.counters.free(entry.counter_id);
                        let event = TetherEvent {
                            registration_id,
                            session_id: self.session_id,
                            stream_id: self.stream_id,
                            position,
                            now_ns,
                        };
                        self.listener.untethered_subscription_removed(&event);
                        if self.conductor.subscribable.is_empty() {
                            self.raw_log.metadata().is_connected_release(false);
                        }
                    }
                }
            }
        }
    }

    fn transition_tether(
        &mut self,
        index: usize,
        new_state: TetherState,
        position: i64,
        now_ns: i64,
    ) {
        let registration_id = {
            let entry = &mut self.conductor.subscribable.entries_mut()[index];
            entry.state = new_state;
            entry.time_of_last_change_ns = now_ns;
            entry.registration_id
        };
        let event = TetherEvent {
            registration_id,
            session_id: self.session_id,
            stream_id: self.stream_id,
            position,
            now_ns,
        };
        self.listener.untethered_state_change(&event, new_state);
    }
}

/// Outcome of a zero-copy claim attempt.
#[derive(Debug)]
pub enum ClaimResult<'a> {
    Claimed(BufferClaim<'a>),
    /// One of the offer sentinels; the claim was not granted.
    Refused(i64),
}

/// Append handle over a publication's log. Safe to share across writer
/// threads; every mutation goes through the wait-free claim protocol.
pub struct Publisher {
    raw_log: RawLog,
    pub_lmt: ReadablePosition,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    term_length: usize,
    max_message_length: usize,
    max_payload_length: usize,
    channel: String,
    closed: bool,
}

impl Publisher {
    pub fn offer(&self, message: &[u8]) -> Result<i64, Error> {
        self.offer_with_reserved(message, 0)
    }

    /// Non-blocking publish. Returns the new stream position, or one of
    /// `NOT_CONNECTED`, `BACK_PRESSURED`, `ADMIN_ACTION`, `CLOSED`,
    /// `MAX_POSITION_EXCEEDED`. Only misuse (an over-long message) errors.
    pub fn offer_with_reserved(&self, message: &[u8], reserved_value: i64) -> Result<i64, Error> {
        if self.closed {
            return Ok(CLOSED);
        }
        if message.len() > self.max_message_length {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("message exceeds maximum length")
                .with_channel(self.channel.clone()));
        }

        let meta = self.raw_log.metadata();
        let limit = self.pub_lmt.get_acquire();
        let term_count = meta.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = meta.raw_tail_volatile(index);
        let tail_term_id = term_id(raw_tail);
        let tail_offset = term_offset(raw_tail, self.term_length as i64);

        if term_count != compute_term_count(tail_term_id, self.initial_term_id) {
            return Ok(ADMIN_ACTION);
        }

        let term_begin = compute_term_begin_position(
            tail_term_id,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let position = term_begin + tail_offset as i64;
        if position >= limit {
            let aligned_length = align(message.len() + HEADER_LENGTH, FRAME_ALIGNMENT);
            return Ok(self.back_pressure_status(position, aligned_length));
        }

        let appender = TermAppender::new(self.raw_log.term(index), meta.tail_counter(index));
        let template = meta.default_frame_header(HEADER_LENGTH);
        let outcome = if message.len() <= self.max_payload_length {
            appender.append_unfragmented(template, message, reserved_value)
        } else {
            appender.append_fragmented(template, message, self.max_payload_length, reserved_value)
        };

        Ok(match outcome {
            AppendOutcome::Appended { resulting_offset } => term_begin + resulting_offset as i64,
            AppendOutcome::Tripped => {
                self.end_of_term_status(term_begin, term_count, tail_term_id, &meta)
            }
        })
    }

    /// Reserve a frame for zero-copy writing; the claim must fit one MTU.
    pub fn try_claim(&self, length: usize) -> Result<ClaimResult<'_>, Error> {
        if self.closed {
            return Ok(ClaimResult::Refused(CLOSED));
        }
        if length > self.max_payload_length {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("claim exceeds maximum payload length")
                .with_channel(self.channel.clone()));
        }

        let meta = self.raw_log.metadata();
        let limit = self.pub_lmt.get_acquire();
        let term_count = meta.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = meta.raw_tail_volatile(index);
        let tail_term_id = term_id(raw_tail);
        let tail_offset = term_offset(raw_tail, self.term_length as i64);

        if term_count != compute_term_count(tail_term_id, self.initial_term_id) {
            return Ok(ClaimResult::Refused(ADMIN_ACTION));
        }

        let term_begin = compute_term_begin_position(
            tail_term_id,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let position = term_begin + tail_offset as i64;
        if position >= limit {
            let aligned_length = align(length + HEADER_LENGTH, FRAME_ALIGNMENT);
            return Ok(ClaimResult::Refused(
                self.back_pressure_status(position, aligned_length),
            ));
        }

        let appender = TermAppender::new(self.raw_log.term(index), meta.tail_counter(index));
        let template = meta.default_frame_header(HEADER_LENGTH);
        Ok(match appender.claim(template, length) {
            ClaimOutcome::Claimed(mut claim) => {
                claim.set_position(term_begin + claim.resulting_offset() as i64);
                ClaimResult::Claimed(claim)
            }
            ClaimOutcome::Tripped => ClaimResult::Refused(self.end_of_term_status(
                term_begin,
                term_count,
                tail_term_id,
                &meta,
            )),
        })
    }

    /// Producer position as this handle observes it.
    pub fn position(&self) -> i64 {
        let meta = self.raw_log.metadata();
        let term_count = meta.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = meta.raw_tail_volatile(index);
        compute_position(
            term_id(raw_tail),
            term_offset(raw_tail, self.term_length as i64),
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    pub fn limit(&self) -> i64 {
        self.pub_lmt.get_acquire()
    }

    pub fn is_connected(&self) -> bool {
        self.raw_log.metadata().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    fn back_pressure_status(&self, position: i64, aligned_length: usize) -> i64 {
        if position + aligned_length as i64 >= max_possible_position(self.term_length as i32) {
            return MAX_POSITION_EXCEEDED;
        }
        if self.raw_log.metadata().is_connected() {
            BACK_PRESSURED
        } else {
            NOT_CONNECTED
        }
    }

    fn end_of_term_status(
        &self,
        term_begin: i64,
        term_count: i32,
        tail_term_id: i32,
        meta: &crate::core::layout::LogMetadata<'_>,
    ) -> i64 {
        if term_begin + self.term_length as i64
            >= max_possible_position(self.term_length as i32)
        {
            return MAX_POSITION_EXCEEDED;
        }
        log_buffer::rotate_log(meta, term_count, tail_term_id);
        ADMIN_ACTION
    }
}

/// Consumer view over a publication's log, advancing its own position counter.
#[derive(Debug)]
pub struct Image {
    raw_log: RawLog,
    subscriber_position: Position,
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    position_bits_to_shift: u32,
}

impl Image {
    /// Deliver up to `fragment_limit` data frames to `handler`, advancing the
    /// subscriber position past every consumed frame and pad.
    pub fn poll<F>(&mut self, mut handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(FrameRef<'_>),
    {
        let position = self.subscriber_position.get_plain();
        let index = index_by_position(position, self.position_bits_to_shift);
        let term_length_mask = self.raw_log.term_length() as i64 - 1;
        let offset = (position & term_length_mask) as usize;
        let term = self.raw_log.term(index);

        let outcome = read_frames(
            &term,
            offset,
            position - offset as i64,
            fragment_limit,
            &mut handler,
        );
        if outcome.offset != offset {
            self.subscriber_position
                .set_release(position + (outcome.offset - offset) as i64);
        }
        outcome.frames_read
    }

    pub fn position(&self) -> i64 {
        self.subscriber_position.get_plain()
    }

    /// Rewind or fast-forward within already-committed bounds; positions must
    /// stay frame-aligned.
    pub fn set_position(&mut self, position: i64) -> Result<(), Error> {
        if position < 0 || position as usize % FRAME_ALIGNMENT != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("position must be frame-aligned")
                .with_position(position));
        }
        self.subscriber_position.set_release(position);
        Ok(())
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.position() >= self.raw_log.metadata().end_of_stream_position()
    }

    pub fn end_of_stream_position(&self) -> i64 {
        self.raw_log.metadata().end_of_stream_position()
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }
}
